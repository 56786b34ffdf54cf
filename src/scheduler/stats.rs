//! Run counters
//!
//! Lock-free counters shared by every task of one scheduler run.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one scheduler run
#[derive(Debug, Default)]
pub struct RunStats {
    /// Destination plates fully processed
    pub destinations_completed: AtomicU64,
    /// Source plates whose workers finished
    pub source_plates_completed: AtomicU64,
    pub transfers_dispatched: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
    /// Operator retries across all transfers
    pub operator_retries: AtomicU64,
    /// Times a worker raised its channel budget to the full channel count
    pub budget_escalations: AtomicU64,
    pub plates_loaded: AtomicU64,
    pub plates_unloaded: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr_destinations_completed(&self) {
        self.destinations_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_source_plates_completed(&self) {
        self.source_plates_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_dispatched(&self) {
        self.transfers_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_retries(&self, n: u32) {
        self.operator_retries.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_escalations(&self) {
        self.budget_escalations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_loaded(&self) {
        self.plates_loaded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_unloaded(&self) {
        self.plates_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            destinations_completed: self.destinations_completed.load(Ordering::Relaxed),
            source_plates_completed: self.source_plates_completed.load(Ordering::Relaxed),
            transfers_dispatched: self.transfers_dispatched.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            operator_retries: self.operator_retries.load(Ordering::Relaxed),
            budget_escalations: self.budget_escalations.load(Ordering::Relaxed),
            plates_loaded: self.plates_loaded.load(Ordering::Relaxed),
            plates_unloaded: self.plates_unloaded.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of stats (for reporting)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatsSnapshot {
    pub destinations_completed: u64,
    pub source_plates_completed: u64,
    pub transfers_dispatched: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub operator_retries: u64,
    pub budget_escalations: u64,
    pub plates_loaded: u64,
    pub plates_unloaded: u64,
}

impl std::fmt::Display for RunStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Run Stats: destinations={}, sources={}, transfers={}/{} (failed={}), retries={}, escalations={}, plates loaded={} unloaded={}",
            self.destinations_completed,
            self.source_plates_completed,
            self.transfers_completed,
            self.transfers_dispatched,
            self.transfers_failed,
            self.operator_retries,
            self.budget_escalations,
            self.plates_loaded,
            self.plates_unloaded
        )
    }
}
