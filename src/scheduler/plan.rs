//! Transfer Plan Manager
//!
//! Pending transfer set, grouped by destination plate in first-seen order.
//! Completing a destination removes its transfers, so grouping again only
//! reflects remaining work.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::transfer::{Plate, SchedulerError, Transfer};

/// All pending transfers for one destination plate
#[derive(Debug, Clone)]
pub struct DestinationGroup {
    pub destination: Plate,
    pub transfers: Vec<Arc<Transfer>>,
}

impl DestinationGroup {
    /// Source plates of this group, deduplicated by barcode
    pub fn unique_sources(&self) -> Vec<Plate> {
        TransferPlanManager::unique_sources(&self.transfers)
    }

    /// Transfers drawing from `barcode`, in plan order
    pub fn transfers_from(&self, barcode: &str) -> Vec<Arc<Transfer>> {
        self.transfers
            .iter()
            .filter(|t| t.source.barcode == barcode)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct TransferPlanManager {
    pending: Vec<Arc<Transfer>>,
}

impl TransferPlanManager {
    /// Build from a flat plan. Every transfer is validated up front.
    pub fn new(transfers: Vec<Transfer>) -> Result<Self, SchedulerError> {
        for t in &transfers {
            t.validate()?;
        }
        Ok(Self {
            pending: transfers.into_iter().map(Arc::new).collect(),
        })
    }

    /// Group the remaining transfers by destination barcode, first-seen order.
    pub fn group_by_destination(&self) -> Vec<DestinationGroup> {
        let mut index: FxHashMap<&str, usize> = FxHashMap::default();
        let mut groups: Vec<DestinationGroup> = Vec::new();

        for t in &self.pending {
            let slot = *index.entry(t.destination.barcode.as_str()).or_insert_with(|| {
                groups.push(DestinationGroup {
                    destination: t.destination.clone(),
                    transfers: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].transfers.push(t.clone());
        }
        groups
    }

    /// Source plates referenced by `transfers`, deduplicated by barcode in
    /// first-seen order.
    pub fn unique_sources(transfers: &[Arc<Transfer>]) -> Vec<Plate> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        transfers
            .iter()
            .filter(|t| seen.insert(t.source.barcode.as_str()))
            .map(|t| t.source.clone())
            .collect()
    }

    /// The destination that would be processed next
    pub fn next_destination(&self) -> Option<DestinationGroup> {
        let first = self.pending.first()?;
        let barcode = first.destination.barcode.as_str();
        Some(DestinationGroup {
            destination: first.destination.clone(),
            transfers: self
                .pending
                .iter()
                .filter(|t| t.destination.barcode == barcode)
                .cloned()
                .collect(),
        })
    }

    /// Drop every pending transfer for `barcode`. Returns how many were removed.
    pub fn complete_destination(&mut self, barcode: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|t| t.destination.barcode != barcode);
        before - self.pending.len()
    }

    /// Distinct destination plates still pending
    pub fn destination_count(&self) -> usize {
        self.pending
            .iter()
            .map(|t| t.destination.barcode.as_str())
            .collect::<FxHashSet<_>>()
            .len()
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
