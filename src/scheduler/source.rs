//! Source Plate Worker
//!
//! Loads one source plate, fans out one unit per transfer and unloads the
//! plate once every unit joined.
//!
//! # Channel budget
//!
//! A worker starts with the full channel count if it is the only source for
//! its destination, otherwise with half of it (at least one). As soon as the
//! shared [`SourcePlateCounter`] reports that this is the last plate still
//! in progress, the budget is raised to the full count for every later
//! dispatch. Raised budgets are never lowered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::SchedulerContext;
use crate::resources::{StageId, StageMode};
use crate::transfer::{Plate, SchedulerError, Transfer, TransferOutcome, TransferRun};

/// Countdown of source plates still in progress for one destination
#[derive(Debug)]
pub struct SourcePlateCounter {
    remaining: AtomicUsize,
    changed: Notify,
}

impl SourcePlateCounter {
    pub fn new(plates: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(plates),
            changed: Notify::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Returns the new count. Saturates at zero.
    pub fn decrement(&self) -> usize {
        let prev = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        self.changed.notify_waiters();
        prev.saturating_sub(1)
    }

    /// True once at most one plate is still being processed
    pub fn on_last_plate(&self) -> bool {
        self.remaining() <= 1
    }

    pub fn notified(&self) -> Notified<'_> {
        self.changed.notified()
    }
}

#[derive(Debug)]
struct BudgetState {
    limit: usize,
    in_use: usize,
    peak: usize,
    /// Peak while the limit was still the initial one
    initial_peak: usize,
}

/// Counting gate over in-flight units of one worker
#[derive(Debug)]
pub struct ChannelBudget {
    total: usize,
    initial: usize,
    state: Mutex<BudgetState>,
    freed: Notify,
}

impl ChannelBudget {
    pub fn new(initial: usize, total: usize) -> Arc<Self> {
        let initial = initial.clamp(1, total.max(1));
        Arc::new(Self {
            total: total.max(1),
            initial,
            state: Mutex::new(BudgetState {
                limit: initial,
                in_use: 0,
                peak: 0,
                initial_peak: 0,
            }),
            freed: Notify::new(),
        })
    }

    /// Initial budget for a worker whose destination has `unique_sources`
    /// source plates.
    pub fn initial_for(unique_sources: usize, total: usize) -> usize {
        if unique_sources <= 1 {
            total
        } else {
            (total / 2).max(1)
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn initial(&self) -> usize {
        self.initial
    }

    pub fn limit(&self) -> usize {
        self.lock_state().limit
    }

    pub fn in_use(&self) -> usize {
        self.lock_state().in_use
    }

    /// Highest number of slots ever held at once
    pub fn peak(&self) -> usize {
        self.lock_state().peak
    }

    /// Highest number of slots held at once before any escalation
    pub fn initial_peak(&self) -> usize {
        self.lock_state().initial_peak
    }

    /// Raise the limit to the channel count. Returns true if it changed.
    pub fn raise_to_total(&self) -> bool {
        let raised = {
            let mut state = self.lock_state();
            if state.limit < self.total {
                state.limit = self.total;
                true
            } else {
                false
            }
        };
        if raised {
            self.freed.notify_waiters();
        }
        raised
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<BudgetSlot> {
        let mut state = self.lock_state();
        if state.in_use >= state.limit {
            return None;
        }
        state.in_use += 1;
        state.peak = state.peak.max(state.in_use);
        if state.limit == self.initial {
            state.initial_peak = state.initial_peak.max(state.in_use);
        }
        Some(BudgetSlot {
            budget: self.clone(),
        })
    }

    pub fn notified(&self) -> Notified<'_> {
        self.freed.notified()
    }

    fn release(&self) {
        {
            let mut state = self.lock_state();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.freed.notify_waiters();
    }
}

/// One unit's share of the budget. Returned on drop.
#[derive(Debug)]
pub struct BudgetSlot {
    budget: Arc<ChannelBudget>,
}

impl Drop for BudgetSlot {
    fn drop(&mut self) {
        self.budget.release();
    }
}

/// What one worker did
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub source: Plate,
    pub stage: StageId,
    pub initial_budget: usize,
    pub final_budget: usize,
    pub peak_concurrency: usize,
    pub peak_before_escalation: usize,
    pub outcomes: Vec<TransferOutcome>,
}

impl WorkerReport {
    pub fn summary(&self) -> SourceSummary {
        SourceSummary {
            source: self.source.barcode.clone(),
            stage: self.stage.0,
            transfers: self.outcomes.len(),
            retries: self.outcomes.iter().map(|o| o.retries).sum(),
            initial_budget: self.initial_budget,
            final_budget: self.final_budget,
            peak_concurrency: self.peak_concurrency,
            peak_before_escalation: self.peak_before_escalation,
        }
    }
}

/// Serializable per-source summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub source: String,
    pub stage: u8,
    pub transfers: usize,
    pub retries: u32,
    pub initial_budget: usize,
    pub final_budget: usize,
    pub peak_concurrency: usize,
    pub peak_before_escalation: usize,
}

type UnitResult = Result<(Arc<Transfer>, TransferOutcome), (Arc<Transfer>, SchedulerError)>;

/// Processes every transfer from one source plate into one destination plate
pub struct SourcePlateWorker {
    ctx: Arc<SchedulerContext>,
    source: Plate,
    destination_stage: StageId,
    transfers: Vec<Arc<Transfer>>,
    counter: Arc<SourcePlateCounter>,
    budget: Arc<ChannelBudget>,
}

impl SourcePlateWorker {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        source: Plate,
        destination_stage: StageId,
        transfers: Vec<Arc<Transfer>>,
        counter: Arc<SourcePlateCounter>,
        unique_sources: usize,
    ) -> Self {
        let total = ctx.pool.channel_count() as usize;
        let budget = ChannelBudget::new(ChannelBudget::initial_for(unique_sources, total), total);
        Self {
            ctx,
            source,
            destination_stage,
            transfers,
            counter,
            budget,
        }
    }

    pub fn budget(&self) -> &Arc<ChannelBudget> {
        &self.budget
    }

    /// Load, transfer, decrement the counter, unload.
    ///
    /// On failure the counter is still decremented but the plate stays on
    /// its stage.
    pub async fn run(self) -> Result<WorkerReport, SchedulerError> {
        info!(
            source = %self.source.barcode,
            transfers = self.transfers.len(),
            budget = self.budget.initial(),
            "Source plate worker started"
        );

        let result = self.load_and_transfer().await;
        let remaining = self.counter.decrement();
        self.ctx.stats.incr_source_plates_completed();
        debug!(source = %self.source.barcode, remaining, "Source plate counter decremented");

        let (stage, outcomes) = result?;
        self.ctx.unload_plate(stage, &self.source).await?;

        info!(
            source = %self.source.barcode,
            transfers = outcomes.len(),
            peak = self.budget.peak(),
            "Source plate worker finished"
        );

        Ok(WorkerReport {
            source: self.source.clone(),
            stage,
            initial_budget: self.budget.initial(),
            final_budget: self.budget.limit(),
            peak_concurrency: self.budget.peak(),
            peak_before_escalation: self.budget.initial_peak(),
            outcomes,
        })
    }

    async fn load_and_transfer(&self) -> Result<(StageId, Vec<TransferOutcome>), SchedulerError> {
        let stage = self.ctx.load_plate(StageMode::Source, &self.source).await?;

        let mut units: JoinSet<UnitResult> = JoinSet::new();
        let mut outcomes = Vec::with_capacity(self.transfers.len());
        let mut first_error: Option<SchedulerError> = None;

        for transfer in &self.transfers {
            while let Some(joined) = units.try_join_next() {
                self.collect(joined, &mut outcomes, &mut first_error);
            }
            if first_error.is_some() {
                break;
            }

            let slot = match self.acquire_slot().await {
                Ok(slot) => slot,
                Err(e) => {
                    first_error.get_or_insert(e);
                    break;
                }
            };
            while let Some(joined) = units.try_join_next() {
                self.collect(joined, &mut outcomes, &mut first_error);
            }
            if first_error.is_some() {
                break;
            }

            self.ctx.stats.incr_dispatched();
            self.ctx
                .wells
                .reserve(&transfer.destination.barcode, &transfer.destination_wells);

            let ctx = self.ctx.clone();
            let transfer = transfer.clone();
            let source_stage = stage;
            let destination_stage = self.destination_stage;
            units.spawn(async move {
                let _slot = slot;
                run_unit(ctx, transfer, source_stage, destination_stage).await
            });
        }

        while let Some(joined) = units.join_next().await {
            self.collect(joined, &mut outcomes, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok((stage, outcomes)),
        }
    }

    /// Wait for a budget slot, re-evaluating escalation whenever the
    /// counter or the budget changes.
    async fn acquire_slot(&self) -> Result<BudgetSlot, SchedulerError> {
        loop {
            let counter_changed = self.counter.notified();
            let slot_freed = self.budget.notified();
            tokio::pin!(counter_changed, slot_freed);
            counter_changed.as_mut().enable();
            slot_freed.as_mut().enable();

            if self.counter.on_last_plate() && self.budget.raise_to_total() {
                self.ctx.stats.incr_escalations();
                info!(
                    source = %self.source.barcode,
                    budget = self.budget.limit(),
                    "Last source plate in progress, channel budget raised"
                );
            }
            if let Some(slot) = self.budget.try_acquire() {
                return Ok(slot);
            }
            self.ctx.abort.check()?;

            tokio::select! {
                _ = &mut counter_changed => {}
                _ = &mut slot_freed => {}
                _ = self.ctx.abort.aborted() => return Err(SchedulerError::Aborted),
            }
        }
    }

    fn collect(
        &self,
        joined: Result<UnitResult, tokio::task::JoinError>,
        outcomes: &mut Vec<TransferOutcome>,
        first_error: &mut Option<SchedulerError>,
    ) {
        match joined {
            Ok(Ok((transfer, outcome))) => {
                self.ctx
                    .wells
                    .mark_used(&transfer.destination.barcode, &transfer.destination_wells);
                self.ctx.stats.incr_completed();
                self.ctx.stats.add_retries(outcome.retries);
                outcomes.push(outcome);
            }
            Ok(Err((transfer, e))) => {
                self.ctx
                    .wells
                    .release(&transfer.destination.barcode, &transfer.destination_wells);
                self.ctx.stats.incr_failed();
                error!(
                    source = %self.source.barcode,
                    transfer = %transfer,
                    code = e.code(),
                    error = %e,
                    "Transfer failed"
                );
                first_error.get_or_insert(e);
            }
            Err(join_error) => {
                self.ctx.stats.incr_failed();
                error!(source = %self.source.barcode, error = %join_error, "Transfer task failed");
                first_error.get_or_insert(join_error.into());
            }
        }
    }
}

/// One transfer: take a channel, run the state machine, give the channel back.
async fn run_unit(
    ctx: Arc<SchedulerContext>,
    transfer: Arc<Transfer>,
    source_stage: StageId,
    destination_stage: StageId,
) -> UnitResult {
    let channel = match ctx.pool.request_channel(&ctx.abort).await {
        Ok(channel) => channel,
        Err(e) => return Err((transfer, e)),
    };

    let run = TransferRun::new(transfer.clone(), channel.id(), source_stage, destination_stage);
    let result = ctx.machine().execute(run).await;
    ctx.pool.unlock_channel(channel);

    match result {
        Ok(outcome) => Ok((transfer, outcome)),
        Err(e) => Err((transfer, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{AbortSignal, ChannelId};
    use crate::scheduler::{SchedulerSettings, WellUsage};
    use crate::sim::SimRig;
    use crate::transfer::TipHandling;
    use crate::transfer::adapters::TipHandler;
    use async_trait::async_trait;

    #[test]
    fn test_initial_budget() {
        assert_eq!(ChannelBudget::initial_for(1, 4), 4);
        assert_eq!(ChannelBudget::initial_for(2, 4), 2);
        assert_eq!(ChannelBudget::initial_for(3, 4), 2);
        assert_eq!(ChannelBudget::initial_for(3, 1), 1);
        assert_eq!(ChannelBudget::initial_for(2, 3), 1);
    }

    #[test]
    fn test_budget_gate_and_raise() {
        let budget = ChannelBudget::new(2, 4);
        let a = budget.try_acquire().unwrap();
        let _b = budget.try_acquire().unwrap();
        assert!(budget.try_acquire().is_none());
        assert_eq!(budget.initial_peak(), 2);

        assert!(budget.raise_to_total());
        assert!(!budget.raise_to_total());
        let _c = budget.try_acquire().unwrap();
        let _d = budget.try_acquire().unwrap();
        assert!(budget.try_acquire().is_none());
        assert_eq!(budget.peak(), 4);
        assert_eq!(budget.initial_peak(), 2);

        drop(a);
        assert_eq!(budget.in_use(), 3);
        assert_eq!(budget.limit(), 4);
    }

    #[test]
    fn test_counter() {
        let counter = SourcePlateCounter::new(3);
        assert!(!counter.on_last_plate());
        assert_eq!(counter.decrement(), 2);
        assert!(!counter.on_last_plate());
        assert_eq!(counter.decrement(), 1);
        assert!(counter.on_last_plate());
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.decrement(), 0);
    }

    /// Records the counter value seen by each tip handling run
    struct CounterProbe {
        counter: Arc<SourcePlateCounter>,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl TipHandler for CounterProbe {
        async fn run(&self, _channel: ChannelId, _handling: TipHandling) -> Result<(), SchedulerError> {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            self.seen.lock().unwrap().push(self.counter.remaining());
            Ok(())
        }
    }

    fn transfers(source: &str, n: usize) -> Vec<Arc<Transfer>> {
        (0..n)
            .map(|i| {
                Arc::new(
                    Transfer::new(
                        Plate::source(source, "96 well"),
                        format!("A{}", i + 1),
                        Plate::destination("D1", "384 well"),
                        vec![format!("B{}", i + 1)],
                        3.0,
                        TipHandling::Wash,
                    )
                    .unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_decrements_only_after_units_complete() {
        let rig = SimRig::standard(2);
        let counter = Arc::new(SourcePlateCounter::new(1));
        let probe = Arc::new(CounterProbe {
            counter: counter.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let mut collaborators = rig.collaborators();
        collaborators.tip_handler = probe.clone() as Arc<dyn TipHandler>;

        let ctx = SchedulerContext::new(
            rig.pool.clone(),
            collaborators,
            SchedulerSettings::default(),
            AbortSignal::new(),
        );
        let dest_stage = ctx
            .load_plate(StageMode::Destination, &Plate::destination("D1", "384 well"))
            .await
            .unwrap();

        let worker = SourcePlateWorker::new(
            ctx.clone(),
            Plate::source("P1", "96 well"),
            dest_stage,
            transfers("P1", 4),
            counter.clone(),
            1,
        );
        assert_eq!(worker.budget().initial(), 2);

        let report = worker.run().await.unwrap();
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(*probe.seen.lock().unwrap(), vec![1, 1, 1, 1]);
        assert_eq!(counter.remaining(), 0);

        // Plate left its stage, wells are used
        let snap = rig.pool.stage_snapshot(report.stage).unwrap();
        assert!(!snap.loaded && !snap.is_locked());
        assert_eq!(ctx.wells.usage("D1", "B3"), WellUsage::Used);
        assert_eq!(ctx.wells.used_count("D1"), 4);
    }

    #[tokio::test]
    async fn test_failed_unit_leaves_plate_and_still_decrements() {
        let rig = SimRig::standard(2);
        rig.tip_handler.fail_next(1);
        let ctx = SchedulerContext::new(
            rig.pool.clone(),
            rig.collaborators(),
            SchedulerSettings::default(),
            AbortSignal::new(),
        );
        let dest_stage = ctx
            .load_plate(StageMode::Destination, &Plate::destination("D1", "384 well"))
            .await
            .unwrap();

        let counter = Arc::new(SourcePlateCounter::new(2));
        let worker = SourcePlateWorker::new(
            ctx.clone(),
            Plate::source("P1", "96 well"),
            dest_stage,
            transfers("P1", 3),
            counter.clone(),
            2,
        );
        let err = worker.run().await.unwrap_err();

        assert_eq!(err.code(), "TIP_HANDLING");
        assert_eq!(counter.remaining(), 1);

        let stage = rig.pool.stage_holding("P1").expect("plate stays on its stage");
        let snap = rig.pool.stage_snapshot(stage).unwrap();
        assert!(snap.loaded);
        assert!(!snap.is_locked());
        for id in rig.pool.channel_ids() {
            assert_eq!(rig.pool.channel_locked(id), Some(false));
        }
        assert_eq!(ctx.stats.snapshot().transfers_failed, 1);
    }
}
