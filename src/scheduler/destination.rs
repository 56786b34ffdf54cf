//! Destination Plate Scheduler
//!
//! Top-level driver. Destination plates are processed strictly one at a
//! time; the source plates feeding one destination run concurrently.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::plan::{DestinationGroup, TransferPlanManager};
use super::source::{SourcePlateCounter, SourcePlateWorker, SourceSummary, WorkerReport};
use super::stats::RunStatsSnapshot;
use super::SchedulerContext;
use crate::resources::{StageId, StageMode};
use crate::transfer::SchedulerError;

/// What happened to one destination plate
#[derive(Debug, Clone, Serialize)]
pub struct DestinationSummary {
    pub destination: String,
    pub stage: u8,
    pub sources: Vec<SourceSummary>,
    pub transfers: usize,
    pub used_wells: usize,
    #[serde(skip)]
    pub workers: Vec<WorkerReport>,
}

/// Result of a complete run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub destinations: Vec<DestinationSummary>,
    pub stats: RunStatsSnapshot,
}

pub struct DestinationPlateScheduler {
    ctx: Arc<SchedulerContext>,
}

impl DestinationPlateScheduler {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    /// Process every pending transfer. Completed destinations are removed
    /// from `plan`; on error the failing destination stays pending.
    pub async fn run(&self, plan: &mut TransferPlanManager) -> Result<RunSummary, SchedulerError> {
        let started_at = Utc::now();
        let destination_count = plan.destination_count();
        info!(
            destinations = destination_count,
            transfers = plan.remaining(),
            channels = self.ctx.pool.channel_count(),
            "Transfer run started"
        );

        let mut destinations = Vec::with_capacity(destination_count);
        while let Some(group) = plan.next_destination() {
            self.ctx.abort.check()?;
            let summary = self.process_destination(&group).await?;
            plan.complete_destination(&group.destination.barcode);
            destinations.push(summary);
        }

        let stats = self.ctx.stats.snapshot();
        info!(%stats, "Transfer run finished");

        Ok(RunSummary {
            started_at,
            finished_at: Utc::now(),
            destinations,
            stats,
        })
    }

    async fn process_destination(
        &self,
        group: &DestinationGroup,
    ) -> Result<DestinationSummary, SchedulerError> {
        let destination = &group.destination;
        let stage = self
            .ctx
            .load_plate(StageMode::Destination, destination)
            .await?;

        let sources = group.unique_sources();
        let counter = Arc::new(SourcePlateCounter::new(sources.len()));
        info!(
            destination = %destination.barcode,
            stage = %stage,
            sources = sources.len(),
            transfers = group.transfers.len(),
            "Processing destination plate"
        );

        let mut workers: JoinSet<Result<WorkerReport, SchedulerError>> = JoinSet::new();
        for source in &sources {
            let worker = SourcePlateWorker::new(
                self.ctx.clone(),
                source.clone(),
                stage,
                group.transfers_from(&source.barcode),
                counter.clone(),
                sources.len(),
            );
            workers.spawn(worker.run());
        }

        let mut reports = Vec::with_capacity(sources.len());
        let mut first_error: Option<SchedulerError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    error!(destination = %destination.barcode, code = e.code(), error = %e, "Source plate worker failed");
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(destination = %destination.barcode, error = %join_error, "Source plate worker panicked");
                    first_error.get_or_insert(join_error.into());
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.park_channels().await?;
        self.ctx.unload_plate(stage, destination).await?;
        self.ctx.stats.incr_destinations_completed();

        reports.sort_by_key(|r| {
            sources
                .iter()
                .position(|s| s.barcode == r.source.barcode)
                .unwrap_or(usize::MAX)
        });

        Ok(DestinationSummary {
            destination: destination.barcode.clone(),
            stage: stage.0,
            transfers: reports.iter().map(|r| r.outcomes.len()).sum(),
            sources: reports.iter().map(WorkerReport::summary).collect(),
            used_wells: self.ctx.wells.used_count(&destination.barcode),
            workers: reports,
        })
    }

    /// Retract every channel's Z before the destination plate is moved.
    async fn park_channels(&self) -> Result<(), SchedulerError> {
        for channel in self.ctx.pool.channel_ids() {
            let pipette = self.ctx.collaborators.instrument.pipette(channel)?;
            self.ctx
                .abort
                .guard(pipette.z().move_absolute(0.0, true))
                .await?
                .map_err(|f| SchedulerError::ParkChannels(format!("channel {}: {}", channel, f)))?;
        }
        Ok(())
    }

    /// Stage currently holding a destination plate, if any
    pub fn destination_stage(&self, barcode: &str) -> Option<StageId> {
        self.ctx.pool.stage_holding(barcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::AbortSignal;
    use crate::scheduler::SchedulerSettings;
    use crate::sim::{PlateEventKind, SimRig};
    use crate::transfer::{Plate, TipHandling, Transfer};

    fn t(src: &str, well: &str, dst: &str) -> Transfer {
        Transfer::new(
            Plate::source(src, "96 well"),
            well,
            Plate::destination(dst, "384 well"),
            vec![well.to_string()],
            4.0,
            TipHandling::None,
        )
        .unwrap()
    }

    fn scheduler(rig: &SimRig) -> DestinationPlateScheduler {
        DestinationPlateScheduler::new(SchedulerContext::new(
            rig.pool.clone(),
            rig.collaborators(),
            SchedulerSettings::default(),
            AbortSignal::new(),
        ))
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let rig = SimRig::standard(2);
        let mut plan = TransferPlanManager::new(Vec::new()).unwrap();
        let summary = scheduler(&rig).run(&mut plan).await.unwrap();
        assert!(summary.destinations.is_empty());
        assert!(rig.plate_handler.events().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_destinations_processed_in_order() {
        let rig = SimRig::standard(2);
        let mut plan = TransferPlanManager::new(vec![
            t("P1", "A1", "D2"),
            t("P1", "A2", "D1"),
            t("P2", "A3", "D2"),
        ])
        .unwrap();

        let summary = scheduler(&rig).run(&mut plan).await.unwrap();
        assert!(plan.is_empty());

        let order: Vec<_> = summary.destinations.iter().map(|d| d.destination.as_str()).collect();
        assert_eq!(order, vec!["D2", "D1"]);
        assert_eq!(summary.destinations[0].transfers, 2);
        assert_eq!(summary.destinations[0].used_wells, 2);
        assert_eq!(summary.stats.transfers_completed, 3);

        // D1 is placed only after D2 was picked
        let events = rig.plate_handler.events();
        let d2_pick = events
            .iter()
            .position(|e| e.kind == PlateEventKind::Pick && e.barcode == "D2")
            .unwrap();
        let d1_place = events
            .iter()
            .position(|e| e.kind == PlateEventKind::Place && e.barcode == "D1")
            .unwrap();
        assert!(d2_pick < d1_place);

        for stage in rig.pool.stage_ids() {
            let snap = rig.pool.stage_snapshot(stage).unwrap();
            assert!(!snap.loaded && !snap.is_locked());
        }
    }

    #[tokio::test]
    async fn test_worker_failure_keeps_destination_loaded() {
        let rig = SimRig::standard(2);
        rig.plate_handler.fail_place_of("P2");
        let mut plan =
            TransferPlanManager::new(vec![t("P1", "A1", "D1"), t("P2", "A2", "D1")]).unwrap();

        let err = scheduler(&rig).run(&mut plan).await.unwrap_err();
        assert_eq!(err.code(), "PLATE_HANDLING");

        assert_eq!(plan.remaining(), 2);
        assert!(rig.pool.stage_holding("D1").is_some());
        assert_eq!(rig.plate_handler.count(PlateEventKind::Pick, "D1"), 0);
    }
}
