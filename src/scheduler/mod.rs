//! Transfer Scheduling
//!
//! Hierarchical fan-out over a transfer plan:
//!
//! ```text
//! DestinationPlateScheduler      one destination plate at a time
//!   └── SourcePlateWorker        one task per unique source plate
//!         └── transfer unit      one task per transfer, gated by ChannelBudget
//!               └── TransferStateMachine
//! ```
//!
//! # Ordering
//!
//! 1. A stage's `loaded` flag is committed before its lock is released
//! 2. A worker unloads its source plate only after all of its units joined
//! 3. The destination plate is unloaded only after all workers joined

pub mod destination;
pub mod plan;
pub mod source;
pub mod stats;
pub mod wells;

use std::sync::Arc;

use tracing::info;

pub use destination::{DestinationPlateScheduler, DestinationSummary, RunSummary};
pub use plan::{DestinationGroup, TransferPlanManager};
pub use source::{
    BudgetSlot, ChannelBudget, SourcePlateCounter, SourcePlateWorker, SourceSummary, WorkerReport,
};
pub use stats::{RunStats, RunStatsSnapshot};
pub use wells::{DestinationWellMap, WellUsage};

use crate::resources::{AbortSignal, ResourcePool, StageId, StageMode};
use crate::transfer::{Collaborators, Plate, SchedulerError, TransferStateMachine};

/// Static scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Plate-handling robot device name
    pub device_name: String,
    /// Stage location names are `"{prefix} {stage id}"`
    pub location_prefix: String,
    pub preaspirate: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            device_name: "Plate Handler".to_string(),
            location_prefix: "BB PM".to_string(),
            preaspirate: crate::transfer::machine::DEFAULT_PREASPIRATE,
        }
    }
}

/// Everything shared by the tasks of one scheduler run
#[derive(Debug)]
pub struct SchedulerContext {
    pub pool: Arc<ResourcePool>,
    pub collaborators: Collaborators,
    pub settings: SchedulerSettings,
    pub abort: AbortSignal,
    pub stats: Arc<RunStats>,
    pub wells: Arc<DestinationWellMap>,
}

impl SchedulerContext {
    pub fn new(
        pool: Arc<ResourcePool>,
        collaborators: Collaborators,
        settings: SchedulerSettings,
        abort: AbortSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            collaborators,
            settings,
            abort,
            stats: Arc::new(RunStats::new()),
            wells: Arc::new(DestinationWellMap::new()),
        })
    }

    /// Robot location name of a stage
    pub fn location(&self, stage: StageId) -> String {
        format!("{} {}", self.settings.location_prefix, stage)
    }

    pub fn machine(&self) -> TransferStateMachine {
        TransferStateMachine::new(
            self.pool.clone(),
            self.collaborators.clone(),
            self.abort.clone(),
        )
        .with_preaspirate(self.settings.preaspirate)
    }

    /// Lock a free stage of `mode`, put `plate` on it, mark it loaded and
    /// unlock it again.
    pub async fn load_plate(&self, mode: StageMode, plate: &Plate) -> Result<StageId, SchedulerError> {
        let mut lease = self.pool.request_stage(mode, &self.abort).await?;
        let stage = lease.id();

        let motion = self.collaborators.instrument.stage(stage)?;
        self.abort
            .guard(motion.move_to_robot_teachpoint())
            .await?
            .map_err(|f| SchedulerError::StageMotion(f.to_string()))?;
        self.abort.check()?;

        let location = self.location(stage);
        self.abort
            .guard(
                self.collaborators
                    .plate_handler
                    .place(&self.settings.device_name, &location, plate),
            )
            .await??;

        lease.mark_loaded(&plate.barcode);
        self.pool.unlock_stage(lease);
        self.stats.incr_loaded();

        info!(plate = %plate.barcode, stage = %stage, mode = %mode, "Plate loaded");
        Ok(stage)
    }

    /// Re-acquire `stage`, take `plate` off it, clear loaded and unlock.
    pub async fn unload_plate(&self, stage: StageId, plate: &Plate) -> Result<(), SchedulerError> {
        let mut lease = self.pool.acquire_stage(stage, &self.abort).await?;

        let motion = self.collaborators.instrument.stage(stage)?;
        self.abort
            .guard(motion.move_to_robot_teachpoint())
            .await?
            .map_err(|f| SchedulerError::StageMotion(f.to_string()))?;

        let location = self.location(stage);
        self.abort
            .guard(
                self.collaborators
                    .plate_handler
                    .pick(&self.settings.device_name, &location, plate),
            )
            .await??;

        lease.mark_unloaded();
        self.pool.unlock_stage(lease);
        self.stats.incr_unloaded();

        info!(plate = %plate.barcode, stage = %stage, "Plate unloaded");
        Ok(())
    }
}
