//! Instrument Adapters
//!
//! Narrow contracts for everything the scheduler drives but does not own:
//! axes, pipettes, stage motion, the plate-handling robot, teachpoints,
//! labware lookup, operator error reporting and tip handling.
//!
//! All adapters are shared across tasks and must be `Send + Sync`.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::{AxisFault, SchedulerError};
use super::types::{Labware, Plate, StageTeachpoint, Teachpoint, TipHandling};
use crate::resources::{ChannelId, StageId};

/// Single motor axis
#[async_trait]
pub trait Axis: Send + Sync {
    /// Axis name for logging and fault messages
    fn name(&self) -> &str;

    /// Move to an absolute position. With `wait == false` the call returns
    /// once the move is commanded.
    async fn move_absolute(&self, position: f64, wait: bool) -> Result<(), AxisFault>;

    async fn move_relative(&self, delta: f64) -> Result<(), AxisFault>;

    async fn home(&self) -> Result<(), AxisFault>;

    fn position_mm(&self) -> f64;
}

/// Two axes moved as one coordinated (blended) motion
#[async_trait]
pub trait BlendedAxes: Send + Sync {
    async fn move_absolute_blended(&self, x: f64, z: f64) -> Result<(), AxisFault>;

    async fn wait_for_move_complete(&self) -> Result<(), AxisFault>;
}

/// One pipetting channel
#[async_trait]
pub trait Pipette: Send + Sync {
    fn x(&self) -> &dyn Axis;
    fn z(&self) -> &dyn Axis;
    /// Plunger axis
    fn w(&self) -> &dyn Axis;
    fn xz(&self) -> &dyn BlendedAxes;

    async fn aspirate(&self, volume: f64) -> Result<(), AxisFault>;

    /// Drive the plunger to `target`. The hardware always returns to 0.
    async fn dispense(&self, target: f64) -> Result<(), AxisFault>;
}

/// Y/R positioning of one stage
#[async_trait]
pub trait StageMotion: Send + Sync {
    async fn move_yr(&self, y: f64, r: f64, wait: bool) -> Result<(), AxisFault>;

    /// Move to the hand-off position reachable by the plate robot
    async fn move_to_robot_teachpoint(&self) -> Result<(), AxisFault>;
}

/// Resolves hardware handles by arena index
pub trait Instrument: Send + Sync {
    fn pipette(&self, channel: ChannelId) -> Result<Arc<dyn Pipette>, SchedulerError>;

    fn stage(&self, stage: StageId) -> Result<Arc<dyn StageMotion>, SchedulerError>;
}

/// Plate-handling robot
#[async_trait]
pub trait PlateHandler: Send + Sync {
    /// Put `plate` down at `location`
    async fn place(&self, device: &str, location: &str, plate: &Plate)
    -> Result<(), SchedulerError>;

    /// Take `plate` away from `location`
    async fn pick(&self, device: &str, location: &str, plate: &Plate) -> Result<(), SchedulerError>;
}

/// Calibrated coordinates
pub trait TeachpointLookup: Send + Sync {
    fn stage_teachpoint(
        &self,
        channel: ChannelId,
        stage: StageId,
    ) -> Result<StageTeachpoint, SchedulerError>;

    fn well_position(
        &self,
        channel: ChannelId,
        stage: StageId,
        well: &str,
        well_count: u16,
    ) -> Result<Teachpoint, SchedulerError>;
}

pub trait LabwareCatalog: Send + Sync {
    fn labware(&self, name: &str) -> Result<Labware, SchedulerError>;
}

/// Operator-facing error prompt
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    /// Block until one of `options` is chosen and return it.
    async fn report_error(&self, message: &str, options: &[&str]) -> String;
}

/// Post-transfer tip wash / change protocol
#[async_trait]
pub trait TipHandler: Send + Sync {
    async fn run(&self, channel: ChannelId, handling: TipHandling) -> Result<(), SchedulerError>;
}

/// Every collaborator a run needs, shared by all tasks
#[derive(Clone)]
pub struct Collaborators {
    pub instrument: Arc<dyn Instrument>,
    pub plate_handler: Arc<dyn PlateHandler>,
    pub teachpoints: Arc<dyn TeachpointLookup>,
    pub labware: Arc<dyn LabwareCatalog>,
    pub error_reporter: Arc<dyn ErrorReporter>,
    pub tip_handler: Arc<dyn TipHandler>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
