//! Hitpick Engine - liquid transfer scheduling
//!
//! Schedules well-to-well liquid transfers on a multi-channel, multi-stage
//! pipetting instrument. Plates are brought onto stages, channels run one
//! aspirate/dispense cycle per transfer, and stages and channels are never
//! shared between two actors at once.
//!
//! # Modules
//!
//! - [`transfer`] - Per-transfer motion state machine and adapter contracts
//! - [`resources`] - Stage/channel pool and the abort signal
//! - [`scheduler`] - Destination and source plate fan-out, plan grouping
//! - [`sim`] - Simulated instrument for dry runs and tests
//! - [`plan_io`] - CSV plan loading, JSON summaries
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod logging;
pub mod plan_io;
pub mod resources;
pub mod scheduler;
pub mod sim;
pub mod transfer;

// Convenient re-exports at crate root
pub use resources::{AbortSignal, ChannelId, ResourcePool, StageId, StageMode};
pub use scheduler::{
    DestinationPlateScheduler, RunSummary, SchedulerContext, SchedulerSettings, TransferPlanManager,
};
pub use transfer::{
    AxisFault, Plate, SchedulerError, TipHandling, Transfer, TransferState, TransferStateMachine,
};
