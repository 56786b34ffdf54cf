//! Scheduler Error Types
//!
//! Motion faults are recoverable and never leave the state machine; every
//! other failure is a [`SchedulerError`] that propagates to the caller.

use thiserror::Error;

/// Failure reported by a single axis (or a blended axis pair).
///
/// Always routed through the operator retry loop.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{axis}: {message}")]
pub struct AxisFault {
    pub axis: String,
    pub message: String,
}

impl AxisFault {
    pub fn new(axis: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            axis: axis.into(),
            message: message.into(),
        }
    }
}

/// Scheduler error types
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    // === Collaborator Failures ===
    #[error("Tip handling failed on channel {channel}: {message}")]
    TipHandling { channel: u8, message: String },

    #[error("Plate handling failed for {barcode}: {message}")]
    PlateHandling { barcode: String, message: String },

    #[error("Stage motion failed: {0}")]
    StageMotion(String),

    #[error("Parking channels failed: {0}")]
    ParkChannels(String),

    #[error("Teachpoint not found: {0}")]
    Teachpoint(String),

    #[error("Unknown labware: {0}")]
    UnknownLabware(String),

    // === Resource Errors ===
    #[error("Timed out after {waited_ms}ms waiting for {resource}")]
    AcquireTimeout { resource: String, waited_ms: u64 },

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    // === Control Flow ===
    #[error("Run aborted")]
    Aborted,

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Operator chose an option with no handler: {0}")]
    UnhandledErrorChoice(String),

    // === Plan / System Errors ===
    #[error("Invalid transfer plan: {0}")]
    InvalidPlan(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl SchedulerError {
    /// Stable error code for logs and run summaries
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::TipHandling { .. } => "TIP_HANDLING",
            SchedulerError::PlateHandling { .. } => "PLATE_HANDLING",
            SchedulerError::StageMotion(_) => "STAGE_MOTION",
            SchedulerError::ParkChannels(_) => "PARK_CHANNELS",
            SchedulerError::Teachpoint(_) => "TEACHPOINT",
            SchedulerError::UnknownLabware(_) => "UNKNOWN_LABWARE",
            SchedulerError::AcquireTimeout { .. } => "ACQUIRE_TIMEOUT",
            SchedulerError::UnknownResource(_) => "UNKNOWN_RESOURCE",
            SchedulerError::Aborted => "ABORTED",
            SchedulerError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            SchedulerError::UnhandledErrorChoice(_) => "UNHANDLED_ERROR_CHOICE",
            SchedulerError::InvalidPlan(_) => "INVALID_PLAN",
            SchedulerError::TaskFailed(_) => "TASK_FAILED",
        }
    }

    #[inline]
    pub fn is_abort(&self) -> bool {
        matches!(self, SchedulerError::Aborted)
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(e: tokio::task::JoinError) -> Self {
        SchedulerError::TaskFailed(e.to_string())
    }
}
