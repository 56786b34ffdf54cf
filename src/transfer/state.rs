//! Transfer FSM State Definitions
//!
//! The success/error pairing lives in [`MOTION_STEPS`] as data; the
//! transition function is a pure lookup over it.

use std::fmt;

use super::error::SchedulerError;

/// Transfer FSM States
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Start and end of every run
    Idle,
    /// Labware and collaborators resolved
    Initialization,

    /// Z retracted before any XY motion
    MoveToSafeZ,
    MoveToSafeZError,

    /// Source stage locked, Y/R at the source well
    MoveToSourceYR,
    MoveToSourceYRError,

    /// Pre-aspirate, then blended X/Z down to the well bottom
    MoveXZIntoSource,
    MoveXZIntoSourceError,

    Aspirate,
    AspirateError,

    /// Z retracted, source stage released
    MoveOutOfSource,
    MoveOutOfSourceError,

    /// Destination stage locked, Y/R at the destination well
    MoveToDestinationYR,
    MoveToDestinationYRError,

    MoveXZIntoDestination,
    MoveXZIntoDestinationError,

    Dispense,
    DispenseError,

    /// Z retracted, destination stage released
    MoveOutOfDestination,
    MoveOutOfDestinationError,

    /// Wash / change tip sub-protocol. Failures here escape the run.
    RunTipHandling,
}

/// Events that drive the FSM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferTrigger {
    ReceivedTransfer,
    Initialized,
    MoveComplete,
    MoveError,
    Retry,
}

/// One motion step: (state, next state on success, paired error state)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionStep {
    pub state: TransferState,
    pub on_complete: TransferState,
    pub on_error: TransferState,
}

const fn step(
    state: TransferState,
    on_complete: TransferState,
    on_error: TransferState,
) -> MotionStep {
    MotionStep {
        state,
        on_complete,
        on_error,
    }
}

/// Transition table for every retryable step, in execution order.
pub const MOTION_STEPS: [MotionStep; 9] = {
    use TransferState::*;
    [
        step(MoveToSafeZ, MoveToSourceYR, MoveToSafeZError),
        step(MoveToSourceYR, MoveXZIntoSource, MoveToSourceYRError),
        step(MoveXZIntoSource, Aspirate, MoveXZIntoSourceError),
        step(Aspirate, MoveOutOfSource, AspirateError),
        step(MoveOutOfSource, MoveToDestinationYR, MoveOutOfSourceError),
        step(MoveToDestinationYR, MoveXZIntoDestination, MoveToDestinationYRError),
        step(MoveXZIntoDestination, Dispense, MoveXZIntoDestinationError),
        step(Dispense, MoveOutOfDestination, DispenseError),
        step(MoveOutOfDestination, RunTipHandling, MoveOutOfDestinationError),
    ]
};

/// The twelve states a fault-free run enters, in order.
pub const SUCCESS_PATH: [TransferState; 12] = {
    use TransferState::*;
    [
        Idle,
        Initialization,
        MoveToSafeZ,
        MoveToSourceYR,
        MoveXZIntoSource,
        Aspirate,
        MoveOutOfSource,
        MoveToDestinationYR,
        MoveXZIntoDestination,
        Dispense,
        MoveOutOfDestination,
        RunTipHandling,
    ]
};

impl TransferState {
    /// Row of [`MOTION_STEPS`] this state owns, either as the step itself
    /// or as its error state.
    fn motion_step(self) -> Option<&'static MotionStep> {
        MOTION_STEPS
            .iter()
            .find(|s| s.state == self || s.on_error == self)
    }

    /// Check if this is an error state awaiting an operator decision
    #[inline]
    pub fn is_error(&self) -> bool {
        self.motion_step().is_some_and(|s| s.on_error == *self)
    }

    /// Check if this state performs retryable axis motion
    #[inline]
    pub fn is_motion(&self) -> bool {
        self.motion_step().is_some_and(|s| s.state == *self)
    }

    /// Error state paired with a motion step
    pub fn error_state(&self) -> Option<TransferState> {
        self.motion_step()
            .filter(|s| s.state == *self)
            .map(|s| s.on_error)
    }

    /// Step re-entered when an error state is retried
    pub fn retry_target(&self) -> Option<TransferState> {
        self.motion_step()
            .filter(|s| s.on_error == *self)
            .map(|s| s.state)
    }

    /// Process a trigger and return the next state
    pub fn transition(self, trigger: TransferTrigger) -> Result<TransferState, SchedulerError> {
        use TransferState::*;
        use TransferTrigger::*;

        let next = match (self, trigger) {
            (Idle, ReceivedTransfer) => Some(Initialization),
            (Initialization, Initialized) => Some(MoveToSafeZ),
            (RunTipHandling, MoveComplete) => Some(Idle),
            (state, MoveComplete) => state
                .motion_step()
                .filter(|s| s.state == state)
                .map(|s| s.on_complete),
            (state, MoveError) => state.error_state(),
            (state, Retry) => state.retry_target(),
            _ => None,
        };

        next.ok_or_else(|| {
            SchedulerError::InvalidStateTransition(format!("{} on {:?}", self, trigger))
        })
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Idle => "IDLE",
            TransferState::Initialization => "INITIALIZATION",
            TransferState::MoveToSafeZ => "MOVE_TO_SAFE_Z",
            TransferState::MoveToSafeZError => "MOVE_TO_SAFE_Z_ERROR",
            TransferState::MoveToSourceYR => "MOVE_TO_SOURCE_YR",
            TransferState::MoveToSourceYRError => "MOVE_TO_SOURCE_YR_ERROR",
            TransferState::MoveXZIntoSource => "MOVE_XZ_INTO_SOURCE",
            TransferState::MoveXZIntoSourceError => "MOVE_XZ_INTO_SOURCE_ERROR",
            TransferState::Aspirate => "ASPIRATE",
            TransferState::AspirateError => "ASPIRATE_ERROR",
            TransferState::MoveOutOfSource => "MOVE_OUT_OF_SOURCE",
            TransferState::MoveOutOfSourceError => "MOVE_OUT_OF_SOURCE_ERROR",
            TransferState::MoveToDestinationYR => "MOVE_TO_DESTINATION_YR",
            TransferState::MoveToDestinationYRError => "MOVE_TO_DESTINATION_YR_ERROR",
            TransferState::MoveXZIntoDestination => "MOVE_XZ_INTO_DESTINATION",
            TransferState::MoveXZIntoDestinationError => "MOVE_XZ_INTO_DESTINATION_ERROR",
            TransferState::Dispense => "DISPENSE",
            TransferState::DispenseError => "DISPENSE_ERROR",
            TransferState::MoveOutOfDestination => "MOVE_OUT_OF_DESTINATION",
            TransferState::MoveOutOfDestinationError => "MOVE_OUT_OF_DESTINATION_ERROR",
            TransferState::RunTipHandling => "RUN_TIP_HANDLING",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
