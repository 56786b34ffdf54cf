//! Transfer Execution
//!
//! Per-transfer motion protocol for one pipetting channel.
//!
//! # State Machine
//!
//! ```text
//! IDLE → INITIALIZATION → MOVE_TO_SAFE_Z → MOVE_TO_SOURCE_YR → MOVE_XZ_INTO_SOURCE
//!      → ASPIRATE → MOVE_OUT_OF_SOURCE → MOVE_TO_DESTINATION_YR
//!      → MOVE_XZ_INTO_DESTINATION → DISPENSE → MOVE_OUT_OF_DESTINATION
//!      → RUN_TIP_HANDLING → IDLE
//!
//! every motion step:  STEP --MoveError--> STEP_ERROR --Retry--> STEP
//! ```
//!
//! # Invariants
//!
//! 1. **Retry only**: an error state's single exit is a retry of its step
//! 2. **Lease scope**: the source stage is held from `MOVE_TO_SOURCE_YR` to
//!    `MOVE_OUT_OF_SOURCE`, the destination stage from
//!    `MOVE_TO_DESTINATION_YR` to `MOVE_OUT_OF_DESTINATION`
//! 3. **Tip handling escapes**: a failed wash or tip change ends the run

pub mod adapters;
pub mod error;
pub mod machine;
pub mod state;
pub mod types;


pub use adapters::Collaborators;
pub use error::{AxisFault, SchedulerError};
pub use machine::{TransferOutcome, TransferRun, TransferStateMachine};
pub use state::{TransferState, TransferTrigger};
pub use types::{
    Labware, Plate, PlateRole, StageTeachpoint, Teachpoint, TipHandling, Transfer, TransferRunId,
};
