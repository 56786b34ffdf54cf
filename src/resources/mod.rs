//! Shared physical resources
//!
//! Stages and channels are the only mutable state shared between tasks.
//! Both live in [`ResourcePool`] and are handed out as leases.

pub mod abort;
pub mod pool;

pub use abort::AbortSignal;
pub use pool::{
    ChannelId, ChannelLease, ResourcePool, StageId, StageLease, StageMode, StageOwner,
    StageSnapshot, StageSpec,
};
