//! Delve checkpoints
//!
//! Durable progress snapshots that let a time-boxed worker be relaunched
//! without redoing completed work:
//! - [`CheckpointManager`]: per-worker, strictly sequenced checkpoint streams
//! - [`RequirementTable`] / [`MinimumCheck`]: completion thresholds and the
//!   exact [`DeficitMap`] when they are not met
//! - [`lifecycle`]: the worker state machine driven by the continuation
//!   controller

#![warn(unreachable_pub)]

pub mod checkpoint;
pub mod error;
pub mod lifecycle;
pub mod requirements;

pub use checkpoint::{Checkpoint, CheckpointContent, CheckpointManager, ItemCounts};
pub use error::CheckpointError;
pub use lifecycle::{allowed_transitions, validate_transition, WorkerState};
pub use requirements::{
    Deficit, DeficitField, DeficitMap, MinimumCheck, Requirement, RequirementTable,
};
