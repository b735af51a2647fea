//! Worker lifecycle state machine
//!
//! ```text
//! Running -> Complete | TimedOut
//! TimedOut -> Continued | FinalAttempt | Complete | AcceptedIncomplete | Abandoned
//! Continued | FinalAttempt -> Running
//! ```
//!
//! `Complete`, `AcceptedIncomplete` and `Abandoned` are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CheckpointError;

/// Lifecycle state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Executing within its allowance
    Running,
    /// Allowance expired or turn limit reached with work outstanding
    TimedOut,
    /// Relaunch scheduled with a continuation instruction
    Continued,
    /// Last relaunch scheduled
    FinalAttempt,
    /// Minimum met
    Complete,
    /// Out of attempts or time; partial output kept
    AcceptedIncomplete,
    /// Nothing worth keeping
    Abandoned,
}

impl WorkerState {
    /// All states
    pub const ALL: [WorkerState; 7] = [
        Self::Running,
        Self::TimedOut,
        Self::Continued,
        Self::FinalAttempt,
        Self::Complete,
        Self::AcceptedIncomplete,
        Self::Abandoned,
    ];

    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::AcceptedIncomplete | Self::Abandoned)
    }

    /// Stable textual name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::TimedOut => "timed_out",
            Self::Continued => "continued",
            Self::FinalAttempt => "final_attempt",
            Self::Complete => "complete",
            Self::AcceptedIncomplete => "accepted_incomplete",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: WorkerState) -> Vec<WorkerState> {
    use WorkerState::{
        Abandoned, AcceptedIncomplete, Complete, Continued, FinalAttempt, Running, TimedOut,
    };
    match from {
        Running => vec![Complete, TimedOut],
        TimedOut => vec![Continued, FinalAttempt, Complete, AcceptedIncomplete, Abandoned],
        Continued | FinalAttempt => vec![Running],
        Complete | AcceptedIncomplete | Abandoned => vec![],
    }
}

/// Validate a single transition
///
/// # Errors
/// [`CheckpointError::IllegalTransition`] if `to` is not reachable from `from`
pub fn validate_transition(from: WorkerState, to: WorkerState) -> Result<(), CheckpointError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(CheckpointError::IllegalTransition { from, to })
    }
}
