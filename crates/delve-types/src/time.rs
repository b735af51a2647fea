//! Time assessment shared by the budget allocator and checkpoints

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status label of a time assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeStatus {
    /// Enough time left
    OnTrack,
    /// Less than the critical fraction of the budget left
    TimeCritical,
    /// Less than the minimum useful amount of time left
    InsufficientTime,
}

impl TimeStatus {
    /// Stable textual name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnTrack => "on_track",
            Self::TimeCritical => "time_critical",
            Self::InsufficientTime => "insufficient_time",
        }
    }
}

impl fmt::Display for TimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Elapsed and remaining time of an allocation at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAssessment {
    /// Seconds since the allocation started
    pub elapsed_secs: u64,
    /// Seconds left of the per-worker allowance (0 when overdue)
    pub remaining_secs: u64,
    /// Status label
    pub status: TimeStatus,
}

impl TimeAssessment {
    /// Whether the allowance is used up
    #[inline]
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining_secs == 0
    }
}
