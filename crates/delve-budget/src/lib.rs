//! Delve time budgets
//!
//! Converts a total wall-clock budget into per-worker allowances:
//! - every worker of a phase gets the same allowance, `total × (1 − overhead)`,
//!   because workers run concurrently
//! - [`TimeBudgetAllocator::assess`] labels the remaining time
//! - unused time can be handed back to a worker only through
//!   [`TimeBudgetAllocator::reallocate`], which logs and records the change

#![warn(unreachable_pub)]

use chrono::{DateTime, Duration, Utc};
use delve_types::{TimeAssessment, TimeStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Budget errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BudgetError {
    /// Total budget of zero seconds
    #[error("time budget must be positive")]
    ZeroBudget,

    /// No workers to allocate to
    #[error("worker count must be positive")]
    NoWorkers,

    /// Policy value out of range
    #[error("invalid budget policy: {0}")]
    InvalidPolicy(String),
}

/// Heuristic constants of the allocator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetPolicy {
    /// Fraction of the total reserved for orchestration and synthesis
    pub overhead_fraction: f64,
    /// Checkpoint interval as a fraction of the per-worker allowance
    pub checkpoint_fraction: f64,
    /// Remaining fraction of the total below which time is critical
    pub critical_fraction: f64,
    /// Remaining seconds below which a relaunch is pointless
    pub insufficient_floor_secs: u64,
    /// Wall-clock seconds that must remain before time is handed back
    pub reallocation_floor_secs: u64,
    /// Estimated seconds per worker turn
    pub seconds_per_turn: u64,
    /// Lower bound of a turn budget
    pub min_turns: u32,
    /// Upper bound of a turn budget
    pub max_turns: u32,
    /// Budget used when none is given
    pub default_budget_secs: u64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            overhead_fraction: 0.20,
            checkpoint_fraction: 0.10,
            critical_fraction: 0.20,
            insufficient_floor_secs: 300,
            reallocation_floor_secs: 600,
            seconds_per_turn: 120,
            min_turns: 5,
            max_turns: 20,
            default_budget_secs: 3600,
        }
    }
}

impl BudgetPolicy {
    /// Set the overhead fraction
    #[must_use]
    pub fn with_overhead_fraction(mut self, fraction: f64) -> Self {
        self.overhead_fraction = fraction;
        self
    }

    /// Set the insufficient-time floor
    #[must_use]
    pub fn with_insufficient_floor(mut self, secs: u64) -> Self {
        self.insufficient_floor_secs = secs;
        self
    }

    /// Set the reallocation floor
    #[must_use]
    pub fn with_reallocation_floor(mut self, secs: u64) -> Self {
        self.reallocation_floor_secs = secs;
        self
    }

    /// Set the default budget
    #[must_use]
    pub fn with_default_budget(mut self, secs: u64) -> Self {
        self.default_budget_secs = secs;
        self
    }

    /// Set the turn bounds
    #[must_use]
    pub fn with_turn_bounds(mut self, min_turns: u32, max_turns: u32) -> Self {
        self.min_turns = min_turns;
        self.max_turns = max_turns;
        self
    }

    /// Check ranges
    ///
    /// # Errors
    /// [`BudgetError::InvalidPolicy`] naming the first bad field
    pub fn validate(&self) -> Result<(), BudgetError> {
        let fractions = [
            ("overhead_fraction", self.overhead_fraction),
            ("checkpoint_fraction", self.checkpoint_fraction),
            ("critical_fraction", self.critical_fraction),
        ];
        for (name, value) in fractions {
            if !(0.0..1.0).contains(&value) {
                return Err(BudgetError::InvalidPolicy(format!("{name} must be in [0, 1), got {value}")));
            }
        }
        if self.seconds_per_turn == 0 {
            return Err(BudgetError::InvalidPolicy("seconds_per_turn must be positive".into()));
        }
        if self.min_turns > self.max_turns {
            return Err(BudgetError::InvalidPolicy(format!(
                "min_turns {} exceeds max_turns {}",
                self.min_turns, self.max_turns
            )));
        }
        if self.default_budget_secs == 0 {
            return Err(BudgetError::InvalidPolicy("default_budget_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Where a total budget came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    /// Given by the caller
    Explicit,
    /// Configured default
    Estimated,
}

impl fmt::Display for AllocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Explicit => "explicit",
            Self::Estimated => "estimated",
        })
    }
}

/// One applied reallocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reallocation {
    /// When it was applied
    pub at: DateTime<Utc>,
    /// Seconds saved by finished workers
    pub saved_secs: u64,
    /// Wall-clock seconds left at decision time
    pub wall_clock_remaining_secs: u64,
    /// Allowance before
    pub previous_per_worker_secs: u64,
    /// Allowance after
    pub new_per_worker_secs: u64,
}

/// Per-worker allowance derived from a total budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAllocation {
    /// Total budget
    pub total_secs: u64,
    /// Allowance of every worker
    pub per_worker_secs: u64,
    /// Suggested checkpoint interval
    pub checkpoint_interval_secs: u64,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Budget origin
    pub source: AllocationSource,
    /// Workers sharing the phase
    pub worker_count: usize,
    /// Applied reallocations, oldest first
    #[serde(default)]
    pub reallocations: Vec<Reallocation>,
}

impl TimeAllocation {
    /// Seconds elapsed at `now` (0 before the start)
    #[must_use]
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.started_at).num_seconds()).unwrap_or(0)
    }

    /// Seconds of the allowance left at `now`
    #[must_use]
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        self.per_worker_secs.saturating_sub(self.elapsed_secs(now))
    }

    /// Instant the allowance runs out
    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        i64::try_from(self.per_worker_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|d| self.started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn fraction_of(secs: u64, fraction: f64) -> u64 {
    (secs as f64 * fraction).round() as u64
}

/// Allocates and tracks time budgets
#[derive(Debug, Clone, Default)]
pub struct TimeBudgetAllocator {
    policy: BudgetPolicy,
}

impl TimeBudgetAllocator {
    /// Allocator with a validated policy
    ///
    /// # Errors
    /// [`BudgetError::InvalidPolicy`] for out-of-range values
    pub fn new(policy: BudgetPolicy) -> Result<Self, BudgetError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    /// Policy in effect
    #[must_use]
    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    fn build(&self, total_secs: u64, worker_count: usize, source: AllocationSource) -> Result<TimeAllocation, BudgetError> {
        if total_secs == 0 {
            return Err(BudgetError::ZeroBudget);
        }
        if worker_count == 0 {
            return Err(BudgetError::NoWorkers);
        }
        let per_worker_secs = fraction_of(total_secs, 1.0 - self.policy.overhead_fraction).clamp(1, total_secs);
        let checkpoint_interval_secs = fraction_of(per_worker_secs, self.policy.checkpoint_fraction).max(1);
        let allocation = TimeAllocation {
            total_secs,
            per_worker_secs,
            checkpoint_interval_secs,
            started_at: Utc::now(),
            source,
            worker_count,
            reallocations: Vec::new(),
        };
        info!(
            total = total_secs,
            per_worker = per_worker_secs,
            checkpoint_interval = checkpoint_interval_secs,
            workers = worker_count,
            %source,
            "time budget allocated"
        );
        Ok(allocation)
    }

    /// Allocate an explicit budget
    ///
    /// The allowance is not divided by `worker_count`: workers run
    /// concurrently and each may use the whole research window.
    ///
    /// # Errors
    /// [`BudgetError::ZeroBudget`] or [`BudgetError::NoWorkers`]
    pub fn allocate(&self, total_secs: u64, worker_count: usize) -> Result<TimeAllocation, BudgetError> {
        self.build(total_secs, worker_count, AllocationSource::Explicit)
    }

    /// Allocate the configured default budget
    ///
    /// # Errors
    /// [`BudgetError::NoWorkers`]
    pub fn allocate_estimated(&self, worker_count: usize) -> Result<TimeAllocation, BudgetError> {
        self.build(self.policy.default_budget_secs, worker_count, AllocationSource::Estimated)
    }

    /// Elapsed/remaining time at `now` with its status label
    #[must_use]
    pub fn assess(&self, allocation: &TimeAllocation, now: DateTime<Utc>) -> TimeAssessment {
        let elapsed_secs = allocation.elapsed_secs(now);
        let remaining_secs = allocation.remaining_secs(now);
        let critical = fraction_of(allocation.total_secs, self.policy.critical_fraction);
        let status = if remaining_secs < self.policy.insufficient_floor_secs {
            TimeStatus::InsufficientTime
        } else if remaining_secs < critical {
            TimeStatus::TimeCritical
        } else {
            TimeStatus::OnTrack
        };
        TimeAssessment {
            elapsed_secs,
            remaining_secs,
            status,
        }
    }

    /// Hand time saved by finished workers back to the allowance
    ///
    /// Applied only when more than the reallocation floor of wall-clock time
    /// remains. The extension is capped by the wall-clock time left and the
    /// allowance never exceeds the total budget. Otherwise the allocation is
    /// returned unchanged.
    #[must_use]
    pub fn reallocate(&self, allocation: &TimeAllocation, saved_secs: u64, wall_clock_remaining_secs: u64) -> TimeAllocation {
        if wall_clock_remaining_secs <= self.policy.reallocation_floor_secs {
            debug!(
                wall_clock_remaining = wall_clock_remaining_secs,
                floor = self.policy.reallocation_floor_secs,
                "reallocation skipped below floor"
            );
            return allocation.clone();
        }

        let extension = saved_secs.min(wall_clock_remaining_secs);
        let new_per_worker_secs = allocation
            .per_worker_secs
            .saturating_add(extension)
            .min(allocation.total_secs);
        if new_per_worker_secs == allocation.per_worker_secs {
            return allocation.clone();
        }

        let mut next = allocation.clone();
        next.per_worker_secs = new_per_worker_secs;
        next.reallocations.push(Reallocation {
            at: Utc::now(),
            saved_secs,
            wall_clock_remaining_secs,
            previous_per_worker_secs: allocation.per_worker_secs,
            new_per_worker_secs,
        });
        info!(
            saved = saved_secs,
            wall_clock_remaining = wall_clock_remaining_secs,
            from = allocation.per_worker_secs,
            to = new_per_worker_secs,
            "time reallocated"
        );
        next
    }

    /// Turns a relaunched worker may take in `remaining_secs`
    #[must_use]
    pub fn turn_budget(&self, remaining_secs: u64) -> u32 {
        let turns = remaining_secs / self.policy.seconds_per_turn.max(1);
        let turns = u32::try_from(turns).unwrap_or(u32::MAX);
        turns.clamp(self.policy.min_turns, self.policy.max_turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn allocator() -> TimeBudgetAllocator {
        TimeBudgetAllocator::new(BudgetPolicy::default()).unwrap()
    }

    #[test]
    fn hour_budget_gives_2880_per_worker() {
        let a = allocator().allocate(3600, 3).unwrap();
        assert_eq!(a.per_worker_secs, 2880);
        assert_eq!(a.checkpoint_interval_secs, 288);
        assert_eq!(a.source, AllocationSource::Explicit);
    }

    #[test]
    fn zero_budget_and_zero_workers_are_rejected() {
        assert_eq!(allocator().allocate(0, 3), Err(BudgetError::ZeroBudget));
        assert_eq!(allocator().allocate(60, 0), Err(BudgetError::NoWorkers));
    }

    #[test]
    fn estimated_uses_default_budget() {
        let a = allocator().allocate_estimated(2).unwrap();
        assert_eq!(a.total_secs, 3600);
        assert_eq!(a.source, AllocationSource::Estimated);
    }

    #[test]
    fn assess_labels_remaining_time() {
        let alloc = allocator();
        let a = alloc.allocate(3600, 3).unwrap();
        let at = |secs: i64| a.started_at + Duration::seconds(secs);

        assert_eq!(alloc.assess(&a, at(0)).status, TimeStatus::OnTrack);
        // 2880 - 2200 = 680 < 720 (20% of 3600)
        assert_eq!(alloc.assess(&a, at(2200)).status, TimeStatus::TimeCritical);
        // 2880 - 2600 = 280 < 300
        let late = alloc.assess(&a, at(2600));
        assert_eq!(late.status, TimeStatus::InsufficientTime);
        assert_eq!(late.remaining_secs, 280);
        assert_eq!(alloc.assess(&a, at(9999)).remaining_secs, 0);
        assert_eq!(alloc.assess(&a, at(-10)).elapsed_secs, 0);
    }

    #[test]
    fn reallocation_below_floor_is_unchanged() {
        let alloc = allocator();
        let a = alloc.allocate(3600, 3).unwrap();
        let b = alloc.reallocate(&a, 500, 400);
        assert_eq!(a, b);
        assert!(b.reallocations.is_empty());
    }

    #[test]
    fn reallocation_is_capped_and_recorded() {
        let alloc = allocator();
        let a = alloc.allocate(3600, 3).unwrap();

        let b = alloc.reallocate(&a, 300, 1000);
        assert_eq!(b.per_worker_secs, 3180);
        assert_eq!(b.reallocations.len(), 1);

        let c = alloc.reallocate(&b, 5000, 4000);
        assert_eq!(c.per_worker_secs, 3600);
        assert_eq!(c.reallocations.len(), 2);
        assert_eq!(c.reallocations[1].previous_per_worker_secs, 3180);

        let d = alloc.reallocate(&c, 100, 4000);
        assert_eq!(d, c);
    }

    #[test]
    fn turn_budget_is_clamped() {
        let alloc = allocator();
        assert_eq!(alloc.turn_budget(0), 5);
        assert_eq!(alloc.turn_budget(1200), 10);
        assert_eq!(alloc.turn_budget(100_000), 20);
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let err = TimeBudgetAllocator::new(BudgetPolicy::default().with_overhead_fraction(1.5)).unwrap_err();
        assert!(matches!(err, BudgetError::InvalidPolicy(m) if m.contains("overhead_fraction")));
        assert!(TimeBudgetAllocator::new(BudgetPolicy::default().with_turn_bounds(10, 2)).is_err());
    }
}
