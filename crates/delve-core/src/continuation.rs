//! Continuation controller
//!
//! Owns the lifecycle of every worker in a run. Termination signals and
//! timeouts are turned into one of four outcomes:
//! - **accept**: the latest checkpoint meets the minimum
//! - **relaunch**: deficits remain and enough time is left; the worker gets a
//!   [`ContinuationInstruction`] resuming from its latest checkpoint
//! - **accept incomplete**: out of relaunches or out of time; the residual
//!   deficit is kept for the delivery report
//! - **abandon**: out of time and nothing was ever checkpointed
//!
//! The controller never holds a worker hostage: after the allowance plus a
//! grace of a few checkpoint intervals an unresponsive worker is written off.

use crate::config::ContinuationPolicy;
use crate::error::CoreError;
use crate::policy::AccelerationStrategy;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use delve_budget::{TimeAllocation, TimeBudgetAllocator};
use delve_checkpoint::{
    validate_transition, Checkpoint, CheckpointError, CheckpointManager, DeficitField, DeficitMap,
    MinimumCheck, WorkerState,
};
use delve_types::{TimeStatus, WorkerId, WorkerKind};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationSignal {
    /// Worker believes it is done
    Finished,
    /// Worker ran out of turns
    TurnLimitExhausted,
    /// Worker's allowance ran out before it reported
    AllowanceExpired,
}

/// Pointer to the checkpoint a relaunch resumes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Sequence number
    pub sequence: u64,
    /// Phase it was taken in
    pub phase: String,
    /// When it was taken
    pub timestamp: DateTime<Utc>,
}

impl From<&Checkpoint> for CheckpointRef {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            sequence: checkpoint.sequence,
            phase: checkpoint.phase.clone(),
            timestamp: checkpoint.timestamp,
        }
    }
}

/// Everything a relaunched worker needs to pick up where it stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationInstruction {
    /// Worker being relaunched
    pub worker: WorkerId,
    /// Its domain
    pub kind: WorkerKind,
    /// Relaunch number, starting at 1
    pub attempt: u32,
    /// Whether no further relaunch will follow
    pub final_attempt: bool,
    /// Latest checkpoint, if any
    pub checkpoint: Option<CheckpointRef>,
    /// Exact shortfall against the configured requirement
    pub deficits: DeficitMap,
    /// Shortfall against the accelerated targets
    pub targets: DeficitMap,
    /// Turns the relaunch may take
    pub turn_budget: u32,
    /// Seconds left in the allowance
    pub remaining_secs: u64,
    /// Time status when the instruction was built
    pub status: TimeStatus,
    /// Acceleration strategy that shaped the targets
    pub acceleration: String,
    /// Summary carried over from the checkpoint
    pub work_summary: String,
    /// Next steps carried over from the checkpoint
    pub next_steps: Vec<String>,
}

fn field_label(field: DeficitField) -> &'static str {
    match field {
        DeficitField::Primary => "primary items",
        DeficitField::Key => "key findings",
    }
}

impl ContinuationInstruction {
    /// Render as a prompt for the worker
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "Continue as {} (relaunch {}", self.kind.role(), self.attempt);
        if self.final_attempt {
            out.push_str(", final attempt");
        }
        out.push_str(").\n");

        match &self.checkpoint {
            Some(cp) => {
                let _ = writeln!(
                    out,
                    "Resume from checkpoint #{} taken in phase '{}' at {}. Do not redo work it covers.",
                    cp.sequence,
                    cp.phase,
                    cp.timestamp.to_rfc3339()
                );
            }
            None => out.push_str("No checkpoint was saved. Start from the beginning.\n"),
        }
        if !self.work_summary.is_empty() {
            let _ = writeln!(out, "Work so far: {}", self.work_summary);
        }

        out.push_str("Still missing:\n");
        for (field, deficit) in &self.deficits {
            let _ = writeln!(
                out,
                "- {}: {}/{} ({} more)",
                field_label(*field),
                deficit.current,
                deficit.required,
                deficit.remaining
            );
        }
        if self.targets != self.deficits {
            let _ = writeln!(out, "Time is short ({}). Aim for at least:", self.acceleration);
            for (field, deficit) in &self.targets {
                let _ = writeln!(out, "- {}: {} more", field_label(*field), deficit.remaining);
            }
        }
        if !self.next_steps.is_empty() {
            out.push_str("Planned next steps:\n");
            for step in &self.next_steps {
                let _ = writeln!(out, "- {step}");
            }
        }
        let _ = writeln!(
            out,
            "Budget: {} turns, about {} minutes left ({}). Save a checkpoint before it runs out.",
            self.turn_budget,
            self.remaining_secs / 60,
            self.status
        );
        out
    }
}

/// What the caller should do with a worker next
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Minimum met; the worker is complete
    Accept,
    /// Relaunch with the instruction
    Relaunch(Box<ContinuationInstruction>),
    /// Keep partial output and report the deficit
    AcceptIncomplete {
        /// Residual shortfall
        deficits: DeficitMap,
    },
    /// Drop the worker; nothing was checkpointed
    Abandon,
    /// Worker is already terminal or not in a state that accepts the event
    NoOp,
}

/// Controller-side view of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Worker
    pub worker: WorkerId,
    /// Domain
    pub kind: WorkerKind,
    /// Current state
    pub state: WorkerState,
    /// Relaunches granted so far
    pub relaunches: u32,
    /// Current allowance
    pub allocation: TimeAllocation,
    /// Last known shortfall
    pub deficits: DeficitMap,
    /// Every state visited, in order
    pub history: Vec<WorkerState>,
}

impl WorkerStatus {
    fn new(worker: WorkerId, kind: WorkerKind, allocation: TimeAllocation) -> Self {
        Self {
            worker,
            kind,
            state: WorkerState::Running,
            relaunches: 0,
            allocation,
            deficits: DeficitMap::new(),
            history: vec![WorkerState::Running],
        }
    }

    fn advance(&mut self, to: WorkerState) -> Result<(), CheckpointError> {
        validate_transition(self.state, to)?;
        debug!(worker = %self.worker, from = %self.state, %to, "worker transition");
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}

/// Drives every worker's lifecycle from checkpoints and the clock
#[derive(Debug)]
pub struct ContinuationController {
    checkpoints: Arc<CheckpointManager>,
    budget: TimeBudgetAllocator,
    policy: ContinuationPolicy,
    strategy: Box<dyn AccelerationStrategy>,
    workers: DashMap<WorkerId, WorkerStatus>,
}

impl ContinuationController {
    /// Create controller using the policy's acceleration mode
    #[must_use]
    pub fn new(checkpoints: Arc<CheckpointManager>, budget: TimeBudgetAllocator, policy: ContinuationPolicy) -> Self {
        Self {
            checkpoints,
            budget,
            strategy: policy.acceleration.build(),
            policy,
            workers: DashMap::new(),
        }
    }

    /// With a custom acceleration strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn AccelerationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Active policy
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &ContinuationPolicy {
        &self.policy
    }

    /// Checkpoint store the controller reads
    #[inline]
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Budget allocator the controller assesses with
    #[inline]
    #[must_use]
    pub fn budget(&self) -> &TimeBudgetAllocator {
        &self.budget
    }

    /// Start tracking a worker in `Running`
    ///
    /// Registering an id again restarts its lifecycle.
    pub fn register(&self, worker: WorkerId, kind: WorkerKind, allocation: TimeAllocation) {
        info!(%worker, %kind, allowance = allocation.per_worker_secs, "worker registered");
        self.workers
            .insert(worker.clone(), WorkerStatus::new(worker, kind, allocation));
    }

    /// Snapshot of one worker
    #[must_use]
    pub fn status(&self, worker: &WorkerId) -> Option<WorkerStatus> {
        self.workers.get(worker).map(|w| w.clone())
    }

    /// Current state of one worker
    #[must_use]
    pub fn state(&self, worker: &WorkerId) -> Option<WorkerState> {
        self.workers.get(worker).map(|w| w.state)
    }

    /// Snapshots of every worker, ordered by id
    #[must_use]
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        let mut all: Vec<WorkerStatus> = self.workers.iter().map(|w| w.clone()).collect();
        all.sort_by(|a, b| a.worker.cmp(&b.worker));
        all
    }

    /// Whether every registered worker reached a terminal state
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.workers.iter().all(|w| w.state.is_terminal())
    }

    /// Grace granted after the allowance expires
    #[must_use]
    pub fn grace_secs(&self, allocation: &TimeAllocation) -> u64 {
        u64::from(self.policy.grace_checkpoints).saturating_mul(allocation.checkpoint_interval_secs)
    }

    /// Extend a worker's allowance with time saved elsewhere
    ///
    /// # Errors
    /// [`CoreError::UnknownWorker`]
    pub fn reallocate(
        &self,
        worker: &WorkerId,
        saved_secs: u64,
        wall_clock_remaining_secs: u64,
    ) -> Result<TimeAllocation, CoreError> {
        let mut status = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| CoreError::UnknownWorker(worker.clone()))?;
        status.allocation = self
            .budget
            .reallocate(&status.allocation, saved_secs, wall_clock_remaining_secs);
        Ok(status.allocation.clone())
    }

    /// Feed a termination signal into the state machine
    ///
    /// Signals for terminal workers, or for workers not currently running,
    /// are ignored.
    ///
    /// # Errors
    /// [`CoreError::UnknownWorker`], or checkpoint I/O errors
    pub fn on_signal(
        &self,
        worker: &WorkerId,
        signal: TerminationSignal,
        now: DateTime<Utc>,
    ) -> Result<Decision, CoreError> {
        let mut status = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| CoreError::UnknownWorker(worker.clone()))?;
        if status.state != WorkerState::Running {
            debug!(%worker, state = %status.state, ?signal, "signal ignored");
            return Ok(Decision::NoOp);
        }

        // Read before any transition so a store error leaves the worker
        // running and abortable.
        let latest = self.checkpoints.latest(worker)?;
        let check = MinimumCheck::evaluate(
            self.checkpoints.requirements().get(status.kind),
            latest.as_ref().map(|c| c.counts).unwrap_or_default(),
        );
        if check.met {
            status.advance(WorkerState::Complete)?;
            status.deficits.clear();
            info!(%worker, ?signal, relaunches = status.relaunches, "worker complete");
            return Ok(Decision::Accept);
        }

        status.advance(WorkerState::TimedOut)?;
        status.deficits.clone_from(&check.deficits);
        debug!(%worker, ?signal, deficits = ?check.deficits, "worker short of minimum");
        self.resolve_timeout(&mut status, latest, check.deficits, now)
    }

    fn resolve_timeout(
        &self,
        status: &mut WorkerStatus,
        latest: Option<Checkpoint>,
        deficits: DeficitMap,
        now: DateTime<Utc>,
    ) -> Result<Decision, CoreError> {
        let assessment = self.budget.assess(&status.allocation, now);

        if assessment.status == TimeStatus::InsufficientTime {
            if latest.is_none() {
                status.advance(WorkerState::Abandoned)?;
                info!(worker = %status.worker, remaining = assessment.remaining_secs, "worker abandoned without checkpoint");
                return Ok(Decision::Abandon);
            }
            status.advance(WorkerState::AcceptedIncomplete)?;
            info!(
                worker = %status.worker,
                remaining = assessment.remaining_secs,
                deficits = ?deficits,
                "insufficient time to relaunch; accepting partial work"
            );
            return Ok(Decision::AcceptIncomplete { deficits });
        }

        if status.relaunches >= self.policy.max_relaunches {
            status.advance(WorkerState::AcceptedIncomplete)?;
            warn!(
                worker = %status.worker,
                relaunches = status.relaunches,
                deficits = ?deficits,
                "final attempt still short of minimum"
            );
            return Ok(Decision::AcceptIncomplete { deficits });
        }

        status.relaunches += 1;
        let final_attempt = status.relaunches >= self.policy.max_relaunches;
        status.advance(if final_attempt {
            WorkerState::FinalAttempt
        } else {
            WorkerState::Continued
        })?;

        let turn_budget = self.strategy.turn_budget(
            self.budget.turn_budget(assessment.remaining_secs),
            self.budget.policy().min_turns,
            assessment.status,
        );
        let target = self
            .strategy
            .targets(self.checkpoints.requirements(), assessment.status)
            .get(status.kind);
        let counts = latest.as_ref().map(|c| c.counts).unwrap_or_default();
        let targets = MinimumCheck::evaluate(target, counts).deficits;

        let instruction = ContinuationInstruction {
            worker: status.worker.clone(),
            kind: status.kind,
            attempt: status.relaunches,
            final_attempt,
            checkpoint: latest.as_ref().map(CheckpointRef::from),
            deficits,
            targets,
            turn_budget,
            remaining_secs: assessment.remaining_secs,
            status: assessment.status,
            acceleration: self.strategy.name().to_string(),
            work_summary: latest
                .as_ref()
                .map(|c| c.content.work_summary.clone())
                .unwrap_or_default(),
            next_steps: latest.map(|c| c.content.next_steps).unwrap_or_default(),
        };
        info!(
            worker = %status.worker,
            attempt = instruction.attempt,
            final_attempt,
            turn_budget,
            remaining = assessment.remaining_secs,
            "relaunching worker"
        );
        Ok(Decision::Relaunch(Box::new(instruction)))
    }

    /// Move a relaunched worker back to `Running`
    ///
    /// # Errors
    /// [`CoreError::UnknownWorker`], or an illegal transition if the worker
    /// was not scheduled for a relaunch
    pub fn resume(&self, worker: &WorkerId) -> Result<(), CoreError> {
        let mut status = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| CoreError::UnknownWorker(worker.clone()))?;
        status.advance(WorkerState::Running)?;
        Ok(())
    }

    /// Write off a worker that did not report within its grace period
    ///
    /// # Errors
    /// [`CoreError::UnknownWorker`], or checkpoint I/O errors
    pub fn expire(&self, worker: &WorkerId) -> Result<Decision, CoreError> {
        let mut status = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| CoreError::UnknownWorker(worker.clone()))?;
        if status.state.is_terminal() {
            return Ok(Decision::NoOp);
        }
        let check = self.checkpoints.meets_minimum(worker, status.kind)?;
        Self::force_timed_out(&mut status)?;
        status.advance(WorkerState::AcceptedIncomplete)?;
        status.deficits.clone_from(&check.deficits);
        warn!(%worker, deficits = ?check.deficits, "worker unresponsive past grace; accepting partial work");
        Ok(Decision::AcceptIncomplete {
            deficits: check.deficits,
        })
    }

    /// Stop a worker after a fatal failure
    ///
    /// Partial work is kept when a checkpoint exists, otherwise the worker is
    /// abandoned. Checkpoint errors are not consulted further: the store is
    /// presumed broken.
    ///
    /// # Errors
    /// [`CoreError::UnknownWorker`]
    pub fn abort(&self, worker: &WorkerId) -> Result<Decision, CoreError> {
        let mut status = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| CoreError::UnknownWorker(worker.clone()))?;
        if status.state.is_terminal() {
            return Ok(Decision::NoOp);
        }
        Self::force_timed_out(&mut status)?;
        match self.checkpoints.latest(worker) {
            Ok(Some(checkpoint)) => {
                let check = MinimumCheck::evaluate(
                    self.checkpoints.requirements().get(status.kind),
                    checkpoint.counts,
                );
                status.advance(WorkerState::AcceptedIncomplete)?;
                status.deficits.clone_from(&check.deficits);
                warn!(%worker, checkpoint = checkpoint.sequence, "worker aborted; keeping last checkpoint");
                Ok(Decision::AcceptIncomplete {
                    deficits: check.deficits,
                })
            }
            Ok(None) | Err(_) => {
                status.advance(WorkerState::Abandoned)?;
                warn!(%worker, "worker aborted without usable checkpoint");
                Ok(Decision::Abandon)
            }
        }
    }

    fn force_timed_out(status: &mut WorkerStatus) -> Result<(), CheckpointError> {
        if matches!(status.state, WorkerState::Continued | WorkerState::FinalAttempt) {
            status.advance(WorkerState::Running)?;
        }
        if status.state == WorkerState::Running {
            status.advance(WorkerState::TimedOut)?;
        }
        Ok(())
    }

    /// Expire every running worker whose allowance plus grace has passed
    ///
    /// # Errors
    /// Checkpoint I/O errors
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<(WorkerId, Decision)>, CoreError> {
        let overdue: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Running)
            .filter(|w| {
                let grace = i64::try_from(self.grace_secs(&w.allocation))
                    .ok()
                    .and_then(Duration::try_seconds)
                    .unwrap_or(Duration::MAX);
                w.allocation
                    .deadline()
                    .checked_add_signed(grace)
                    .is_some_and(|limit| now >= limit)
            })
            .map(|w| w.worker.clone())
            .collect();

        overdue
            .into_iter()
            .map(|worker| {
                let decision = self.expire(&worker)?;
                Ok((worker, decision))
            })
            .collect()
    }
}
