//! Phase runner
//!
//! Launches every worker of a phase as a tokio task, waits for all of them,
//! feeds what they report into the [`ContinuationController`] and relaunches
//! the ones it asks for. A phase ends when every worker is terminal.
//!
//! A worker that overruns its allowance plus grace is written off, but its
//! task is detached rather than killed: it may still finish writing a
//! checkpoint.

use crate::continuation::{ContinuationController, ContinuationInstruction, Decision, TerminationSignal, WorkerStatus};
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use delve_budget::TimeAllocation;
use delve_checkpoint::{CheckpointManager, WorkerState};
use delve_types::{WorkerId, WorkerKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// What a worker receives for one run
#[derive(Debug, Clone)]
pub struct WorkerTask {
    /// Present on relaunches
    pub instruction: Option<ContinuationInstruction>,
    /// Turns the run may take
    pub turn_budget: u32,
    /// When the allowance runs out
    pub deadline: DateTime<Utc>,
    /// Where to save checkpoints
    pub checkpoints: Arc<CheckpointManager>,
}

/// A research worker driven by the runner
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    /// Stable id, also the checkpoint stream name
    fn id(&self) -> &WorkerId;

    /// Domain of the worker
    fn kind(&self) -> WorkerKind;

    /// Do one run and report why it stopped
    async fn run(&self, task: WorkerTask) -> Result<TerminationSignal, CoreError>;
}

/// Failure reported by or about one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    /// Worker
    pub worker: WorkerId,
    /// Rendered error
    pub error: String,
    /// Whether the worker was aborted because of it
    pub fatal: bool,
}

/// Result of one phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    /// Final status of every worker in the phase
    pub statuses: Vec<WorkerStatus>,
    /// Failures observed along the way
    pub failures: Vec<WorkerFailure>,
    /// Launch rounds, the first launch included
    pub rounds: u32,
}

impl PhaseOutcome {
    /// Whether every worker met its minimum
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.statuses.iter().all(|s| s.state == WorkerState::Complete)
    }
}

enum Report {
    Signal(TerminationSignal),
    Failed(CoreError),
    Panicked(String),
    Unresponsive,
}

/// Runs phases of workers under a shared controller
#[derive(Debug, Clone)]
pub struct PhaseRunner {
    controller: Arc<ContinuationController>,
}

impl PhaseRunner {
    /// Create runner
    #[inline]
    #[must_use]
    pub fn new(controller: Arc<ContinuationController>) -> Self {
        Self { controller }
    }

    /// Controller deciding relaunches
    #[inline]
    #[must_use]
    pub fn controller(&self) -> &Arc<ContinuationController> {
        &self.controller
    }

    /// Run `workers` until each one is terminal
    ///
    /// Every worker starts with the same `allocation`. Time left unused by
    /// workers that complete is handed to the ones that time out in the
    /// same round, subject to the reallocation floor.
    ///
    /// # Errors
    /// Only a worker missing from the controller at launch. Worker errors,
    /// and controller errors about a single worker, are recorded in
    /// [`PhaseOutcome::failures`] and abort only that worker.
    pub async fn run(&self, workers: Vec<Arc<dyn Worker>>, allocation: TimeAllocation) -> Result<PhaseOutcome, CoreError> {
        let mut outcome = PhaseOutcome::default();
        let mut by_id: HashMap<WorkerId, Arc<dyn Worker>> = HashMap::new();
        let mut pending: Vec<(WorkerId, Option<ContinuationInstruction>)> = Vec::new();
        for worker in workers {
            let id = worker.id().clone();
            self.controller.register(id.clone(), worker.kind(), allocation.clone());
            pending.push((id.clone(), None));
            by_id.insert(id, worker);
        }
        info!(workers = pending.len(), allowance = allocation.per_worker_secs, "phase started");

        while !pending.is_empty() {
            outcome.rounds += 1;
            let reports = self.launch(&by_id, std::mem::take(&mut pending)).await?;
            pending = self.settle(reports, &mut outcome);
        }

        let mut ids: Vec<&WorkerId> = by_id.keys().collect();
        ids.sort();
        outcome.statuses = ids.into_iter().filter_map(|id| self.controller.status(id)).collect();
        info!(
            rounds = outcome.rounds,
            complete = outcome.is_complete(),
            failures = outcome.failures.len(),
            "phase finished"
        );
        Ok(outcome)
    }

    async fn launch(
        &self,
        by_id: &HashMap<WorkerId, Arc<dyn Worker>>,
        batch: Vec<(WorkerId, Option<ContinuationInstruction>)>,
    ) -> Result<Vec<(WorkerId, Report)>, CoreError> {
        let mut tasks = JoinSet::new();
        for (id, instruction) in batch {
            let Some(worker) = by_id.get(&id).cloned() else {
                continue;
            };
            let status = self
                .controller
                .status(&id)
                .ok_or_else(|| CoreError::UnknownWorker(id.clone()))?;
            let now = Utc::now();
            let remaining = status.allocation.remaining_secs(now);
            let limit = Duration::from_secs(remaining.saturating_add(self.controller.grace_secs(&status.allocation)));
            let turn_budget = instruction
                .as_ref()
                .map_or_else(|| self.controller.budget().turn_budget(remaining), |i| i.turn_budget);
            let task = WorkerTask {
                instruction,
                turn_budget,
                deadline: status.allocation.deadline(),
                checkpoints: Arc::clone(self.controller.checkpoints()),
            };

            tasks.spawn(async move {
                let handle = tokio::spawn(async move { worker.run(task).await });
                let report = match tokio::time::timeout(limit, handle).await {
                    Ok(Ok(Ok(signal))) => Report::Signal(signal),
                    Ok(Ok(Err(e))) => Report::Failed(e),
                    Ok(Err(join)) => Report::Panicked(join.to_string()),
                    Err(_) => Report::Unresponsive,
                };
                (id, report)
            });
        }

        let mut reports = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "worker supervisor task failed"),
            }
        }
        Ok(reports)
    }

    fn settle(
        &self,
        mut reports: Vec<(WorkerId, Report)>,
        outcome: &mut PhaseOutcome,
    ) -> Vec<(WorkerId, Option<ContinuationInstruction>)> {
        // Finished workers first, so their unused time is known before the
        // timed-out ones are decided.
        reports.sort_by_key(|(id, report)| (!matches!(report, Report::Signal(TerminationSignal::Finished)), id.clone()));

        let mut saved_secs: u64 = 0;
        let mut relaunch = Vec::new();
        for (id, report) in reports {
            let decided = self
                .decide(&id, report, &mut saved_secs, outcome)
                .and_then(|decision| match decision {
                    Decision::Relaunch(instruction) => {
                        self.controller.resume(&id)?;
                        Ok(Some(*instruction))
                    }
                    _ => Ok(None),
                });
            match decided {
                Ok(Some(instruction)) => relaunch.push((id, Some(instruction))),
                Ok(None) => {}
                Err(e) => self.isolate(&id, &e, outcome),
            }
        }
        relaunch
    }

    fn decide(
        &self,
        id: &WorkerId,
        report: Report,
        saved_secs: &mut u64,
        outcome: &mut PhaseOutcome,
    ) -> Result<Decision, CoreError> {
        let now = Utc::now();
        match report {
            Report::Signal(signal) => {
                if signal != TerminationSignal::Finished && *saved_secs > 0 {
                    self.share_saved_time(id, *saved_secs, now)?;
                }
                let decision = self.controller.on_signal(id, signal, now)?;
                if decision == Decision::Accept {
                    if let Some(status) = self.controller.status(id) {
                        *saved_secs = saved_secs.saturating_add(status.allocation.remaining_secs(now));
                    }
                }
                Ok(decision)
            }
            Report::Failed(e) if e.is_fatal() => {
                error!(worker = %id, error = %e, "fatal worker failure");
                outcome.failures.push(WorkerFailure {
                    worker: id.clone(),
                    error: e.to_string(),
                    fatal: true,
                });
                self.controller.abort(id)
            }
            Report::Failed(e) => {
                warn!(worker = %id, error = %e, "worker failed; treating as out of turns");
                outcome.failures.push(WorkerFailure {
                    worker: id.clone(),
                    error: e.to_string(),
                    fatal: false,
                });
                self.controller.on_signal(id, TerminationSignal::TurnLimitExhausted, now)
            }
            Report::Panicked(message) => {
                error!(worker = %id, %message, "worker panicked");
                outcome.failures.push(WorkerFailure {
                    worker: id.clone(),
                    error: message,
                    fatal: true,
                });
                self.controller.abort(id)
            }
            Report::Unresponsive => self.controller.expire(id),
        }
    }

    /// Abort one worker whose bookkeeping failed; the rest of the phase goes on
    fn isolate(&self, id: &WorkerId, e: &CoreError, outcome: &mut PhaseOutcome) {
        error!(worker = %id, error = %e, "controller failed for worker; aborting it");
        outcome.failures.push(WorkerFailure {
            worker: id.clone(),
            error: e.to_string(),
            fatal: true,
        });
        if let Err(abort) = self.controller.abort(id) {
            error!(worker = %id, error = %abort, "abort failed");
        }
    }

    fn share_saved_time(&self, worker: &WorkerId, saved_secs: u64, now: DateTime<Utc>) -> Result<(), CoreError> {
        let Some(status) = self.controller.status(worker) else {
            return Err(CoreError::UnknownWorker(worker.clone()));
        };
        let wall_clock_remaining = status
            .allocation
            .total_secs
            .saturating_sub(status.allocation.elapsed_secs(now));
        self.controller.reallocate(worker, saved_secs, wall_clock_remaining)?;
        Ok(())
    }
}
