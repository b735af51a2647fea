//! Delivery report
//!
//! Final word on a run: one line per worker and an explicit caveat for
//! every worker whose output is partial.

use crate::continuation::WorkerStatus;
use crate::runner::PhaseOutcome;
use chrono::{DateTime, Utc};
use delve_checkpoint::{CheckpointManager, DeficitMap, WorkerState};
use delve_types::{SessionId, WorkerId, WorkerKind};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Outcome of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    /// Worker
    pub worker: WorkerId,
    /// Domain
    pub kind: WorkerKind,
    /// Terminal state
    pub state: WorkerState,
    /// Relaunches used
    pub relaunches: u32,
    /// Latest checkpoint sequence, if any
    pub last_checkpoint: Option<u64>,
    /// Residual shortfall
    pub deficits: DeficitMap,
}

/// Per-run summary for whoever consumes the research
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Session the run belonged to
    pub session: Option<SessionId>,
    /// When the report was built
    pub generated_at: DateTime<Utc>,
    /// One entry per worker, ordered by id
    pub outcomes: Vec<WorkerOutcome>,
    /// Human-readable warnings about partial results
    pub caveats: Vec<String>,
}

impl DeliveryReport {
    /// Build from controller snapshots
    ///
    /// Checkpoint lookups that fail leave `last_checkpoint` empty.
    #[must_use]
    pub fn from_statuses(session: Option<SessionId>, statuses: &[WorkerStatus], checkpoints: &CheckpointManager) -> Self {
        let outcomes: Vec<WorkerOutcome> = statuses
            .iter()
            .map(|s| WorkerOutcome {
                worker: s.worker.clone(),
                kind: s.kind,
                state: s.state,
                relaunches: s.relaunches,
                last_checkpoint: checkpoints.latest(&s.worker).ok().flatten().map(|c| c.sequence),
                deficits: s.deficits.clone(),
            })
            .collect();
        let caveats = outcomes.iter().filter_map(caveat).collect();
        Self {
            session,
            generated_at: Utc::now(),
            outcomes,
            caveats,
        }
    }

    /// Build from a finished phase
    #[must_use]
    pub fn from_phase(session: Option<SessionId>, phase: &PhaseOutcome, checkpoints: &CheckpointManager) -> Self {
        let mut report = Self::from_statuses(session, &phase.statuses, checkpoints);
        for failure in &phase.failures {
            report
                .caveats
                .push(format!("{} reported an error: {}", failure.worker, failure.error));
        }
        report
    }

    /// Whether every worker completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == WorkerState::Complete)
    }

    /// Markdown rendering
    #[must_use]
    pub fn render_markdown(&self) -> String {
        let mut out = String::from("## Delivery report\n\n| worker | kind | state | relaunches | checkpoint |\n|---|---|---|---|---|\n");
        for o in &self.outcomes {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                o.worker,
                o.kind,
                o.state,
                o.relaunches,
                o.last_checkpoint.map_or_else(|| "-".to_string(), |n| format!("#{n}"))
            );
        }
        if !self.caveats.is_empty() {
            out.push_str("\n### Caveats\n\n");
            for c in &self.caveats {
                let _ = writeln!(out, "- {c}");
            }
        }
        out
    }
}

fn caveat(outcome: &WorkerOutcome) -> Option<String> {
    let shortfall = || {
        outcome
            .deficits
            .iter()
            .map(|(field, d)| format!("{field} {}/{}", d.current, d.required))
            .collect::<Vec<_>>()
            .join(", ")
    };
    match outcome.state {
        WorkerState::AcceptedIncomplete => Some(format!(
            "{} ({}) is incomplete after {} relaunch(es): {}",
            outcome.worker,
            outcome.kind,
            outcome.relaunches,
            shortfall()
        )),
        WorkerState::Abandoned => Some(format!(
            "{} ({}) was abandoned without a checkpoint; its domain is not covered",
            outcome.worker, outcome.kind
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_checkpoint::{Deficit, DeficitField};

    fn outcome(state: WorkerState) -> WorkerOutcome {
        WorkerOutcome {
            worker: WorkerId::for_kind(WorkerKind::Community),
            kind: WorkerKind::Community,
            state,
            relaunches: 2,
            last_checkpoint: Some(4),
            deficits: DeficitMap::from([(
                DeficitField::Primary,
                Deficit {
                    current: 9,
                    required: 15,
                    remaining: 6,
                },
            )]),
        }
    }

    #[test]
    fn incomplete_workers_always_get_a_caveat() {
        let text = caveat(&outcome(WorkerState::AcceptedIncomplete)).unwrap();
        assert!(text.contains("primary 9/15"));
        assert!(text.contains("2 relaunch"));
        assert!(caveat(&outcome(WorkerState::Abandoned)).is_some());
        assert!(caveat(&outcome(WorkerState::Complete)).is_none());
    }

    #[test]
    fn markdown_lists_every_worker() {
        let report = DeliveryReport {
            session: None,
            generated_at: Utc::now(),
            outcomes: vec![outcome(WorkerState::AcceptedIncomplete)],
            caveats: vec!["community-listener is incomplete".into()],
        };
        let md = report.render_markdown();
        assert!(md.contains("| community-listener | community | accepted_incomplete | 2 | #4 |"));
        assert!(md.contains("### Caveats"));
        assert!(!report.is_complete());
    }
}
