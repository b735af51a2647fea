//! Phase runner behaviour against scripted workers

use delve_budget::TimeBudgetAllocator;
use delve_checkpoint::{CheckpointManager, DeficitField, RequirementTable, WorkerState};
use delve_core::{
    ContinuationController, ContinuationPolicy, DeliveryReport, PhaseRunner, TerminationSignal, Worker,
};
use delve_test_utils::{ScriptedWorker, Step};
use delve_types::{WorkerId, WorkerKind};
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Harness {
    _dir: tempfile::TempDir,
    runner: PhaseRunner,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(CheckpointManager::new(dir.path(), RequirementTable::default()));
    let controller = ContinuationController::new(
        checkpoints,
        TimeBudgetAllocator::default(),
        ContinuationPolicy::default(),
    );
    Harness {
        _dir: dir,
        runner: PhaseRunner::new(Arc::new(controller)),
    }
}

fn allocation(h: &Harness, total_secs: u64, workers: usize) -> delve_budget::TimeAllocation {
    h.runner.controller().budget().allocate(total_secs, workers).unwrap()
}

#[tokio::test]
async fn workers_meeting_minimum_finish_in_one_round() {
    let h = harness();
    let academic = Arc::new(ScriptedWorker::new(
        WorkerKind::Academic,
        [Step::progress(5, 3, TerminationSignal::Finished)],
    ));
    let github = Arc::new(ScriptedWorker::new(
        WorkerKind::Github,
        [Step::progress(9, 4, TerminationSignal::Finished)],
    ));
    let workers: Vec<Arc<dyn Worker>> = vec![academic as Arc<dyn Worker>, github as Arc<dyn Worker>];

    let outcome = h.runner.run(workers, allocation(&h, 3600, 2)).await.unwrap();

    assert_eq!(outcome.rounds, 1);
    assert!(outcome.is_complete());
    assert!(outcome.failures.is_empty());
}

#[tokio::test]
async fn relaunch_resumes_from_latest_checkpoint() {
    let h = harness();
    let worker = Arc::new(ScriptedWorker::new(
        WorkerKind::Academic,
        [
            Step::progress(2, 1, TerminationSignal::TurnLimitExhausted),
            Step::progress(5, 3, TerminationSignal::Finished),
        ],
    ));

    let outcome = h
        .runner
        .run(vec![Arc::clone(&worker) as Arc<dyn Worker>], allocation(&h, 3600, 1))
        .await
        .unwrap();

    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.statuses[0].state, WorkerState::Complete);
    assert_eq!(outcome.statuses[0].relaunches, 1);

    let seen = worker.instructions().await;
    assert!(seen[0].is_none());
    let instruction = seen[1].as_ref().unwrap();
    assert_eq!(instruction.checkpoint.as_ref().map(|c| c.sequence), Some(1));
    assert_eq!(instruction.deficits[&DeficitField::Primary].remaining, 3);
    assert_eq!(instruction.deficits[&DeficitField::Key].remaining, 2);
    assert!(!instruction.final_attempt);
}

#[tokio::test]
async fn third_timeout_is_accepted_incomplete() {
    let h = harness();
    let worker = Arc::new(ScriptedWorker::new(
        WorkerKind::Community,
        [
            Step::progress(4, 1, TerminationSignal::TurnLimitExhausted),
            Step::progress(8, 2, TerminationSignal::TurnLimitExhausted),
            Step::progress(12, 2, TerminationSignal::Finished),
        ],
    ));

    let outcome = h
        .runner
        .run(vec![Arc::clone(&worker) as Arc<dyn Worker>], allocation(&h, 3600, 1))
        .await
        .unwrap();

    let status = &outcome.statuses[0];
    assert_eq!(outcome.rounds, 3);
    assert_eq!(status.state, WorkerState::AcceptedIncomplete);
    assert_eq!(status.relaunches, 2);
    assert_eq!(status.deficits[&DeficitField::Primary].remaining, 3);
    assert_eq!(
        status.history,
        vec![
            WorkerState::Running,
            WorkerState::TimedOut,
            WorkerState::Continued,
            WorkerState::Running,
            WorkerState::TimedOut,
            WorkerState::FinalAttempt,
            WorkerState::Running,
            WorkerState::TimedOut,
            WorkerState::AcceptedIncomplete,
        ]
    );

    let seen = worker.instructions().await;
    assert!(seen[2].as_ref().unwrap().final_attempt);

    let report = DeliveryReport::from_phase(None, &outcome, h.runner.controller().checkpoints());
    assert_eq!(report.caveats.len(), 1);
    assert!(report.caveats[0].contains("primary 12/15"));
    assert_eq!(report.outcomes[0].last_checkpoint, Some(3));
}

#[tokio::test(start_paused = true)]
async fn unresponsive_worker_is_written_off_after_grace() {
    let h = harness();
    let hanging = Arc::new(ScriptedWorker::new(WorkerKind::Github, [Step::Hang]));
    let prompt = Arc::new(ScriptedWorker::new(
        WorkerKind::Academic,
        [Step::progress(6, 3, TerminationSignal::Finished)],
    ));

    let outcome = h
        .runner
        .run(vec![hanging as Arc<dyn Worker>, prompt as Arc<dyn Worker>], allocation(&h, 100, 2))
        .await
        .unwrap();

    let state_of = |kind: WorkerKind| {
        outcome
            .statuses
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.state)
    };
    assert_eq!(state_of(WorkerKind::Github), Some(WorkerState::AcceptedIncomplete));
    assert_eq!(state_of(WorkerKind::Academic), Some(WorkerState::Complete));
}

#[tokio::test]
async fn fatal_failure_aborts_only_that_worker() {
    let h = harness();
    let broken = Arc::new(ScriptedWorker::new(WorkerKind::Academic, [Step::Fail { fatal: true }]));
    let healthy = Arc::new(ScriptedWorker::new(
        WorkerKind::Github,
        [Step::progress(8, 4, TerminationSignal::Finished)],
    ));

    let outcome = h
        .runner
        .run(vec![broken as Arc<dyn Worker>, healthy as Arc<dyn Worker>], allocation(&h, 3600, 2))
        .await
        .unwrap();

    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].fatal);
    assert_eq!(outcome.failures[0].worker, WorkerId::for_kind(WorkerKind::Academic));
    let controller = h.runner.controller();
    assert_eq!(
        controller.state(&WorkerId::for_kind(WorkerKind::Academic)),
        Some(WorkerState::Abandoned)
    );
    assert_eq!(
        controller.state(&WorkerId::for_kind(WorkerKind::Github)),
        Some(WorkerState::Complete)
    );
}

#[tokio::test]
async fn recoverable_failure_counts_as_out_of_turns() {
    let h = harness();
    let flaky = Arc::new(ScriptedWorker::new(
        WorkerKind::Github,
        [
            Step::progress(3, 1, TerminationSignal::TurnLimitExhausted),
            Step::Fail { fatal: false },
            Step::progress(8, 4, TerminationSignal::Finished),
        ],
    ));

    let outcome = h
        .runner
        .run(vec![flaky as Arc<dyn Worker>], allocation(&h, 3600, 1))
        .await
        .unwrap();

    assert_eq!(outcome.statuses[0].state, WorkerState::Complete);
    assert_eq!(outcome.failures.len(), 1);
    assert!(!outcome.failures[0].fatal);
}

#[tokio::test]
async fn time_saved_by_finished_worker_extends_timed_out_one() {
    let h = harness();
    let quick = Arc::new(ScriptedWorker::new(
        WorkerKind::Academic,
        [Step::progress(5, 3, TerminationSignal::Finished)],
    ));
    let slow = Arc::new(ScriptedWorker::new(
        WorkerKind::Github,
        [
            Step::progress(3, 1, TerminationSignal::TurnLimitExhausted),
            Step::progress(8, 4, TerminationSignal::Finished),
        ],
    ));

    let outcome = h
        .runner
        .run(vec![quick as Arc<dyn Worker>, slow as Arc<dyn Worker>], allocation(&h, 3600, 2))
        .await
        .unwrap();

    assert!(outcome.is_complete());
    let status_of = |kind: WorkerKind| outcome.statuses.iter().find(|s| s.kind == kind).unwrap();
    let academic = status_of(WorkerKind::Academic);
    assert_eq!(academic.allocation.per_worker_secs, 2880);
    assert!(academic.allocation.reallocations.is_empty());

    let github = status_of(WorkerKind::Github);
    assert_eq!(github.relaunches, 1);
    assert_eq!(github.allocation.per_worker_secs, 3600);
    assert_eq!(github.allocation.reallocations.len(), 1);
    assert_eq!(github.allocation.reallocations[0].previous_per_worker_secs, 2880);
}

#[tokio::test]
async fn no_time_is_shared_below_the_reallocation_floor() {
    let h = harness();
    let quick = Arc::new(ScriptedWorker::new(
        WorkerKind::Academic,
        [Step::progress(5, 3, TerminationSignal::Finished)],
    ));
    let slow = Arc::new(ScriptedWorker::new(
        WorkerKind::Github,
        [
            Step::progress(3, 1, TerminationSignal::TurnLimitExhausted),
            Step::progress(8, 4, TerminationSignal::Finished),
        ],
    ));

    // 600 s of wall clock is not more than the floor
    let outcome = h
        .runner
        .run(vec![quick as Arc<dyn Worker>, slow as Arc<dyn Worker>], allocation(&h, 600, 2))
        .await
        .unwrap();

    let github = outcome
        .statuses
        .iter()
        .find(|s| s.kind == WorkerKind::Github)
        .unwrap();
    assert_eq!(github.allocation.per_worker_secs, 480);
    assert!(github.allocation.reallocations.is_empty());
}

#[tokio::test]
async fn corrupt_checkpoint_aborts_only_that_worker() {
    let h = harness();
    let corrupt = Arc::new(ScriptedWorker::new(WorkerKind::Github, [Step::Corrupt]));
    let healthy = Arc::new(ScriptedWorker::new(
        WorkerKind::Academic,
        [Step::progress(5, 3, TerminationSignal::Finished)],
    ));

    let outcome = h
        .runner
        .run(vec![corrupt as Arc<dyn Worker>, healthy as Arc<dyn Worker>], allocation(&h, 3600, 2))
        .await
        .unwrap();

    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.statuses.len(), 2);
    assert_eq!(outcome.failures.len(), 1);
    let failure = &outcome.failures[0];
    assert_eq!(failure.worker, WorkerId::for_kind(WorkerKind::Github));
    assert!(failure.fatal);
    assert!(failure.error.contains("corrupt"), "{}", failure.error);

    let controller = h.runner.controller();
    assert_eq!(
        controller.state(&WorkerId::for_kind(WorkerKind::Github)),
        Some(WorkerState::Abandoned)
    );
    assert_eq!(
        controller.state(&WorkerId::for_kind(WorkerKind::Academic)),
        Some(WorkerState::Complete)
    );
}
