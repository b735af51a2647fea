//! Command handlers against a real data directory

use delve_checkpoint::{CheckpointContent, CheckpointManager, ItemCounts, RequirementTable};
use delve_cli::{classify, cli, run, Exit};
use delve_test_utils::sample_batch;
use delve_types::{WorkerId, WorkerKind};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;

fn invoke(data_dir: &Path, args: &[&str]) -> (anyhow::Result<Exit>, String) {
    let mut argv = vec!["delve", "--data-dir", data_dir.to_str().unwrap()];
    argv.extend_from_slice(args);
    let matches = cli().try_get_matches_from(argv).unwrap();
    let mut out = Vec::new();
    let result = run(&matches, &mut out);
    (result, String::from_utf8(out).unwrap())
}

fn built_graph() -> (TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    for kind in WorkerKind::ALL {
        let path = dir.path().join(format!("{kind}.json"));
        std::fs::write(&path, serde_json::to_vec(&sample_batch(kind)).unwrap()).unwrap();
        files.push(path.to_str().unwrap().to_string());
    }
    let data = dir.path().join("data");
    let mut args = vec!["build-graph", "--query", "tree of thoughts"];
    args.extend(files.iter().map(String::as_str));

    let (result, out) = invoke(&data, &args);
    assert_eq!(result.unwrap(), Exit::Success);
    let summary: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(summary["batches"], 3);
    assert_eq!(summary["entities"], 5);
    assert_eq!(summary["phases_completed"], json!(["academic", "github", "community"]));
    (dir, summary["session"].as_str().unwrap().to_string())
}

#[test]
fn queries_run_against_a_built_graph() {
    let (dir, _) = built_graph();
    let data = dir.path().join("data");

    let (result, out) = invoke(&data, &["related", "paper:2305.10601", "--top-k", "3"]);
    assert_eq!(result.unwrap(), Exit::Success);
    let related: Vec<Value> = serde_json::from_str(&out).unwrap();
    assert!(!related.is_empty() && related.len() <= 3);

    let (result, out) = invoke(
        &data,
        &["path", "discussion:https://news.ycombinator.com/item?id=36000000", "paper:2201.11903"],
    );
    assert_eq!(result.unwrap(), Exit::Success);
    let path: Vec<Value> = serde_json::from_str(&out).unwrap();
    assert_eq!(path.len(), 3);

    let (result, out) = invoke(&data, &["stats", "--top", "2"]);
    assert_eq!(result.unwrap(), Exit::Success);
    let stats: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(stats["top_ranked"].as_array().map(Vec::len), Some(2));
}

#[test]
fn export_writes_requested_format() {
    let (dir, _) = built_graph();
    let data = dir.path().join("data");

    let (result, out) = invoke(&data, &["export", "--format", "mermaid"]);
    assert_eq!(result.unwrap(), Exit::Success);
    assert!(out.starts_with("graph"));

    let target = dir.path().join("graph.dot");
    let (result, out) = invoke(&data, &["export", "--format", "dot", "-o", target.to_str().unwrap()]);
    assert_eq!(result.unwrap(), Exit::Success);
    assert!(out.is_empty());
    assert!(std::fs::read_to_string(&target).unwrap().contains("digraph"));

    let (result, _) = invoke(&data, &["export", "--format", "png"]);
    assert_eq!(classify(&result.unwrap_err()), Exit::Fatal);
}

#[test]
fn missing_things_exit_with_not_found() {
    let dir = tempfile::tempdir().unwrap();

    let (result, _) = invoke(dir.path(), &["stats"]);
    assert_eq!(classify(&result.unwrap_err()), Exit::NotFound);

    let (built, _) = built_graph();
    let data = built.path().join("data");
    let (result, _) = invoke(&data, &["related", "paper:0000.00000"]);
    assert_eq!(classify(&result.unwrap_err()), Exit::NotFound);
}

#[test]
fn progress_reports_deficits_as_partial() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = CheckpointManager::new(dir.path(), RequirementTable::default());
    let worker = WorkerId::for_kind(WorkerKind::Academic);
    checkpoints
        .save(
            &worker,
            WorkerKind::Academic,
            "academic",
            ItemCounts { processed: 4, primary: 3, key: 1 },
            None,
            CheckpointContent::new("three papers read"),
        )
        .unwrap();

    let (result, out) = invoke(dir.path(), &["progress", worker.as_str()]);
    assert_eq!(result.unwrap(), Exit::Partial);
    let report: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(report["met"], false);
    assert_eq!(report["checkpoint"], 1);
    assert_eq!(report["deficits"]["primary"]["remaining"], 2);

    checkpoints
        .save(
            &worker,
            WorkerKind::Academic,
            "academic",
            ItemCounts { processed: 9, primary: 5, key: 3 },
            None,
            CheckpointContent::new("done"),
        )
        .unwrap();
    let (result, _) = invoke(dir.path(), &["progress", worker.as_str(), "--kind", "academic"]);
    assert_eq!(result.unwrap(), Exit::Success);
}

#[test]
fn replay_prints_records_in_order() {
    let (dir, session) = built_graph();
    let data = dir.path().join("data");

    let (result, out) = invoke(&data, &["replay", &session, "--verify"]);
    assert_eq!(result.unwrap(), Exit::Success);
    let seqs: Vec<u64> = out
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap()["seq"].as_u64().unwrap())
        .collect();
    assert!(seqs.len() >= 3);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let (result, out) = invoke(&data, &["replay", &session, "--from-phase", "community"]);
    assert_eq!(result.unwrap(), Exit::Success);
    assert!(out.lines().count() < seqs.len());

    let (result, _) = invoke(&data, &["replay", &session, "--from-phase", "synthesis"]);
    assert_eq!(classify(&result.unwrap_err()), Exit::NotFound);

    let (result, _) = invoke(&data, &["replay", &delve_types::SessionId::new().to_string()]);
    assert_eq!(result.unwrap(), Exit::NotFound);
}

#[test]
fn session_history_is_queryable() {
    let (dir, session) = built_graph();
    let data = dir.path().join("data");

    let (result, out) = invoke(&data, &["timeline", &session]);
    assert_eq!(result.unwrap(), Exit::Success);
    let events: Vec<Value> = serde_json::from_str(&out).unwrap();
    assert!(events[0]["note"].as_str().unwrap().starts_with("session_start"));
    assert_eq!(events.iter().filter(|e| e["note"] == "findings").count(), 3);

    let (result, out) = invoke(&data, &["timeline", &session, "--evolution"]);
    assert_eq!(result.unwrap(), Exit::Success);
    let phases: Vec<Value> = serde_json::from_str(&out).unwrap();
    let names: Vec<&str> = phases.iter().map(|p| p["phase"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["session", "academic", "github", "community"]);

    let (result, out) = invoke(&data, &["provenance", "paper:2305.10601"]);
    assert_eq!(result.unwrap(), Exit::Success);
    let records: Vec<Value> = serde_json::from_str(&out).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["provenance"]["worker"], "academic-researcher");

    let (result, _) = invoke(&data, &["provenance", "paper:0000.00000"]);
    assert_eq!(result.unwrap(), Exit::NotFound);
    let (result, _) = invoke(&data, &["timeline", &delve_types::SessionId::new().to_string()]);
    assert_eq!(result.unwrap(), Exit::NotFound);
}

#[test]
fn network_analysis_commands() {
    let (dir, _) = built_graph();
    let data = dir.path().join("data");

    let (result, out) = invoke(&data, &["citations"]);
    assert_eq!(result.unwrap(), Exit::Success);
    let summary: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(summary["papers"], 2);
    assert_eq!(summary["citations"], 1);
    assert_eq!(summary["root_papers"], json!(["paper:2201.11903"]));

    let (result, out) = invoke(&data, &["citations", "paper:2305.10601", "--depth", "1"]);
    assert_eq!(result.unwrap(), Exit::Success);
    assert_eq!(
        serde_json::from_str::<Value>(&out).unwrap(),
        json!(["paper:2305.10601", "paper:2201.11903"])
    );

    let (result, out) = invoke(&data, &["bridges"]);
    assert_eq!(result.unwrap(), Exit::Success);
    let bridges: Vec<Value> = serde_json::from_str(&out).unwrap();
    assert_eq!(bridges.len(), 3);
    assert_eq!(bridges[0]["key"], "paper:2305.10601");

    let (result, out) = invoke(&data, &["bridges", "--graph"]);
    assert_eq!(result.unwrap(), Exit::Success);
    let cross: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(cross["edges"].as_array().map(Vec::len), Some(3));
}
