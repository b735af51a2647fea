//! Testing utilities for the Delve workspace
//!
//! Shared fixtures: throwaway data directories, sample finding batches and a
//! scripted worker for driving the phase runner.

#![allow(missing_docs)]

use delve_checkpoint::{CheckpointContent, ItemCounts};
use delve_core::{
    ContinuationInstruction, CoreError, DelveConfig, Finding, FindingBatch, TerminationSignal, Worker,
    WorkerTask,
};
use delve_graph::{Attributes, EntityKey};
use delve_types::{WorkerId, WorkerKind};
use serde_json::json;
use std::collections::VecDeque;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// Fresh data directory and a config pointing at it
pub fn temp_config() -> (TempDir, DelveConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = DelveConfig::new().with_data_dir(dir.path());
    (dir, config)
}

fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
    pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}

/// A small, linked batch typical for each domain
pub fn sample_batch(kind: WorkerKind) -> FindingBatch {
    let batch = FindingBatch::new(WorkerId::for_kind(kind), kind);
    match kind {
        WorkerKind::Academic => batch
            .with_finding(Finding::Paper {
                id: "2305.10601".into(),
                attributes: attrs(&[("title", json!("Tree of Thoughts")), ("year", json!(2023))]),
                cites: vec!["2201.11903".into()],
                concepts: vec!["Reasoning".into()],
                key: true,
            })
            .with_finding(Finding::Paper {
                id: "2201.11903".into(),
                attributes: attrs(&[("title", json!("Chain-of-Thought Prompting"))]),
                cites: Vec::new(),
                concepts: vec!["Reasoning".into()],
                key: false,
            }),
        WorkerKind::Github => batch.with_finding(Finding::Project {
            id: "princeton-nlp/tree-of-thought-llm".into(),
            attributes: attrs(&[("stars", json!(4800)), ("language", json!("Python"))]),
            implements: vec!["2305.10601".into()],
            concepts: Vec::new(),
            key: true,
        }),
        WorkerKind::Community => batch.with_finding(Finding::Discussion {
            id: "https://news.ycombinator.com/item?id=36000000".into(),
            attributes: attrs(&[("title", json!("Tree of Thoughts in practice")), ("upvotes", json!(312))]),
            discusses: vec![
                EntityKey::paper("2305.10601"),
                EntityKey::project("princeton-nlp/tree-of-thought-llm"),
            ],
            concepts: vec!["Reasoning".into()],
            key: false,
        }),
    }
}

/// One run of a [`ScriptedWorker`]
#[derive(Debug, Clone)]
pub enum Step {
    /// Save a checkpoint with these totals, then report the signal
    Progress {
        primary: u32,
        key: u32,
        signal: TerminationSignal,
    },
    /// Save a checkpoint, overwrite its file with garbage, report out of turns
    Corrupt,
    /// Never return
    Hang,
    /// Return an error; fatal errors look like a broken disk
    Fail { fatal: bool },
}

impl Step {
    pub fn progress(primary: u32, key: u32, signal: TerminationSignal) -> Self {
        Self::Progress { primary, key, signal }
    }
}

/// Worker that replays a fixed script, one step per run
#[derive(Debug)]
pub struct ScriptedWorker {
    id: WorkerId,
    kind: WorkerKind,
    script: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<Option<ContinuationInstruction>>>,
}

impl ScriptedWorker {
    pub fn new(kind: WorkerKind, script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            id: WorkerId::for_kind(kind),
            kind,
            script: Mutex::new(script.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Instructions received so far, `None` for the first launch
    pub async fn instructions(&self) -> Vec<Option<ContinuationInstruction>> {
        self.seen.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Worker for ScriptedWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn run(&self, task: WorkerTask) -> Result<TerminationSignal, CoreError> {
        self.seen.lock().await.push(task.instruction.clone());
        let step = self.script.lock().await.pop_front().unwrap_or(Step::Fail { fatal: false });
        match step {
            Step::Progress { primary, key, signal } => {
                let counts = ItemCounts {
                    processed: primary + key,
                    primary,
                    key,
                };
                task.checkpoints.save(
                    &self.id,
                    self.kind,
                    self.kind.as_str(),
                    counts,
                    None,
                    CheckpointContent::new(format!("{primary} primary, {key} key")),
                )?;
                Ok(signal)
            }
            Step::Corrupt => {
                let checkpoint = task.checkpoints.save(
                    &self.id,
                    self.kind,
                    self.kind.as_str(),
                    ItemCounts::default(),
                    None,
                    CheckpointContent::new("about to be clobbered"),
                )?;
                let path = task.checkpoints.checkpoint_path(&self.id, checkpoint.sequence);
                std::fs::write(&path, "{not json").map_err(|source| CoreError::DataDir { path, source })?;
                Ok(TerminationSignal::TurnLimitExhausted)
            }
            Step::Hang => {
                std::future::pending::<()>().await;
                Ok(TerminationSignal::Finished)
            }
            Step::Fail { fatal: true } => Err(CoreError::DataDir {
                path: "/dev/full".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"),
            }),
            Step::Fail { fatal: false } => Err(CoreError::WorkerFailed {
                worker: self.id.clone(),
                message: "search API returned 503".into(),
            }),
        }
    }
}
