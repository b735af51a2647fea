//! Checkpoint records and the durable per-worker checkpoint store
//!
//! Layout: `checkpoints/<worker>/<seq:06>.json` plus a `LATEST` pointer
//! holding the file name of the newest checkpoint. Both are written with
//! [`write_atomic`], checkpoint first, so a crash between the two leaves a
//! stale pointer that [`CheckpointManager::latest`] detects.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use delve_memory::{RecordProvenance, TemporalLog};
use delve_types::durable::write_atomic;
use delve_types::{SessionId, TimeAssessment, WorkerId, WorkerKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::CheckpointError;
use crate::requirements::{MinimumCheck, RequirementTable};

const LATEST: &str = "LATEST";
const CHECKPOINT_NOTE: &str = "checkpoint";

/// Item counts reported by a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    /// Items looked at
    pub processed: u32,
    /// Primary items analyzed (papers, projects, threads)
    pub primary: u32,
    /// Key findings extracted
    pub key: u32,
}

/// Worker-provided checkpoint content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointContent {
    /// What has been done so far
    #[serde(default)]
    pub work_summary: String,
    /// What the worker would do next
    #[serde(default)]
    pub next_steps: Vec<String>,
    /// Free-form extras
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl CheckpointContent {
    /// Content with a summary
    #[must_use]
    pub fn new(work_summary: impl Into<String>) -> Self {
        Self {
            work_summary: work_summary.into(),
            ..Self::default()
        }
    }

    /// Add next steps
    #[must_use]
    pub fn with_next_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_steps.extend(steps.into_iter().map(Into::into));
        self
    }
}

/// Durable progress snapshot of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Worker stream
    pub worker: WorkerId,
    /// Worker kind
    pub kind: WorkerKind,
    /// Sequence within the stream, starting at 1
    pub sequence: u64,
    /// Research phase
    pub phase: String,
    /// Write time
    pub timestamp: DateTime<Utc>,
    /// Progress counts
    pub counts: ItemCounts,
    /// Time assessment at write time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeAssessment>,
    /// Worker content
    pub content: CheckpointContent,
}

impl Checkpoint {
    /// File name of this checkpoint
    #[must_use]
    pub fn file_name(&self) -> String {
        file_name(self.sequence)
    }
}

fn file_name(sequence: u64) -> String {
    format!("{sequence:06}.json")
}

fn parse_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".json")?.parse().ok()
}

/// Per-worker stream state, loaded lazily from disk
#[derive(Debug, Default)]
struct Stream {
    last_sequence: Option<u64>,
}

/// Durable checkpoint store
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    requirements: RequirementTable,
    streams: DashMap<WorkerId, Arc<Mutex<Stream>>>,
    temporal: Option<(Arc<TemporalLog>, SessionId)>,
}

impl CheckpointManager {
    /// Store rooted at `<data_dir>/checkpoints`
    #[must_use]
    pub fn new(data_dir: impl AsRef<Path>, requirements: RequirementTable) -> Self {
        Self {
            dir: data_dir.as_ref().join("checkpoints"),
            requirements,
            streams: DashMap::new(),
            temporal: None,
        }
    }

    /// Also record every checkpoint in the temporal log of `session`
    #[must_use]
    pub fn with_temporal_log(mut self, log: Arc<TemporalLog>, session: SessionId) -> Self {
        self.temporal = Some((log, session));
        self
    }

    /// Requirement table in effect
    #[must_use]
    pub fn requirements(&self) -> &RequirementTable {
        &self.requirements
    }

    fn worker_dir(&self, worker: &WorkerId) -> PathBuf {
        self.dir.join(worker.as_str())
    }

    /// File holding checkpoint `sequence` of `worker`
    #[must_use]
    pub fn checkpoint_path(&self, worker: &WorkerId, sequence: u64) -> PathBuf {
        self.worker_dir(worker).join(file_name(sequence))
    }

    fn stream(&self, worker: &WorkerId) -> Arc<Mutex<Stream>> {
        Arc::clone(self.streams.entry(worker.clone()).or_default().value())
    }

    /// Durably write the next checkpoint of `worker`
    ///
    /// Returns only after the checkpoint file and the `LATEST` pointer have
    /// reached stable storage.
    ///
    /// # Errors
    /// Fatal I/O errors, or temporal log errors when a log is attached
    pub fn save(
        &self,
        worker: &WorkerId,
        kind: WorkerKind,
        phase: &str,
        counts: ItemCounts,
        time: Option<TimeAssessment>,
        content: CheckpointContent,
    ) -> Result<Checkpoint, CheckpointError> {
        let stream = self.stream(worker);
        let mut stream = stream.lock();
        let last = match stream.last_sequence {
            Some(seq) => seq,
            None => self.scan_max_sequence(worker)?.unwrap_or(0),
        };

        let checkpoint = Checkpoint {
            worker: worker.clone(),
            kind,
            sequence: last + 1,
            phase: phase.to_string(),
            timestamp: Utc::now(),
            counts,
            time,
            content,
        };

        let dir = self.worker_dir(worker);
        let path = self.checkpoint_path(worker, checkpoint.sequence);
        let bytes = serde_json::to_vec_pretty(&checkpoint).map_err(|source| CheckpointError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).map_err(|e| CheckpointError::io(&path, e))?;
        let latest = dir.join(LATEST);
        write_atomic(&latest, checkpoint.file_name().as_bytes())
            .map_err(|e| CheckpointError::io(&latest, e))?;
        stream.last_sequence = Some(checkpoint.sequence);

        if let Some((log, session)) = &self.temporal {
            log.append(
                *session,
                phase,
                Vec::new(),
                RecordProvenance::note(CHECKPOINT_NOTE)
                    .with_worker(worker.clone())
                    .with_checkpoint(checkpoint.sequence),
            )?;
        }

        info!(
            %worker,
            sequence = checkpoint.sequence,
            phase,
            primary = counts.primary,
            key = counts.key,
            "checkpoint saved"
        );
        Ok(checkpoint)
    }

    fn sequences(&self, worker: &WorkerId) -> Result<Vec<u64>, CheckpointError> {
        let dir = self.worker_dir(worker);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(dir, e)),
        };
        let mut sequences = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(&dir, e))?;
            if let Some(seq) = entry.file_name().to_str().and_then(parse_file_name) {
                sequences.push(seq);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    fn scan_max_sequence(&self, worker: &WorkerId) -> Result<Option<u64>, CheckpointError> {
        Ok(self.sequences(worker)?.last().copied())
    }

    fn read(&self, worker: &WorkerId, sequence: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.checkpoint_path(worker, sequence);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt { path, source })
    }

    fn pointer(&self, worker: &WorkerId) -> Option<u64> {
        let path = self.worker_dir(worker).join(LATEST);
        let text = std::fs::read_to_string(path).ok()?;
        parse_file_name(text.trim())
    }

    /// Newest checkpoint of `worker`, if any
    ///
    /// Follows the `LATEST` pointer; falls back to a directory scan when the
    /// pointer is missing, unreadable or behind a newer checkpoint file.
    ///
    /// # Errors
    /// I/O errors or a corrupt checkpoint file
    pub fn latest(&self, worker: &WorkerId) -> Result<Option<Checkpoint>, CheckpointError> {
        if let Some(seq) = self.pointer(worker) {
            let newer_exists = self.worker_dir(worker).join(file_name(seq + 1)).exists();
            if !newer_exists {
                if let Some(checkpoint) = self.read(worker, seq)? {
                    debug!(%worker, sequence = seq, "latest checkpoint via pointer");
                    return Ok(Some(checkpoint));
                }
            }
            warn!(%worker, pointer = seq, "stale LATEST pointer, scanning checkpoint directory");
        }
        match self.scan_max_sequence(worker)? {
            Some(seq) => self.read(worker, seq),
            None => Ok(None),
        }
    }

    /// Every checkpoint of `worker`, oldest first
    ///
    /// # Errors
    /// I/O errors or a corrupt checkpoint file
    pub fn history(&self, worker: &WorkerId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut out = Vec::new();
        for seq in self.sequences(worker)? {
            if let Some(checkpoint) = self.read(worker, seq)? {
                out.push(checkpoint);
            }
        }
        Ok(out)
    }

    /// Workers with at least one checkpoint directory
    ///
    /// # Errors
    /// I/O errors listing the store
    pub fn workers(&self) -> Result<Vec<WorkerId>, CheckpointError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.dir, e)),
        };
        let mut workers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(&self.dir, e))?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| WorkerId::new(n).ok()) {
                workers.push(id);
            }
        }
        workers.sort();
        Ok(workers)
    }

    /// Compare the latest checkpoint against the configured requirement
    ///
    /// A worker without checkpoints counts as zero progress.
    ///
    /// # Errors
    /// I/O errors or a corrupt checkpoint file
    pub fn meets_minimum(&self, worker: &WorkerId, kind: WorkerKind) -> Result<MinimumCheck, CheckpointError> {
        let counts = self.latest(worker)?.map(|c| c.counts).unwrap_or_default();
        Ok(MinimumCheck::evaluate(self.requirements.get(kind), counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(file_name(3), "000003.json");
        assert_eq!(parse_file_name("000042.json"), Some(42));
        assert_eq!(parse_file_name("LATEST"), None);
        assert_eq!(parse_file_name("000001.json.tmp"), None);
    }

    #[test]
    fn stale_pointer_falls_back_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), RequirementTable::default());
        let worker = WorkerId::for_kind(WorkerKind::Academic);
        for n in 1..=3 {
            manager
                .save(
                    &worker,
                    WorkerKind::Academic,
                    "phase1",
                    ItemCounts { processed: n, primary: n, key: 0 },
                    None,
                    CheckpointContent::default(),
                )
                .unwrap();
        }

        let latest_path = dir.path().join("checkpoints").join(worker.as_str()).join(LATEST);
        std::fs::write(&latest_path, "000001.json").unwrap();
        assert_eq!(manager.latest(&worker).unwrap().unwrap().sequence, 3);

        std::fs::remove_file(&latest_path).unwrap();
        assert_eq!(manager.latest(&worker).unwrap().unwrap().sequence, 3);

        std::fs::write(&latest_path, "garbage").unwrap();
        assert_eq!(manager.latest(&worker).unwrap().unwrap().sequence, 3);
    }
}
