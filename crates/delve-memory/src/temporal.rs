//! Temporal log: append-only provenance timeline
//!
//! Layout: `temporal/<session>/<phase>.jsonl`, one [`TemporalRecord`] per line.
//!
//! - sequence numbers are global and strictly increasing across sessions
//! - each record's `hash` covers its content and the previous record of the
//!   same session (`prev_hash`), the first record chains to [`GENESIS_HASH`]
//! - every append is flushed to stable storage before it returns

use chrono::{DateTime, Utc};
use delve_graph::GraphRef;
use delve_types::{durable, validate_path_segment, SessionId, WorkerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::MemoryError;

/// `prev_hash` of the first record in a session
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Phase used for session lifecycle records
pub const SESSION_PHASE: &str = "session";

const RECORD_EXT: &str = "jsonl";

/// Where a record came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordProvenance {
    /// Worker that produced the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
    /// Checkpoint sequence this record belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<u64>,
    /// Free text
    #[serde(default)]
    pub note: String,
}

impl RecordProvenance {
    /// Provenance with only a note
    #[must_use]
    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: note.into(),
            ..Self::default()
        }
    }

    /// Attach the producing worker
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Attach a checkpoint sequence number
    #[must_use]
    pub fn with_checkpoint(mut self, sequence: u64) -> Self {
        self.checkpoint = Some(sequence);
        self
    }
}

/// Immutable entry of the temporal log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalRecord {
    /// Global sequence number
    pub seq: u64,
    /// Owning session
    pub session: SessionId,
    /// Phase the record was appended under
    pub phase: String,
    /// Append time
    pub timestamp: DateTime<Utc>,
    /// Graph items touched
    #[serde(default)]
    pub touched: Vec<GraphRef>,
    /// Provenance note
    pub provenance: RecordProvenance,
    /// Hash of the previous record of this session
    pub prev_hash: String,
    /// Hash of this record
    pub hash: String,
}

impl TemporalRecord {
    /// Recompute the content hash
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_le_bytes());
        hasher.update(self.session.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.phase.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.timestamp.timestamp().to_le_bytes());
        hasher.update(self.timestamp.timestamp_subsec_nanos().to_le_bytes());
        for touched in &self.touched {
            hasher.update(touched.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
        if let Some(worker) = &self.provenance.worker {
            hasher.update(worker.as_str().as_bytes());
        }
        hasher.update([0u8]);
        match self.provenance.checkpoint {
            Some(seq) => {
                hasher.update([1u8]);
                hasher.update(seq.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(self.provenance.note.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.prev_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.seq)
    }
}

#[derive(Debug, Default)]
struct LogState {
    next_seq: u64,
    /// Last hash per session
    heads: HashMap<SessionId, (u64, String)>,
}

/// Append-only, hash-chained provenance log
#[derive(Debug)]
pub struct TemporalLog {
    dir: PathBuf,
    state: Mutex<LogState>,
}

impl TemporalLog {
    /// Open the log under `<data_dir>/temporal`, recovering sequence state
    ///
    /// # Errors
    /// I/O failures or undecodable records
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let dir = data_dir.as_ref().join("temporal");
        fs::create_dir_all(&dir).map_err(|e| MemoryError::io(&dir, e))?;

        let log = Self {
            dir,
            state: Mutex::new(LogState::default()),
        };

        let mut state = LogState::default();
        for session in log.sessions()? {
            for (_, path) in log.phase_files(session)? {
                for record in read_records(&path)? {
                    state.next_seq = state.next_seq.max(record.seq + 1);
                    let head = state
                        .heads
                        .entry(session)
                        .or_insert((record.seq, record.hash.clone()));
                    if record.seq >= head.0 {
                        *head = (record.seq, record.hash);
                    }
                }
            }
        }
        debug!(dir = %log.dir.display(), next_seq = state.next_seq, sessions = state.heads.len(), "opened temporal log");
        *log.state.lock() = state;
        Ok(log)
    }

    /// Root directory of the log
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_dir(&self, session: SessionId) -> PathBuf {
        self.dir.join(session.to_string())
    }

    /// Append one record and flush it to stable storage
    ///
    /// # Errors
    /// [`MemoryError::InvalidPhase`] for phase names that are not path-safe,
    /// otherwise fatal I/O errors
    pub fn append(
        &self,
        session: SessionId,
        phase: &str,
        touched: Vec<GraphRef>,
        provenance: RecordProvenance,
    ) -> Result<TemporalRecord, MemoryError> {
        validate_path_segment(phase).map_err(|_| MemoryError::InvalidPhase(phase.to_string()))?;

        let mut state = self.state.lock();
        let prev_hash = state
            .heads
            .get(&session)
            .map_or_else(|| GENESIS_HASH.to_string(), |(_, h)| h.clone());

        let mut record = TemporalRecord {
            seq: state.next_seq,
            session,
            phase: phase.to_string(),
            timestamp: Utc::now(),
            touched,
            provenance,
            prev_hash,
            hash: String::new(),
        };
        record.hash = record.compute_hash();

        let session_dir = self.session_dir(session);
        let path = session_dir.join(format!("{phase}.{RECORD_EXT}"));
        if let Err(e) = write_line(&session_dir, &path, &record) {
            error!(path = %path.display(), error = %e, "temporal append failed");
            return Err(e);
        }

        state.next_seq += 1;
        state.heads.insert(session, (record.seq, record.hash.clone()));
        debug!(seq = record.seq, %session, phase, touched = record.touched.len(), "appended temporal record");
        Ok(record)
    }

    /// Sessions present in the log, oldest first
    ///
    /// # Errors
    /// I/O failures listing the log directory
    pub fn sessions(&self) -> Result<Vec<SessionId>, MemoryError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::io(&self.dir, e)),
        };
        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MemoryError::io(&self.dir, e))?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                sessions.push(id);
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Phase files of a session, ordered by their first record
    fn phase_files(&self, session: SessionId) -> Result<Vec<(String, PathBuf)>, MemoryError> {
        let dir = self.session_dir(session);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::io(&dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| MemoryError::io(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(phase) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let first = first_record(&path)?.map(|r| r.order_key());
            files.push((first, phase, path));
        }
        // phases without records sort last
        files.sort_by(|a, b| match (&a.0, &b.0) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.1.cmp(&b.1),
        });
        Ok(files.into_iter().map(|(_, phase, path)| (phase, path)).collect())
    }

    /// Phases recorded for a session, in the order they started
    ///
    /// # Errors
    /// I/O failures or undecodable records
    pub fn phases(&self, session: SessionId) -> Result<Vec<String>, MemoryError> {
        Ok(self.phase_files(session)?.into_iter().map(|(phase, _)| phase).collect())
    }

    /// Lazy replay of a session ordered by `(timestamp, seq)`
    ///
    /// With `from_phase`, only that phase and the phases that started after
    /// it are replayed. An unknown session yields an empty replay.
    ///
    /// # Errors
    /// [`MemoryError::PhaseNotFound`] if `from_phase` was never recorded
    pub fn replay(&self, session: SessionId, from_phase: Option<&str>) -> Result<Replay, MemoryError> {
        let mut files = self.phase_files(session)?;
        if let Some(phase) = from_phase {
            let start = files
                .iter()
                .position(|(p, _)| p == phase)
                .ok_or_else(|| MemoryError::PhaseNotFound {
                    session,
                    phase: phase.to_string(),
                })?;
            files = files.split_off(start);
        }
        Ok(Replay {
            session,
            files: files.into_iter().map(|(_, path)| path).collect(),
        })
    }

    /// Verify the hash chain of a session, returning the record count
    ///
    /// # Errors
    /// [`MemoryError::ChainBroken`] at the first record whose hash or link
    /// does not match, which also catches lost records
    pub fn verify_chain(&self, session: SessionId) -> Result<usize, MemoryError> {
        let mut records = self.replay(session, None)?.records()?;
        records.sort_by_key(|r| r.seq);

        let mut prev = GENESIS_HASH.to_string();
        for record in &records {
            if record.prev_hash != prev || record.hash != record.compute_hash() {
                return Err(MemoryError::ChainBroken {
                    session,
                    seq: record.seq,
                });
            }
            prev.clone_from(&record.hash);
        }
        Ok(records.len())
    }
}

fn write_line(session_dir: &Path, path: &Path, record: &TemporalRecord) -> Result<(), MemoryError> {
    let created_dir = !session_dir.exists();
    if created_dir {
        fs::create_dir_all(session_dir).map_err(|e| MemoryError::io(session_dir, e))?;
    }
    let mut line = serde_json::to_vec(record).map_err(|e| MemoryError::Corrupt {
        path: path.to_path_buf(),
        line: 0,
        source: e,
    })?;
    line.push(b'\n');

    let created_file = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| MemoryError::io(path, e))?;
    file.write_all(&line).map_err(|e| MemoryError::io(path, e))?;
    file.sync_data().map_err(|e| MemoryError::io(path, e))?;

    if created_file {
        durable::sync_dir(session_dir).map_err(|e| MemoryError::io(session_dir, e))?;
    }
    if created_dir {
        if let Some(parent) = session_dir.parent() {
            durable::sync_dir(parent).map_err(|e| MemoryError::io(parent, e))?;
        }
    }
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<TemporalRecord>, MemoryError> {
    RecordLines::open(path)?.collect()
}

fn first_record(path: &Path) -> Result<Option<TemporalRecord>, MemoryError> {
    RecordLines::open(path)?.next().transpose()
}

/// Line-by-line decoder of one phase file
struct RecordLines {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl RecordLines {
    fn open(path: &Path) -> Result<Self, MemoryError> {
        let file = File::open(path).map_err(|e| MemoryError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            line: 0,
        })
    }
}

impl Iterator for RecordLines {
    type Item = Result<TemporalRecord, MemoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(MemoryError::io(&self.path, e))),
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&text).map_err(|source| MemoryError::Corrupt {
                path: self.path.clone(),
                line: self.line,
                source,
            }));
        }
    }
}

/// Restartable replay of one session
///
/// Holds only file paths; every call to [`Replay::iter`] reopens them.
#[derive(Debug, Clone)]
pub struct Replay {
    session: SessionId,
    files: Vec<PathBuf>,
}

impl Replay {
    /// Session being replayed
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Whether there is nothing to replay
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Fresh iterator over the records, merged across phases
    #[must_use]
    pub fn iter(&self) -> ReplayIter {
        let mut sources = Vec::with_capacity(self.files.len());
        let mut errors = VecDeque::new();
        for path in &self.files {
            match RecordLines::open(path) {
                Ok(lines) => {
                    let mut source = Source { lines, head: None };
                    if let Err(e) = source.advance() {
                        errors.push_back(e);
                    }
                    sources.push(source);
                }
                Err(e) => errors.push_back(e),
            }
        }
        ReplayIter { sources, errors }
    }

    /// Collect every record
    ///
    /// # Errors
    /// The first I/O or decode failure
    pub fn records(&self) -> Result<Vec<TemporalRecord>, MemoryError> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &'a Replay {
    type Item = Result<TemporalRecord, MemoryError>;
    type IntoIter = ReplayIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

struct Source {
    lines: RecordLines,
    head: Option<TemporalRecord>,
}

impl Source {
    fn advance(&mut self) -> Result<(), MemoryError> {
        self.head = self.lines.next().transpose()?;
        Ok(())
    }
}

/// K-way merge over the phase files of a session
pub struct ReplayIter {
    sources: Vec<Source>,
    errors: VecDeque<MemoryError>,
}

impl Iterator for ReplayIter {
    type Item = Result<TemporalRecord, MemoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }
        let (idx, _) = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.head.as_ref().map(|h| (i, h.order_key())))
            .min_by_key(|(_, key)| *key)?;

        let source = &mut self.sources[idx];
        let record = source.head.take()?;
        if let Err(e) = source.advance() {
            self.errors.push_back(e);
        }
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_graph::EntityKey;

    fn touched(id: &str) -> Vec<GraphRef> {
        vec![GraphRef::from(EntityKey::paper(id))]
    }

    #[test]
    fn append_chains_and_numbers_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = TemporalLog::open(dir.path()).unwrap();
        let session = SessionId::new();

        let a = log.append(session, "academic", touched("1"), RecordProvenance::note("first")).unwrap();
        let b = log.append(session, "academic", touched("2"), RecordProvenance::note("second")).unwrap();

        assert_eq!(a.prev_hash, GENESIS_HASH);
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(b.seq, a.seq + 1);
        assert_eq!(log.verify_chain(session).unwrap(), 2);
    }

    #[test]
    fn reopen_continues_sequence_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionId::new();
        let first = {
            let log = TemporalLog::open(dir.path()).unwrap();
            log.append(session, "p1", Vec::new(), RecordProvenance::default()).unwrap()
        };

        let log = TemporalLog::open(dir.path()).unwrap();
        let second = log.append(session, "p2", Vec::new(), RecordProvenance::default()).unwrap();
        assert_eq!(second.seq, first.seq + 1);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(log.verify_chain(session).unwrap(), 2);
    }

    #[test]
    fn rejects_path_unsafe_phase() {
        let dir = tempfile::tempdir().unwrap();
        let log = TemporalLog::open(dir.path()).unwrap();
        let err = log
            .append(SessionId::new(), "../escape", Vec::new(), RecordProvenance::default())
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidPhase(_)));
    }

    #[test]
    fn unknown_session_replays_empty_and_unknown_phase_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = TemporalLog::open(dir.path()).unwrap();
        let missing = SessionId::new();

        let replay = log.replay(missing, None).unwrap();
        assert!(replay.is_empty());
        assert_eq!(replay.iter().count(), 0);

        let session = SessionId::new();
        log.append(session, "p1", Vec::new(), RecordProvenance::default()).unwrap();
        let err = log.replay(session, Some("p9")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn tampered_record_breaks_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log = TemporalLog::open(dir.path()).unwrap();
        let session = SessionId::new();
        log.append(session, "p1", touched("1"), RecordProvenance::note("original")).unwrap();
        let second = log.append(session, "p1", touched("2"), RecordProvenance::note("keep")).unwrap();

        let path = log.dir().join(session.to_string()).join("p1.jsonl");
        let text = fs::read_to_string(&path).unwrap().replace("original", "forged");
        fs::write(&path, text).unwrap();

        match log.verify_chain(session) {
            Err(MemoryError::ChainBroken { seq, .. }) => assert_eq!(seq, second.seq - 1),
            other => panic!("expected broken chain, got {other:?}"),
        }
    }
}
