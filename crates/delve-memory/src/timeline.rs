//! Read-side views over the temporal log
//!
//! - [`TemporalLog::provenance`]: every record that touched a graph item
//! - [`TemporalLog::records_between`]: records inside a time window
//! - [`TemporalLog::timeline`]: one event per record of a session
//! - [`TemporalLog::evolution`]: per-phase progress snapshots of a session

use chrono::{DateTime, Utc};
use delve_graph::GraphRef;
use delve_types::{SessionId, WorkerId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::MemoryError;
use crate::temporal::{TemporalLog, TemporalRecord};

/// One entry of a session timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Record sequence number
    pub seq: u64,
    /// Record time
    pub timestamp: DateTime<Utc>,
    /// Phase the record belongs to
    pub phase: String,
    /// Provenance note
    pub note: String,
    /// Producing worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
    /// Checkpoint sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<u64>,
    /// Number of graph items touched
    pub touched: usize,
}

impl From<&TemporalRecord> for TimelineEvent {
    fn from(record: &TemporalRecord) -> Self {
        Self {
            seq: record.seq,
            timestamp: record.timestamp,
            phase: record.phase.clone(),
            note: record.provenance.note.clone(),
            worker: record.provenance.worker.clone(),
            checkpoint: record.provenance.checkpoint,
            touched: record.touched.len(),
        }
    }
}

/// Progress of one phase, as of its last record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    /// Phase name
    pub phase: String,
    /// First record
    pub started_at: DateTime<Utc>,
    /// Last record
    pub last_at: DateTime<Utc>,
    /// Records in the phase
    pub records: usize,
    /// Records written for checkpoints
    pub checkpoints: usize,
    /// Distinct items touched in the phase
    pub touched: usize,
    /// Distinct items touched by the session up to the phase's last record
    pub cumulative_touched: usize,
}

fn by_time(records: &mut [TemporalRecord]) {
    records.sort_by(|a, b| (a.timestamp, a.seq).cmp(&(b.timestamp, b.seq)));
}

impl TemporalLog {
    fn scan(
        &self,
        session: Option<SessionId>,
        mut keep: impl FnMut(&TemporalRecord) -> bool,
    ) -> Result<Vec<TemporalRecord>, MemoryError> {
        let sessions = match session {
            Some(session) => vec![session],
            None => self.sessions()?,
        };
        let mut out = Vec::new();
        for session in sessions {
            for record in &self.replay(session, None)? {
                let record = record?;
                if keep(&record) {
                    out.push(record);
                }
            }
        }
        by_time(&mut out);
        Ok(out)
    }

    /// Every record, across sessions, that touched `item`, oldest first
    ///
    /// The first entry is where the item was discovered.
    ///
    /// # Errors
    /// I/O failures or undecodable records
    pub fn provenance(&self, item: &GraphRef) -> Result<Vec<TemporalRecord>, MemoryError> {
        self.scan(None, |record| record.touched.contains(item))
    }

    /// Records with `from <= timestamp <= to`, optionally limited to one session
    ///
    /// # Errors
    /// I/O failures or undecodable records
    pub fn records_between(
        &self,
        session: Option<SessionId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TemporalRecord>, MemoryError> {
        if from > to {
            return Ok(Vec::new());
        }
        self.scan(session, |record| (from..=to).contains(&record.timestamp))
    }

    /// Events of a session in replay order
    ///
    /// # Errors
    /// I/O failures or undecodable records
    pub fn timeline(&self, session: SessionId) -> Result<Vec<TimelineEvent>, MemoryError> {
        self.replay(session, None)?
            .iter()
            .map(|record| record.map(|r| TimelineEvent::from(&r)))
            .collect()
    }

    /// Per-phase snapshots of a session, in the order the phases started
    ///
    /// # Errors
    /// I/O failures or undecodable records
    pub fn evolution(&self, session: SessionId) -> Result<Vec<PhaseSnapshot>, MemoryError> {
        let mut seen: HashSet<GraphRef> = HashSet::new();
        let mut phases: IndexMap<String, (PhaseSnapshot, HashSet<GraphRef>)> = IndexMap::new();
        for record in &self.replay(session, None)? {
            let record = record?;
            let (snapshot, touched) = phases.entry(record.phase.clone()).or_insert_with(|| {
                (
                    PhaseSnapshot {
                        phase: record.phase.clone(),
                        started_at: record.timestamp,
                        last_at: record.timestamp,
                        records: 0,
                        checkpoints: 0,
                        touched: 0,
                        cumulative_touched: 0,
                    },
                    HashSet::new(),
                )
            });
            for item in &record.touched {
                seen.insert(item.clone());
                touched.insert(item.clone());
            }
            snapshot.last_at = record.timestamp;
            snapshot.records += 1;
            if record.provenance.checkpoint.is_some() {
                snapshot.checkpoints += 1;
            }
            snapshot.touched = touched.len();
            snapshot.cumulative_touched = seen.len();
        }
        Ok(phases.into_values().map(|(snapshot, _)| snapshot).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::RecordProvenance;
    use chrono::Duration;
    use delve_graph::EntityKey;
    use pretty_assertions::assert_eq;

    fn paper(id: &str) -> GraphRef {
        GraphRef::from(EntityKey::paper(id))
    }

    #[test]
    fn provenance_spans_sessions_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = TemporalLog::open(dir.path()).unwrap();
        let (first, second) = (SessionId::new(), SessionId::new());
        let worker = WorkerId::new("academic-researcher").unwrap();

        let found = log
            .append(
                first,
                "academic",
                vec![paper("1"), paper("2")],
                RecordProvenance::note("findings").with_worker(worker.clone()),
            )
            .unwrap();
        log.append(first, "github", vec![paper("3")], RecordProvenance::note("findings"))
            .unwrap();
        let revisited = log
            .append(second, "community", vec![paper("1")], RecordProvenance::note("findings"))
            .unwrap();

        let records = log.provenance(&paper("1")).unwrap();
        assert_eq!(
            records.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![found.seq, revisited.seq]
        );
        assert_eq!(records[0].provenance.worker, Some(worker));
        assert!(log.provenance(&paper("9")).unwrap().is_empty());
    }

    #[test]
    fn records_between_is_inclusive_and_filters_session() {
        let dir = tempfile::tempdir().unwrap();
        let log = TemporalLog::open(dir.path()).unwrap();
        let (a, b) = (SessionId::new(), SessionId::new());
        let first = log.append(a, "p1", Vec::new(), RecordProvenance::note("a1")).unwrap();
        let other = log.append(b, "p1", Vec::new(), RecordProvenance::note("b1")).unwrap();
        let last = log.append(a, "p2", Vec::new(), RecordProvenance::note("a2")).unwrap();

        let all = log
            .records_between(None, first.timestamp, last.timestamp)
            .unwrap();
        assert_eq!(all.len(), 3);

        let only_a = log
            .records_between(Some(a), first.timestamp, last.timestamp)
            .unwrap();
        assert_eq!(only_a.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![first.seq, last.seq]);
        assert!(!only_a.iter().any(|r| r.seq == other.seq));

        let before = first.timestamp - Duration::seconds(60);
        assert!(log
            .records_between(None, before, before + Duration::seconds(1))
            .unwrap()
            .is_empty());
        assert!(log
            .records_between(None, last.timestamp, first.timestamp - Duration::seconds(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn timeline_and_evolution_follow_phases() {
        let dir = tempfile::tempdir().unwrap();
        let log = TemporalLog::open(dir.path()).unwrap();
        let session = SessionId::new();
        log.append(session, "academic", vec![paper("1"), paper("2")], RecordProvenance::note("findings"))
            .unwrap();
        log.append(
            session,
            "academic",
            Vec::new(),
            RecordProvenance::note("checkpoint").with_checkpoint(1),
        )
        .unwrap();
        log.append(session, "github", vec![paper("2"), paper("3")], RecordProvenance::note("findings"))
            .unwrap();

        let timeline = log.timeline(session).unwrap();
        assert_eq!(
            timeline.iter().map(|e| e.note.as_str()).collect::<Vec<_>>(),
            vec!["findings", "checkpoint", "findings"]
        );
        assert_eq!(timeline[1].checkpoint, Some(1));
        assert_eq!(timeline[2].touched, 2);

        let evolution = log.evolution(session).unwrap();
        assert_eq!(evolution.len(), 2);
        let (academic, github) = (&evolution[0], &evolution[1]);
        assert_eq!(academic.phase, "academic");
        assert_eq!((academic.records, academic.checkpoints, academic.touched), (2, 1, 2));
        assert_eq!(academic.cumulative_touched, 2);
        assert_eq!(github.phase, "github");
        assert_eq!((github.records, github.touched, github.cumulative_touched), (1, 2, 3));
        assert!(github.started_at >= academic.started_at);

        assert!(log.evolution(SessionId::new()).unwrap().is_empty());
    }
}
