//! Episodic window: bounded working set per active session
//!
//! - sessions live in memory only while active, capped by [`WindowLimits`]
//! - the working set keeps the most recent touches; older ones are evicted
//!   but still counted, once, in the per-domain totals
//! - ending a session writes `sessions/<session>.json` and a `session_end`
//!   record; a crashed session can be rebuilt from the temporal log

use chrono::{DateTime, Utc};
use delve_graph::{GraphRef, SemanticGraph};
use delve_types::{durable::write_atomic, SessionId, WorkerKind};
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::MemoryError;
use crate::temporal::{RecordProvenance, TemporalLog, SESSION_PHASE};

/// Note prefix of the record written by [`EpisodicWindow::start_session`]
pub const SESSION_START: &str = "session_start";
/// Note of the record written by [`EpisodicWindow::end_session`]
pub const SESSION_END: &str = "session_end";
/// Note of the record written by [`EpisodicWindow::complete_phase`]
pub const PHASE_COMPLETE: &str = "phase_complete";

/// Labels kept in a session summary for similarity search
const SUMMARY_CONTEXT_LABELS: usize = 5;

/// Episodic window bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowLimits {
    /// Maximum concurrently active sessions
    pub max_active_sessions: usize,
    /// Maximum refs kept in one session's working set
    pub working_set_limit: usize,
}

impl Default for WindowLimits {
    fn default() -> Self {
        Self {
            max_active_sessions: 16,
            working_set_limit: 1024,
        }
    }
}

/// Distinct touches for one domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCounts {
    /// Entities touched
    pub entities: usize,
    /// Relationships touched
    pub relationships: usize,
}

/// In-memory state of an active session
#[derive(Debug, Clone)]
pub struct EpisodicSession {
    /// Session id
    pub id: SessionId,
    /// Research query
    pub query: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Most recent touches, oldest first
    pub working_set: IndexSet<GraphRef>,
    /// Touch counters per originating domain
    pub per_domain: BTreeMap<WorkerKind, DomainCounts>,
    /// Entities touched
    pub entities_touched: usize,
    /// Relationships touched
    pub relationships_touched: usize,
    /// Completed phases in completion order
    pub phases_completed: Vec<String>,
    /// Every distinct ref ever touched; eviction does not clear it
    seen: HashSet<GraphRef>,
}

impl EpisodicSession {
    fn new(id: SessionId, query: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            query,
            started_at,
            working_set: IndexSet::new(),
            per_domain: BTreeMap::new(),
            entities_touched: 0,
            relationships_touched: 0,
            phases_completed: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Number of distinct refs touched, evicted ones included
    #[must_use]
    pub fn distinct_touched(&self) -> usize {
        self.seen.len()
    }

    /// Add a ref; returns `false` if it was already in the working set
    ///
    /// Counters move only the first time a ref is seen, so touching an
    /// evicted ref again brings it back without counting it twice.
    fn touch(&mut self, item: GraphRef, domain: Option<WorkerKind>, limit: usize) -> bool {
        let is_entity = matches!(item, GraphRef::Entity { .. });
        let first_time = self.seen.insert(item.clone());
        if !self.working_set.insert(item) {
            return false;
        }
        while self.working_set.len() > limit.max(1) {
            self.working_set.shift_remove_index(0);
        }
        if !first_time {
            return true;
        }
        if is_entity {
            self.entities_touched += 1;
        } else {
            self.relationships_touched += 1;
        }
        if let Some(domain) = domain {
            let counts = self.per_domain.entry(domain).or_default();
            if is_entity {
                counts.entities += 1;
            } else {
                counts.relationships += 1;
            }
        }
        true
    }

    fn complete_phase(&mut self, phase: &str) {
        if !self.phases_completed.iter().any(|p| p == phase) {
            self.phases_completed.push(phase.to_string());
        }
    }
}

/// Persisted summary of a finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id
    pub session: SessionId,
    /// Research query
    pub query: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub ended_at: DateTime<Utc>,
    /// Entities touched
    pub entities_touched: usize,
    /// Relationships touched
    pub relationships_touched: usize,
    /// Touches per originating domain
    pub per_domain: BTreeMap<WorkerKind, DomainCounts>,
    /// Phases completed
    pub phases_completed: Vec<String>,
    /// Labels of the most recently touched entities
    #[serde(default)]
    pub context: Vec<String>,
}

/// Past session ranked by lexical similarity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarSession {
    /// Session id
    pub session: SessionId,
    /// The session's query
    pub query: String,
    /// Jaccard similarity in `(0, 1]`
    pub similarity: f64,
}

/// Bounded registry of active sessions
#[derive(Debug)]
pub struct EpisodicWindow {
    graph: Arc<SemanticGraph>,
    log: Arc<TemporalLog>,
    sessions_dir: PathBuf,
    limits: WindowLimits,
    active: Mutex<HashMap<SessionId, EpisodicSession>>,
}

impl EpisodicWindow {
    /// Window persisting summaries under `<data_dir>/sessions`
    #[must_use]
    pub fn new(
        data_dir: impl AsRef<Path>,
        graph: Arc<SemanticGraph>,
        log: Arc<TemporalLog>,
        limits: WindowLimits,
    ) -> Self {
        Self {
            graph,
            log,
            sessions_dir: data_dir.as_ref().join("sessions"),
            limits,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Configured bounds
    #[must_use]
    pub fn limits(&self) -> WindowLimits {
        self.limits
    }

    fn summary_path(&self, session: SessionId) -> PathBuf {
        self.sessions_dir.join(format!("{session}.json"))
    }

    /// Open a new session
    ///
    /// # Errors
    /// [`MemoryError::WindowFull`] when the active-session cap is reached,
    /// otherwise fatal log errors
    pub fn start_session(&self, query: &str) -> Result<SessionId, MemoryError> {
        let mut active = self.active.lock();
        if active.len() >= self.limits.max_active_sessions {
            return Err(MemoryError::WindowFull {
                limit: self.limits.max_active_sessions,
            });
        }
        let id = SessionId::new();
        let record = self.log.append(
            id,
            SESSION_PHASE,
            Vec::new(),
            RecordProvenance::note(format!("{SESSION_START}: {query}")),
        )?;
        active.insert(id, EpisodicSession::new(id, query.to_string(), record.timestamp));
        info!(session = %id, query, "session started");
        Ok(id)
    }

    fn domain_of(&self, item: &GraphRef) -> Option<WorkerKind> {
        match item {
            GraphRef::Entity { key } => self.graph.entity(key).map(|e| e.domain),
            GraphRef::Relationship { key } => self.graph.relationship(key).map(|r| r.provenance.worker),
        }
    }

    /// Add a graph item to the session's working set
    ///
    /// Returns `false` when the item was already present.
    ///
    /// # Errors
    /// [`MemoryError::SessionNotFound`] if the session is not active
    pub fn touch(&self, session: SessionId, item: GraphRef) -> Result<bool, MemoryError> {
        let domain = self.domain_of(&item);
        let mut active = self.active.lock();
        let state = active
            .get_mut(&session)
            .ok_or(MemoryError::SessionNotFound(session))?;
        Ok(state.touch(item, domain, self.limits.working_set_limit))
    }

    /// Mark a phase complete and record it in the temporal log
    ///
    /// # Errors
    /// [`MemoryError::SessionNotFound`] if the session is not active,
    /// otherwise log errors
    pub fn complete_phase(&self, session: SessionId, phase: &str) -> Result<(), MemoryError> {
        let mut active = self.active.lock();
        let state = active
            .get_mut(&session)
            .ok_or(MemoryError::SessionNotFound(session))?;
        self.log
            .append(session, phase, Vec::new(), RecordProvenance::note(PHASE_COMPLETE))?;
        state.complete_phase(phase);
        debug!(%session, phase, "phase completed");
        Ok(())
    }

    /// Snapshot of an active session
    #[must_use]
    pub fn session(&self, session: SessionId) -> Option<EpisodicSession> {
        self.active.lock().get(&session).cloned()
    }

    /// Ids of active sessions, oldest first
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.active.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Close a session, persisting its summary
    ///
    /// # Errors
    /// [`MemoryError::SessionNotFound`] if the session is not active,
    /// otherwise fatal I/O errors (the session then stays active)
    pub fn end_session(&self, session: SessionId) -> Result<SessionSummary, MemoryError> {
        let state = self
            .session(session)
            .ok_or(MemoryError::SessionNotFound(session))?;

        let context: Vec<String> = state
            .working_set
            .iter()
            .rev()
            .filter_map(|item| match item {
                GraphRef::Entity { key } => self.graph.entity(key).map(|e| e.label().to_string()),
                GraphRef::Relationship { .. } => None,
            })
            .take(SUMMARY_CONTEXT_LABELS)
            .collect();

        let summary = SessionSummary {
            session,
            query: state.query.clone(),
            started_at: state.started_at,
            ended_at: Utc::now(),
            entities_touched: state.entities_touched,
            relationships_touched: state.relationships_touched,
            per_domain: state.per_domain.clone(),
            phases_completed: state.phases_completed.clone(),
            context,
        };

        let path = self.summary_path(session);
        let bytes = serde_json::to_vec_pretty(&summary).map_err(|source| MemoryError::Corrupt {
            path: path.clone(),
            line: 0,
            source,
        })?;
        write_atomic(&path, &bytes).map_err(|e| MemoryError::io(&path, e))?;
        self.log.append(
            session,
            SESSION_PHASE,
            state.working_set.into_iter().collect(),
            RecordProvenance::note(SESSION_END),
        )?;

        self.active.lock().remove(&session);
        info!(
            %session,
            entities = summary.entities_touched,
            relationships = summary.relationships_touched,
            phases = summary.phases_completed.len(),
            "session ended"
        );
        Ok(summary)
    }

    /// Load a persisted session summary
    ///
    /// # Errors
    /// [`MemoryError::SessionNotFound`] if no summary exists
    pub fn summary(&self, session: SessionId) -> Result<SessionSummary, MemoryError> {
        let path = self.summary_path(session);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MemoryError::SessionNotFound(session))
            }
            Err(e) => return Err(MemoryError::io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| MemoryError::Corrupt { path, line: 0, source })
    }

    /// Past sessions whose query and context resemble `query`
    ///
    /// Active sessions are skipped. Unreadable summaries are ignored, so
    /// this never fails.
    #[must_use]
    pub fn find_similar_sessions(&self, query: &str, top_k: usize) -> Vec<SimilarSession> {
        let wanted = tokenize(query);
        if wanted.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };
        let active: HashSet<SessionId> = self.active.lock().keys().copied().collect();

        let mut out: Vec<SimilarSession> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let id: SessionId = entry.path().file_stem()?.to_str()?.parse().ok()?;
                if active.contains(&id) {
                    return None;
                }
                let summary = match self.summary(id) {
                    Ok(summary) => summary,
                    Err(e) => {
                        debug!(session = %id, error = %e, "skipping unreadable session summary");
                        return None;
                    }
                };
                let mut text = summary.query.clone();
                for label in &summary.context {
                    text.push(' ');
                    text.push_str(label);
                }
                let similarity = jaccard(&wanted, &tokenize(&text));
                (similarity > 0.0).then_some(SimilarSession {
                    session: id,
                    query: summary.query,
                    similarity,
                })
            })
            .collect();

        out.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then(a.session.cmp(&b.session)));
        out.truncate(top_k);
        out
    }

    /// Rebuild an active session from its temporal records after a crash
    ///
    /// An already active session is returned as is.
    ///
    /// # Errors
    /// [`MemoryError::SessionNotFound`] if the log has no start record,
    /// [`MemoryError::SessionEnded`] if the session was closed normally,
    /// [`MemoryError::WindowFull`] if no slot is free
    pub fn recover_session(&self, session: SessionId) -> Result<EpisodicSession, MemoryError> {
        if let Some(existing) = self.session(session) {
            return Ok(existing);
        }

        let mut state: Option<EpisodicSession> = None;
        let mut touches: Vec<GraphRef> = Vec::new();
        for record in &self.log.replay(session, None)? {
            let record = record?;
            let note = record.provenance.note.as_str();
            if record.phase == SESSION_PHASE {
                if note == SESSION_END {
                    return Err(MemoryError::SessionEnded(session));
                }
                if let Some(query) = note.strip_prefix(SESSION_START) {
                    let query = query.strip_prefix(": ").unwrap_or(query).to_string();
                    state = Some(EpisodicSession::new(session, query, record.timestamp));
                }
            }
            if let Some(state) = state.as_mut() {
                if note == PHASE_COMPLETE {
                    state.complete_phase(&record.phase);
                }
            }
            touches.extend(record.touched);
        }
        let mut state = state.ok_or(MemoryError::SessionNotFound(session))?;

        for item in touches {
            let domain = self.domain_of(&item);
            state.touch(item, domain, self.limits.working_set_limit);
        }

        let mut active = self.active.lock();
        if let Some(existing) = active.get(&session) {
            return Ok(existing.clone());
        }
        if active.len() >= self.limits.max_active_sessions {
            return Err(MemoryError::WindowFull {
                limit: self.limits.max_active_sessions,
            });
        }
        active.insert(session, state.clone());
        info!(%session, working_set = state.working_set.len(), "session recovered");
        Ok(state)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let score = a.intersection(b).count() as f64 / union as f64;
    score
}
