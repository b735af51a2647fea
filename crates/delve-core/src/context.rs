//! Explicit research session handle
//!
//! [`ResearchContext`] replaces process-wide singletons: it is opened at the
//! start of a research session, passed to whoever needs the stores, and
//! closed at the end, which flushes the graph and persists the session
//! summary.

use crate::config::DelveConfig;
use crate::continuation::ContinuationController;
use crate::error::CoreError;
use crate::findings::{apply, FindingBatch, IngestReport};
use delve_budget::{TimeAllocation, TimeBudgetAllocator};
use delve_checkpoint::CheckpointManager;
use delve_graph::{GraphStore, SemanticGraph};
use delve_memory::{
    EpisodicSession, EpisodicWindow, RecordProvenance, SessionSummary, SimilarSession, TemporalLog,
};
use delve_types::SessionId;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Note on temporal records written for ingested batches
pub const FINDINGS_NOTE: &str = "findings";

/// Stores shared by one research session
#[derive(Debug)]
pub struct ResearchContext {
    config: DelveConfig,
    session: SessionId,
    store: GraphStore,
    graph: Arc<SemanticGraph>,
    log: Arc<TemporalLog>,
    window: EpisodicWindow,
    checkpoints: Arc<CheckpointManager>,
    budget: TimeBudgetAllocator,
}

impl ResearchContext {
    /// Open the stores under the configured data directory and start a session
    ///
    /// # Errors
    /// Invalid configuration, an unusable data directory or a corrupt store
    pub fn open(config: DelveConfig, query: &str) -> Result<Self, CoreError> {
        let stores = Stores::open(&config)?;
        let session = stores.window.start_session(query)?;
        info!(%session, knowledge_base = %config.knowledge_base, "research context opened");
        Ok(stores.into_context(config, session))
    }

    /// Reattach to a session that was interrupted before it was closed
    ///
    /// # Errors
    /// As [`ResearchContext::open`], plus not-found or already-ended sessions
    pub fn resume(config: DelveConfig, session: SessionId) -> Result<Self, CoreError> {
        let stores = Stores::open(&config)?;
        let state = stores.window.recover_session(session)?;
        info!(
            %session,
            working_set = state.working_set.len(),
            phases = state.phases_completed.len(),
            "research context resumed"
        );
        Ok(stores.into_context(config, session))
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &DelveConfig {
        &self.config
    }

    /// Session this context belongs to
    #[inline]
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Shared semantic graph
    #[inline]
    #[must_use]
    pub fn graph(&self) -> &Arc<SemanticGraph> {
        &self.graph
    }

    /// Shared temporal log
    #[inline]
    #[must_use]
    pub fn log(&self) -> &Arc<TemporalLog> {
        &self.log
    }

    /// Episodic window
    #[inline]
    #[must_use]
    pub fn window(&self) -> &EpisodicWindow {
        &self.window
    }

    /// Checkpoint store, recording into this session's timeline
    #[inline]
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Budget allocator built from the configured policy
    #[inline]
    #[must_use]
    pub fn budget(&self) -> &TimeBudgetAllocator {
        &self.budget
    }

    /// Snapshot of the session's working set
    #[must_use]
    pub fn episode(&self) -> Option<EpisodicSession> {
        self.window.session(self.session)
    }

    /// Split a total budget across `worker_count` workers
    ///
    /// Falls back to the configured default budget when `total_secs` is
    /// `None`.
    ///
    /// # Errors
    /// Zero budget or no workers
    pub fn allocate(&self, total_secs: Option<u64>, worker_count: usize) -> Result<TimeAllocation, CoreError> {
        let allocation = match total_secs {
            Some(total) => self.budget.allocate(total, worker_count)?,
            None => self.budget.allocate_estimated(worker_count)?,
        };
        Ok(allocation)
    }

    /// Continuation controller wired to this context's checkpoints
    #[must_use]
    pub fn controller(&self) -> ContinuationController {
        ContinuationController::new(
            Arc::clone(&self.checkpoints),
            self.budget.clone(),
            self.config.continuation,
        )
    }

    /// Upsert a worker's findings and record them in memory
    ///
    /// Every touched item joins the session's working set and the whole
    /// batch becomes a single temporal record in `phase`.
    ///
    /// # Errors
    /// Unknown session or fatal log errors
    pub fn ingest(&self, phase: &str, batch: &FindingBatch) -> Result<IngestReport, CoreError> {
        let (mut report, touched) = apply(&self.graph, batch);
        for item in &touched {
            self.window.touch(self.session, item.clone())?;
        }
        let record = self.log.append(
            self.session,
            phase,
            touched,
            RecordProvenance::note(FINDINGS_NOTE).with_worker(batch.worker.clone()),
        )?;
        report.record_seq = Some(record.seq);
        info!(
            session = %self.session,
            worker = %batch.worker,
            phase,
            entities = report.entities,
            relationships = report.relationships,
            "ingested findings"
        );
        Ok(report)
    }

    /// Mark a phase complete
    ///
    /// # Errors
    /// Unknown session or fatal log errors
    pub fn complete_phase(&self, phase: &str) -> Result<(), CoreError> {
        self.window.complete_phase(self.session, phase)?;
        Ok(())
    }

    /// Past sessions whose query resembles `query`
    #[must_use]
    pub fn similar_sessions(&self, query: &str, top_k: usize) -> Vec<SimilarSession> {
        self.window.find_similar_sessions(query, top_k)
    }

    /// Persist the graph without ending the session
    ///
    /// # Errors
    /// Fatal I/O errors
    pub fn flush(&self) -> Result<PathBuf, CoreError> {
        let path = self.store.save(&self.config.knowledge_base, &self.graph)?;
        debug!(path = %path.display(), "graph flushed");
        Ok(path)
    }

    /// Flush the graph and end the session
    ///
    /// # Errors
    /// Fatal I/O errors; the session stays recoverable from the log
    pub fn close(self) -> Result<SessionSummary, CoreError> {
        self.flush()?;
        let summary = self.window.end_session(self.session)?;
        info!(session = %self.session, "research context closed");
        Ok(summary)
    }
}

/// Opened stores before a session is attached
struct Stores {
    store: GraphStore,
    graph: Arc<SemanticGraph>,
    log: Arc<TemporalLog>,
    window: EpisodicWindow,
    budget: TimeBudgetAllocator,
}

impl Stores {
    fn open(config: &DelveConfig) -> Result<Self, CoreError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|source| CoreError::DataDir {
            path: config.data_dir.clone(),
            source,
        })?;

        let store = GraphStore::new(&config.data_dir);
        let graph = Arc::new(store.load_or_new(&config.knowledge_base)?);
        let log = Arc::new(TemporalLog::open(&config.data_dir)?);
        let window = EpisodicWindow::new(&config.data_dir, Arc::clone(&graph), Arc::clone(&log), config.window);
        let budget = TimeBudgetAllocator::new(config.budget)?;
        debug!(
            data_dir = %config.data_dir.display(),
            entities = graph.entity_count(),
            "stores opened"
        );
        Ok(Self {
            store,
            graph,
            log,
            window,
            budget,
        })
    }

    fn into_context(self, config: DelveConfig, session: SessionId) -> ResearchContext {
        let checkpoints = Arc::new(
            CheckpointManager::new(&config.data_dir, config.requirements)
                .with_temporal_log(Arc::clone(&self.log), session),
        );
        ResearchContext {
            config,
            session,
            store: self.store,
            graph: self.graph,
            log: self.log,
            window: self.window,
            checkpoints,
            budget: self.budget,
        }
    }
}
