//! Error types for the orchestration layer
//!
//! Wraps every store error with `#[from]` so callers can use `?` across
//! crate boundaries, and classifies failures for the controller:
//! - fatal: durable I/O broke, the affected worker is aborted
//! - not found: unknown ids, missing stores or sessions
//! - everything else: local and recoverable

use delve_budget::BudgetError;
use delve_checkpoint::CheckpointError;
use delve_graph::GraphError;
use delve_memory::MemoryError;
use delve_types::{IdError, WorkerId};
use std::path::PathBuf;

/// Main orchestration error type
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Semantic graph failure
    #[error("graph: {0}")]
    Graph(#[from] GraphError),

    /// Temporal log or episodic window failure
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    /// Checkpoint store or lifecycle failure
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Budget policy or allocation failure
    #[error("budget: {0}")]
    Budget(#[from] BudgetError),

    /// Malformed identifier
    #[error("invalid id: {0}")]
    Id(#[from] IdError),

    /// Configuration file could not be read
    #[error("cannot read config {}: {source}", path.display())]
    ConfigIo {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`crate::DelveConfig`]
    #[error("invalid config {}: {source}", path.display())]
    ConfigParse {
        /// Config path
        path: PathBuf,
        /// Decode error
        #[source]
        source: toml::de::Error,
    },

    /// Configuration values out of range
    #[error("configuration error: {0}")]
    Config(String),

    /// Finding batch could not be read or decoded
    #[error("invalid finding batch {}: {reason}", path.display())]
    InvalidBatch {
        /// Batch file
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Data directory could not be prepared
    #[error("data directory {}: {source}", path.display())]
    DataDir {
        /// Directory
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Worker was never registered with the controller
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// Worker reported a failure of its own
    #[error("worker {worker} failed: {message}")]
    WorkerFailed {
        /// Worker
        worker: WorkerId,
        /// Reported message
        message: String,
    },
}

impl CoreError {
    /// Whether the failure must abort the affected worker
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Graph(e) => e.is_fatal(),
            Self::Memory(e) => e.is_fatal(),
            Self::Checkpoint(e) => e.is_fatal(),
            Self::DataDir { .. } => true,
            Self::Budget(_)
            | Self::Id(_)
            | Self::ConfigIo { .. }
            | Self::ConfigParse { .. }
            | Self::Config(_)
            | Self::InvalidBatch { .. }
            | Self::UnknownWorker(_)
            | Self::WorkerFailed { .. } => false,
        }
    }

    /// Whether the failure means "no such thing"
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Graph(e) => e.is_not_found(),
            Self::Memory(e) => e.is_not_found(),
            Self::UnknownWorker(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_graph::EntityKey;

    #[test]
    fn classification_follows_wrapped_errors() {
        let missing = CoreError::from(GraphError::EntityNotFound(EntityKey::paper("x")));
        assert!(missing.is_not_found());
        assert!(!missing.is_fatal());

        let io = CoreError::from(CheckpointError::io(
            "/nowhere",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        ));
        assert!(io.is_fatal());
        assert!(!io.is_not_found());

        assert!(CoreError::Config("bad".into()).to_string().contains("bad"));
    }
}
