//! Error types for checkpoints and the worker lifecycle

use crate::lifecycle::WorkerState;
use delve_memory::MemoryError;
use std::path::PathBuf;

/// Checkpoint errors
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Durable write or read failed
    #[error("checkpoint I/O failed at {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint file could not be decoded
    #[error("corrupt checkpoint {}: {source}", path.display())]
    Corrupt {
        /// File
        path: PathBuf,
        /// Decode error
        #[source]
        source: serde_json::Error,
    },

    /// Recording the checkpoint in the temporal log failed
    #[error("temporal log: {0}")]
    Memory(#[from] MemoryError),

    /// Worker state machine violation
    #[error("illegal worker transition: {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: WorkerState,
        /// Requested state
        to: WorkerState,
    },
}

impl CheckpointError {
    /// Wrap an I/O error with its path
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure must abort the affected worker
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Corrupt { .. } => true,
            Self::Memory(e) => e.is_fatal(),
            Self::IllegalTransition { .. } => false,
        }
    }
}
