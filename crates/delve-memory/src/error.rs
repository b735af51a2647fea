//! Error types for the temporal and episodic layers

use delve_types::SessionId;
use std::path::PathBuf;

/// Memory layer errors
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Durable storage failure
    #[error("memory I/O failed at {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A stored record or summary could not be decoded
    #[error("corrupt record at {}:{line}: {source}", path.display())]
    Corrupt {
        /// File
        path: PathBuf,
        /// 1-based line number (0 for whole-file documents)
        line: usize,
        /// Decode error
        #[source]
        source: serde_json::Error,
    },

    /// Replay was asked to start at a phase the session never recorded
    #[error("phase {phase:?} not found in session {session}")]
    PhaseNotFound {
        /// Session
        session: SessionId,
        /// Requested phase
        phase: String,
    },

    /// Session is not active (or never existed)
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session already ended and cannot be recovered
    #[error("session already ended: {0}")]
    SessionEnded(SessionId),

    /// Too many concurrently active sessions
    #[error("episodic window full ({limit} active sessions)")]
    WindowFull {
        /// Configured limit
        limit: usize,
    },

    /// Phase names become file names
    #[error("invalid phase name: {0:?}")]
    InvalidPhase(String),

    /// Hash chain verification failed
    #[error("hash chain broken in session {session} at record {seq}")]
    ChainBroken {
        /// Session
        session: SessionId,
        /// First offending record
        seq: u64,
    },
}

impl MemoryError {
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
        matches!(self, Self::Io { .. } | Self::Corrupt { .. } | Self::ChainBroken { .. })
    }

    /// Whether the failure is a recoverable "not found"
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PhaseNotFound { .. } | Self::SessionNotFound(_))
    }
}
