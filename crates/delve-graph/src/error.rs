//! Error types for the knowledge graph

use crate::entity::EntityKey;
use std::path::PathBuf;

/// Knowledge graph errors
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Entity key is unknown to the graph
    #[error("entity not found: {0}")]
    EntityNotFound(EntityKey),

    /// Malformed entity key or kind
    #[error("invalid entity key: {0}")]
    InvalidKey(String),

    /// Graph file missing
    #[error("graph store not found: {}", .0.display())]
    StoreNotFound(PathBuf),

    /// Unsupported export format
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    /// Storage I/O failure
    #[error("graph I/O failed at {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Document (de)serialization failure
    #[error("graph document invalid: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GraphError {
    /// Wrap an I/O error with its path
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a "not found" condition (recoverable)
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound(_) | Self::StoreNotFound(_))
    }

    /// Whether the error is a durable-storage failure
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(GraphError::EntityNotFound(EntityKey::paper("x")).is_not_found());
        assert!(!GraphError::InvalidKey("x".into()).is_not_found());
        let io = GraphError::io("/tmp/g.json", std::io::Error::other("disk full"));
        assert!(io.is_fatal());
        assert!(io.to_string().contains("/tmp/g.json"));
    }
}
