//! Delve shared types
//!
//! Identifiers and worker classifications used by every layer of the
//! memory subsystem:
//! - [`WorkerKind`]: which research domain a worker covers
//! - [`WorkerId`]: stable, path-safe identifier of one worker stream
//! - [`SessionId`]: sortable identifier of one research session
//! - [`TimeAssessment`]: elapsed/remaining time with a [`TimeStatus`] label
//!
//! The [`durable`] module holds the crash-safe file write used by every
//! on-disk store.

#![warn(unreachable_pub)]

pub mod durable;
pub mod time;

pub use time::{TimeAssessment, TimeStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Errors raised while parsing identifiers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Identifier was empty
    #[error("identifier is empty")]
    Empty,

    /// Identifier contains characters that are not path-safe
    #[error("identifier contains invalid character {ch:?}: {value}")]
    InvalidChar {
        /// Rejected value
        value: String,
        /// First offending character
        ch: char,
    },

    /// Unknown worker kind
    #[error("unknown worker kind: {0}")]
    UnknownKind(String),

    /// Malformed session id
    #[error("invalid session id: {0}")]
    InvalidSession(String),
}

/// Check that `value` can be used as a single file or directory name
///
/// Only ASCII alphanumerics, `-`, `_` and `.` are accepted, and `.`/`..`
/// are rejected.
///
/// # Errors
/// Returns [`IdError`] for empty or non path-safe values
pub fn validate_path_segment(value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IdError::InvalidChar {
            value: value.to_string(),
            ch,
        });
    }
    if value == "." || value == ".." {
        return Err(IdError::InvalidChar {
            value: value.to_string(),
            ch: '.',
        });
    }
    Ok(())
}

/// Research domain covered by a worker
///
/// Also used as the originating-domain tag on graph entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Academic literature (papers, citations)
    Academic,
    /// Open-source projects
    Github,
    /// Community discussions
    Community,
}

impl WorkerKind {
    /// All known kinds, in canonical order
    pub const ALL: [WorkerKind; 3] = [Self::Academic, Self::Github, Self::Community];

    /// Short, stable name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Academic => "academic",
            Self::Github => "github",
            Self::Community => "community",
        }
    }

    /// Conventional worker role name for this kind
    #[inline]
    #[must_use]
    pub fn role(self) -> &'static str {
        match self {
            Self::Academic => "academic-researcher",
            Self::Github => "github-watcher",
            Self::Community => "community-listener",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == lowered || k.role() == lowered)
            .ok_or(IdError::UnknownKind(lowered))
    }
}

/// Identifier of one worker's checkpoint stream
///
/// Used as a directory name on disk, so only ASCII alphanumerics,
/// `-`, `_` and `.` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a validated worker id
    ///
    /// # Errors
    /// Returns [`IdError`] for empty or non path-safe values
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_path_segment(&value)?;
        Ok(Self(value))
    }

    /// Default worker id for a kind (its role name)
    #[inline]
    #[must_use]
    pub fn for_kind(kind: WorkerKind) -> Self {
        Self(kind.role().to_string())
    }

    /// Borrow as string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WorkerId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkerId> for String {
    fn from(value: WorkerId) -> Self {
        value.0
    }
}

impl FromStr for WorkerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Research session identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Generate new session ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|_| IdError::InvalidSession(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_kind_parses_short_and_role_names() {
        assert_eq!("academic".parse::<WorkerKind>().unwrap(), WorkerKind::Academic);
        assert_eq!("github-watcher".parse::<WorkerKind>().unwrap(), WorkerKind::Github);
        assert_eq!(" Community ".parse::<WorkerKind>().unwrap(), WorkerKind::Community);
        assert!("astrology".parse::<WorkerKind>().is_err());
    }

    #[test]
    fn worker_id_rejects_path_escapes() {
        assert!(WorkerId::new("academic-1").is_ok());
        assert_eq!(WorkerId::new(""), Err(IdError::Empty));
        assert!(WorkerId::new("../etc").is_err());
        assert!(WorkerId::new("a/b").is_err());
        assert!(WorkerId::new("..").is_err());
    }

    #[test]
    fn worker_id_serde_validates() {
        let ok: WorkerId = serde_json::from_str("\"github-watcher\"").unwrap();
        assert_eq!(ok, WorkerId::for_kind(WorkerKind::Github));
        assert!(serde_json::from_str::<WorkerId>("\"bad id\"").is_err());
    }

    #[test]
    fn session_id_roundtrips_through_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<SessionId>().is_err());
    }
}
