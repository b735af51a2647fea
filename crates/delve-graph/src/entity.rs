//! Entities, relationships and their keys
//!
//! Identity rules:
//! - an entity is identified by `(kind, id)`, written `kind:id`
//! - a relationship is identified by `(source, target, kind)`

use chrono::{DateTime, Utc};
use delve_types::WorkerKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;

/// Free-form attribute bag (title, summary, url, ...)
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Academic paper
    Paper,
    /// Software project
    Project,
    /// Community discussion thread
    Discussion,
    /// Concept or technique
    Concept,
}

impl EntityKind {
    /// All kinds in canonical order
    pub const ALL: [EntityKind; 4] = [Self::Paper, Self::Project, Self::Discussion, Self::Concept];

    /// Stable textual name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Project => "project",
            Self::Discussion => "discussion",
            Self::Concept => "concept",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| GraphError::InvalidKey(s.to_string()))
    }
}

/// Relationship kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Paper cites paper
    Cites,
    /// Project implements paper
    Implements,
    /// Discussion discusses paper or project
    Discusses,
    /// General relatedness (concept links)
    RelatesTo,
}

impl RelationKind {
    /// All kinds in canonical order
    pub const ALL: [RelationKind; 4] = [
        Self::Cites,
        Self::Implements,
        Self::Discusses,
        Self::RelatesTo,
    ];

    /// Stable textual name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cites => "cites",
            Self::Implements => "implements",
            Self::Discusses => "discusses",
            Self::RelatesTo => "relates_to",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity identity: `(kind, id)`
///
/// Serialized as `kind:id` so it can be used as a map key and in edge lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey {
    /// Entity kind
    pub kind: EntityKind,
    /// Domain-specific identifier (arXiv id, `org/repo`, url, ...)
    pub id: String,
}

impl EntityKey {
    /// Create key
    #[inline]
    #[must_use]
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Paper key shorthand
    #[inline]
    #[must_use]
    pub fn paper(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Paper, id)
    }

    /// Project key shorthand
    #[inline]
    #[must_use]
    pub fn project(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Project, id)
    }

    /// Discussion key shorthand
    #[inline]
    #[must_use]
    pub fn discussion(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Discussion, id)
    }

    /// Concept key shorthand
    #[inline]
    #[must_use]
    pub fn concept(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Concept, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| GraphError::InvalidKey(s.to_string()))?;
        if id.is_empty() {
            return Err(GraphError::InvalidKey(s.to_string()));
        }
        Ok(Self::new(kind.parse()?, id))
    }
}

impl TryFrom<String> for EntityKey {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityKey> for String {
    fn from(value: EntityKey) -> Self {
        value.to_string()
    }
}

/// Typed node of the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity kind
    pub kind: EntityKind,
    /// Domain-specific identifier
    pub id: String,
    /// Worker kind that produced this entity
    pub domain: WorkerKind,
    /// Created as an edge endpoint and not yet upserted by its producer
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
    /// Attribute bag
    #[serde(default)]
    pub attributes: Attributes,
    /// First time the entity was seen
    pub discovered_at: DateTime<Utc>,
    /// Last merge time
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create a fresh entity
    #[must_use]
    pub fn new(key: EntityKey, domain: WorkerKind, attributes: Attributes, now: DateTime<Utc>) -> Self {
        Self {
            kind: key.kind,
            id: key.id,
            domain,
            placeholder: false,
            attributes,
            discovered_at: now,
            updated_at: now,
        }
    }

    /// Identity key
    #[inline]
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id.clone())
    }

    /// Merge attributes: key union, incoming value wins on conflict
    pub fn merge(&mut self, incoming: Attributes, now: DateTime<Utc>) {
        self.attributes.extend(incoming);
        self.updated_at = now;
    }

    /// Human-readable label (title, then name, then id)
    #[must_use]
    pub fn label(&self) -> &str {
        ["title", "name"]
            .iter()
            .find_map(|k| self.attributes.get(*k).and_then(serde_json::Value::as_str))
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.id)
    }
}

/// Who observed a relationship first, and when
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Worker kind that observed the relationship
    pub worker: WorkerKind,
    /// Time of first observation
    pub observed_at: DateTime<Utc>,
}

impl Provenance {
    /// Provenance stamped now
    #[inline]
    #[must_use]
    pub fn now(worker: WorkerKind) -> Self {
        Self {
            worker,
            observed_at: Utc::now(),
        }
    }
}

/// Relationship identity: `(source, target, kind)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipKey {
    /// Source entity
    pub source: EntityKey,
    /// Target entity
    pub target: EntityKey,
    /// Relationship kind
    pub kind: RelationKind,
}

impl RelationshipKey {
    /// Create key
    #[inline]
    #[must_use]
    pub fn new(source: EntityKey, target: EntityKey, kind: RelationKind) -> Self {
        Self {
            source,
            target,
            kind,
        }
    }
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source, self.kind, self.target)
    }
}

/// Directed, weighted, typed edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Source entity
    pub source: EntityKey,
    /// Target entity
    pub target: EntityKey,
    /// Relationship kind
    pub kind: RelationKind,
    /// Observation weight (1.0 per observation)
    pub weight: f64,
    /// First observation
    pub provenance: Provenance,
}

impl Relationship {
    /// Weight of a freshly observed relationship
    pub const INITIAL_WEIGHT: f64 = 1.0;

    /// Identity key
    #[inline]
    #[must_use]
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey::new(self.source.clone(), self.target.clone(), self.kind)
    }
}

/// Reference to anything stored in the graph
///
/// This is what temporal records and episodic sessions track as "touched".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "ref", rename_all = "snake_case")]
pub enum GraphRef {
    /// An entity
    Entity {
        /// Entity key
        key: EntityKey,
    },
    /// A relationship
    Relationship {
        /// Relationship key
        key: RelationshipKey,
    },
}

impl From<EntityKey> for GraphRef {
    fn from(key: EntityKey) -> Self {
        Self::Entity { key }
    }
}

impl From<RelationshipKey> for GraphRef {
    fn from(key: RelationshipKey) -> Self {
        Self::Relationship { key }
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity { key } => write!(f, "{key}"),
            Self::Relationship { key } => write!(f, "{key}"),
        }
    }
}
