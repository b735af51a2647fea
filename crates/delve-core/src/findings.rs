//! Structured findings reported by workers
//!
//! A [`FindingBatch`] is what a worker hands back after a pass over its
//! domain. Applying a batch upserts every finding and its links into the
//! semantic graph and returns the touched items so the caller can record
//! them in episodic and temporal memory.

use crate::error::CoreError;
use delve_graph::{
    Attributes, EntityKey, GraphRef, Provenance, RelationKind, SemanticGraph,
};
use delve_types::{WorkerId, WorkerKind};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One finding, tagged by entity kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Finding {
    /// Academic paper
    Paper {
        /// arXiv or DOI identifier
        id: String,
        /// Title, authors, year, venue, ...
        #[serde(default)]
        attributes: Attributes,
        /// Ids of cited papers
        #[serde(default)]
        cites: Vec<String>,
        /// Concepts introduced or used
        #[serde(default)]
        concepts: Vec<String>,
        /// Counts towards the key-finding threshold
        #[serde(default)]
        key: bool,
    },
    /// Source repository
    Project {
        /// `org/repo`
        id: String,
        /// Stars, language, license, ...
        #[serde(default)]
        attributes: Attributes,
        /// Ids of implemented papers
        #[serde(default)]
        implements: Vec<String>,
        /// Concepts the project relates to
        #[serde(default)]
        concepts: Vec<String>,
        /// Counts towards the key-finding threshold
        #[serde(default)]
        key: bool,
    },
    /// Community thread
    Discussion {
        /// Thread URL
        id: String,
        /// Platform, title, upvotes, ...
        #[serde(default)]
        attributes: Attributes,
        /// Entities the thread discusses
        #[serde(default)]
        discusses: Vec<EntityKey>,
        /// Concepts raised in the thread
        #[serde(default)]
        concepts: Vec<String>,
        /// Counts towards the key-finding threshold
        #[serde(default)]
        key: bool,
    },
    /// Free-standing concept
    Concept {
        /// Concept name
        id: String,
        /// Definition and other attributes
        #[serde(default)]
        attributes: Attributes,
        /// Related concept names
        #[serde(default)]
        related: Vec<String>,
    },
}

/// Normalize a concept name into a stable id
#[must_use]
pub fn concept_id(name: &str) -> String {
    name
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

impl Finding {
    /// Key of the entity this finding describes
    #[must_use]
    pub fn entity_key(&self) -> EntityKey {
        match self {
            Self::Paper { id, .. } => EntityKey::paper(id.as_str()),
            Self::Project { id, .. } => EntityKey::project(id.as_str()),
            Self::Discussion { id, .. } => EntityKey::discussion(id.as_str()),
            Self::Concept { id, .. } => EntityKey::concept(concept_id(id)),
        }
    }

    /// Whether the finding counts as a primary item
    #[inline]
    #[must_use]
    pub fn is_primary(&self) -> bool {
        !matches!(self, Self::Concept { .. })
    }

    /// Whether the finding is flagged as a key finding
    #[inline]
    #[must_use]
    pub fn is_key(&self) -> bool {
        match self {
            Self::Paper { key, .. } | Self::Project { key, .. } | Self::Discussion { key, .. } => *key,
            Self::Concept { .. } => false,
        }
    }

    fn attributes(&self) -> Attributes {
        match self {
            Self::Paper { attributes, .. }
            | Self::Project { attributes, .. }
            | Self::Discussion { attributes, .. } => attributes.clone(),
            Self::Concept { id, attributes, .. } => {
                let mut attributes = attributes.clone();
                attributes
                    .entry("name".to_string())
                    .or_insert_with(|| serde_json::Value::String(id.trim().to_string()));
                attributes
            }
        }
    }

    fn links(&self) -> Vec<Link> {
        let concepts = |names: &[String]| {
            names
                .iter()
                .map(|c| Link {
                    target: EntityKey::concept(concept_id(c)),
                    kind: RelationKind::RelatesTo,
                    name: Some(c.trim().to_string()),
                })
                .collect::<Vec<_>>()
        };
        let plain = |target: EntityKey, kind: RelationKind| Link {
            target,
            kind,
            name: None,
        };
        match self {
            Self::Paper { cites, concepts: c, .. } => cites
                .iter()
                .map(|p| plain(EntityKey::paper(p.as_str()), RelationKind::Cites))
                .chain(concepts(c.as_slice()))
                .collect(),
            Self::Project { implements, concepts: c, .. } => implements
                .iter()
                .map(|p| plain(EntityKey::paper(p.as_str()), RelationKind::Implements))
                .chain(concepts(c.as_slice()))
                .collect(),
            Self::Discussion { discusses, concepts: c, .. } => discusses
                .iter()
                .map(|k| plain(k.clone(), RelationKind::Discusses))
                .chain(concepts(c.as_slice()))
                .collect(),
            Self::Concept { related, .. } => concepts(related.as_slice()),
        }
    }
}

struct Link {
    target: EntityKey,
    kind: RelationKind,
    /// Display name for concept targets
    name: Option<String>,
}

/// Findings reported by one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingBatch {
    /// Reporting worker
    pub worker: WorkerId,
    /// Domain of the worker
    pub kind: WorkerKind,
    /// Findings in report order
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl FindingBatch {
    /// Create empty batch
    #[inline]
    #[must_use]
    pub fn new(worker: WorkerId, kind: WorkerKind) -> Self {
        Self {
            worker,
            kind,
            findings: Vec::new(),
        }
    }

    /// With an additional finding
    #[inline]
    #[must_use]
    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }

    /// Read a batch from a JSON file
    ///
    /// # Errors
    /// [`CoreError::InvalidBatch`] if the file is unreadable or malformed
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let invalid = |reason: String| CoreError::InvalidBatch {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))
    }
}

/// Outcome of applying one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Entities upserted, links excluded
    pub entities: usize,
    /// Relationships upserted
    pub relationships: usize,
    /// Primary findings in the batch
    pub primary: u32,
    /// Key findings in the batch
    pub key: u32,
    /// Sequence number of the temporal record, once written
    pub record_seq: Option<u64>,
}

/// Upsert a batch into the graph
///
/// Returns the report and every touched item, entities before the
/// relationships that reference them.
pub(crate) fn apply(graph: &SemanticGraph, batch: &FindingBatch) -> (IngestReport, Vec<GraphRef>) {
    let mut report = IngestReport::default();
    let mut touched = Vec::new();

    for finding in &batch.findings {
        let key = graph.upsert_entity(finding.entity_key(), finding.attributes(), batch.kind).key();
        report.entities += 1;
        report.primary += u32::from(finding.is_primary());
        report.key += u32::from(finding.is_key());
        touched.push(GraphRef::from(key.clone()));

        for Link { target, kind, name } in finding.links() {
            if target == key {
                continue;
            }
            if let Some(name) = name {
                let attributes = Attributes::from([("name".to_string(), serde_json::Value::String(name))]);
                graph.upsert_entity(target.clone(), attributes, batch.kind);
            }
            let rel = graph.upsert_relationship(key.clone(), target.clone(), kind, Provenance::now(batch.kind));
            report.relationships += 1;
            touched.push(GraphRef::from(target));
            touched.push(GraphRef::from(rel.key()));
        }
    }
    (report, touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paper(id: &str, cites: &[&str]) -> Finding {
        Finding::Paper {
            id: id.to_string(),
            attributes: Attributes::from([("title".to_string(), json!(format!("Paper {id}")))]),
            cites: cites.iter().map(ToString::to_string).collect(),
            concepts: vec!["Tool Use".to_string()],
            key: true,
        }
    }

    #[test]
    fn batch_decodes_from_tagged_json() {
        let batch: FindingBatch = serde_json::from_value(json!({
            "worker": "github-watcher",
            "kind": "github",
            "findings": [
                {"type": "project", "id": "org/agent", "implements": ["2301.00001"], "key": true},
                {"type": "discussion", "id": "https://forum/t/1", "discusses": ["project:org/agent"]},
                {"type": "concept", "id": "Reflection"}
            ]
        }))
        .unwrap();

        assert_eq!(batch.findings.len(), 3);
        assert_eq!(batch.findings[0].entity_key(), EntityKey::project("org/agent"));
        assert!(batch.findings[0].is_key());
        assert!(batch.findings[1].is_primary());
        assert!(!batch.findings[2].is_primary());
        assert_eq!(batch.findings[2].entity_key(), EntityKey::concept("reflection"));
    }

    #[test]
    fn apply_links_citations_and_concepts() {
        let graph = SemanticGraph::new();
        let batch = FindingBatch::new(WorkerId::for_kind(WorkerKind::Academic), WorkerKind::Academic)
            .with_finding(paper("a", &["b"]))
            .with_finding(paper("b", &[]));

        let (report, touched) = apply(&graph, &batch);

        assert_eq!(report.entities, 2);
        assert_eq!(report.relationships, 3);
        assert_eq!((report.primary, report.key), (2, 2));
        assert_eq!(graph.entity_count(), 3);
        assert!(graph.contains(&EntityKey::concept("tool_use")));
        assert!(touched.contains(&GraphRef::from(EntityKey::paper("b"))));

        let concept = graph.entity(&EntityKey::concept("tool_use")).unwrap();
        assert_eq!(concept.label(), "Tool Use");
    }

    #[test]
    fn self_links_are_ignored() {
        let graph = SemanticGraph::new();
        let batch = FindingBatch::new(WorkerId::for_kind(WorkerKind::Academic), WorkerKind::Academic)
            .with_finding(paper("a", &["a"]));
        let (report, _) = apply(&graph, &batch);
        assert_eq!(report.relationships, 1);
    }

    #[test]
    fn concept_ids_are_normalized() {
        assert_eq!(concept_id("  Chain of   Thought "), "chain_of_thought");
    }
}
