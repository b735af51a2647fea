//! On-disk persistence: `graph/<knowledge-base>.json`

use delve_types::durable::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::entity::{Entity, Relationship};
use crate::error::GraphError;
use crate::graph::SemanticGraph;

/// Current document version
pub const DOCUMENT_VERSION: u32 = 1;

/// Serialized form of a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    /// Format version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Entities in key order
    pub nodes: Vec<Entity>,
    /// Relationships in key order
    pub edges: Vec<Relationship>,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

impl GraphDocument {
    /// Snapshot a graph
    #[must_use]
    pub fn from_graph(graph: &SemanticGraph) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            nodes: graph.entities(),
            edges: graph.relationships(),
        }
    }

    /// Rebuild the graph
    ///
    /// # Errors
    /// Fails if an edge refers to a node missing from the document
    pub fn into_graph(self) -> Result<SemanticGraph, GraphError> {
        SemanticGraph::from_parts(self.nodes, self.edges)
    }
}

/// Directory of named knowledge bases
#[derive(Debug, Clone)]
pub struct GraphStore {
    dir: PathBuf,
}

impl GraphStore {
    /// Store rooted at `<data_dir>/graph`
    #[must_use]
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("graph"),
        }
    }

    /// File backing a knowledge base
    #[must_use]
    pub fn path(&self, knowledge_base: &str) -> PathBuf {
        self.dir.join(format!("{knowledge_base}.json"))
    }

    /// Load a knowledge base
    ///
    /// # Errors
    /// [`GraphError::StoreNotFound`] if it was never saved, otherwise I/O or
    /// document errors
    pub fn load(&self, knowledge_base: &str) -> Result<SemanticGraph, GraphError> {
        let path = self.path(knowledge_base);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GraphError::StoreNotFound(path))
            }
            Err(e) => return Err(GraphError::io(path, e)),
        };
        let document: GraphDocument = serde_json::from_slice(&bytes)?;
        debug!(
            path = %path.display(),
            nodes = document.nodes.len(),
            edges = document.edges.len(),
            "loaded graph document"
        );
        document.into_graph()
    }

    /// Load a knowledge base, starting empty if it does not exist yet
    ///
    /// # Errors
    /// I/O or document errors
    pub fn load_or_new(&self, knowledge_base: &str) -> Result<SemanticGraph, GraphError> {
        match self.load(knowledge_base) {
            Err(GraphError::StoreNotFound(_)) => Ok(SemanticGraph::new()),
            other => other,
        }
    }

    /// Durably persist a knowledge base
    ///
    /// # Errors
    /// I/O or serialization errors
    pub fn save(&self, knowledge_base: &str, graph: &SemanticGraph) -> Result<PathBuf, GraphError> {
        let path = self.path(knowledge_base);
        let document = GraphDocument::from_graph(graph);
        let bytes = serde_json::to_vec_pretty(&document)?;
        write_atomic(&path, &bytes).map_err(|e| GraphError::io(&path, e))?;
        info!(
            path = %path.display(),
            nodes = document.nodes.len(),
            edges = document.edges.len(),
            "saved knowledge graph"
        );
        Ok(path)
    }
}
