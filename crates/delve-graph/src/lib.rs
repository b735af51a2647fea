//! Delve semantic graph
//!
//! Typed knowledge graph accumulated from worker findings:
//! - [`SemanticGraph`]: deduplicated entities and weighted relationships
//! - Weighted PageRank ([`RankConfig`]) and neighbourhood retrieval
//! - [`GraphStore`]: durable `graph/<knowledge-base>.json` documents
//! - [`export()`]: Mermaid, DOT, GraphML and JSON renderings
//! - Citation-network and cross-domain analysis ([`analysis`])

#![warn(unreachable_pub)]

pub mod analysis;
pub mod entity;
pub mod error;
pub mod export;
pub mod graph;
pub mod rank;
pub mod store;

pub use analysis::{BridgingEntity, CitationSummary, CrossDomainGraph};
pub use entity::{
    Attributes, Entity, EntityKey, EntityKind, GraphRef, Provenance, RelationKind, Relationship,
    RelationshipKey,
};
pub use error::GraphError;
pub use export::{export, ExportFormat};
pub use graph::{GraphStats, RelatedEntity, SemanticGraph};
pub use rank::RankConfig;
pub use store::{GraphDocument, GraphStore};
