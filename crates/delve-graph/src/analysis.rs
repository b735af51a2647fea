//! Citation-network and cross-domain analysis
//!
//! Read-only views computed from a snapshot of the graph:
//! - citation chains, root papers and survey papers
//! - entities linking several domains, and the subgraph of edges that cross
//!   a domain boundary
//!
//! Papers may be tagged explicitly through the [`PAPER_TYPE`] attribute
//! (`"root"` or `"survey"`); untagged papers are classified from the shape
//! of the citation network.

use delve_types::WorkerKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::entity::{Entity, EntityKey, EntityKind, RelationKind, Relationship};
use crate::error::GraphError;
use crate::graph::SemanticGraph;
use crate::rank::RankConfig;

/// Attribute tagging a paper as `"root"` or `"survey"`
pub const PAPER_TYPE: &str = "paper_type";

/// Outgoing citations from which an untagged paper counts as a survey
pub const SURVEY_MIN_CITES: usize = 10;

/// Papers listed in [`CitationSummary::top_papers`]
pub const TOP_PAPERS: usize = 10;

/// Shape of the citation network
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationSummary {
    /// Papers in the graph
    pub papers: usize,
    /// `cites` relationships
    pub citations: usize,
    /// Foundational papers
    pub root_papers: Vec<EntityKey>,
    /// Survey and review papers
    pub survey_papers: Vec<EntityKey>,
    /// Best-ranked papers
    pub top_papers: Vec<(EntityKey, f64)>,
}

/// Entity connected to more than one other domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgingEntity {
    /// Entity
    pub key: EntityKey,
    /// Its own domain
    pub domain: WorkerKind,
    /// Other domains it is linked to
    pub domains: BTreeSet<WorkerKind>,
    /// Cross-domain relationships it takes part in
    pub connections: usize,
    /// `connections + 2 * domains`
    pub importance: f64,
}

/// Relationships whose endpoints belong to different domains
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossDomainGraph {
    /// Endpoints of the cross-domain relationships, in key order
    pub nodes: Vec<Entity>,
    /// Cross-domain relationships, in key order
    pub edges: Vec<Relationship>,
    /// Nodes per domain
    pub by_domain: BTreeMap<WorkerKind, usize>,
}

fn tagged(entity: &Entity, tag: &str) -> bool {
    entity.attributes.get(PAPER_TYPE).and_then(|v| v.as_str()) == Some(tag)
}

/// Concept links say nothing about which domain reached which
fn crosses_domains(rel: &Relationship, domains: &HashMap<EntityKey, WorkerKind>) -> bool {
    rel.kind != RelationKind::RelatesTo
        && matches!(
            (domains.get(&rel.source), domains.get(&rel.target)),
            (Some(a), Some(b)) if a != b
        )
}

impl SemanticGraph {
    /// Papers reachable from `paper` along `cites`, depth first
    ///
    /// The chain starts with `paper` itself; cited papers are visited in key
    /// order and each paper appears once. `max_depth` counts citation hops.
    ///
    /// # Errors
    /// [`GraphError::EntityNotFound`] if `paper` is not in the graph
    pub fn citation_chain(&self, paper: &EntityKey, max_depth: usize) -> Result<Vec<EntityKey>, GraphError> {
        if !self.contains(paper) {
            return Err(GraphError::EntityNotFound(paper.clone()));
        }
        let mut cites: HashMap<EntityKey, Vec<EntityKey>> = HashMap::new();
        for rel in self.relationships() {
            if rel.kind == RelationKind::Cites {
                cites.entry(rel.source).or_default().push(rel.target);
            }
        }

        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(paper.clone(), 0usize)];
        while let Some((key, depth)) = stack.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            chain.push(key.clone());
            if depth == max_depth {
                continue;
            }
            if let Some(cited) = cites.get(&key) {
                // reversed so the smallest key is visited first
                stack.extend(cited.iter().rev().filter(|k| !visited.contains(*k)).map(|k| (k.clone(), depth + 1)));
            }
        }
        Ok(chain)
    }

    /// Papers tagged `root`, or cited within the graph while citing nothing
    #[must_use]
    pub fn root_papers(&self) -> Vec<EntityKey> {
        let (cited, citing) = self.citation_degrees();
        self.entities()
            .into_iter()
            .filter(|e| e.kind == EntityKind::Paper)
            .filter(|e| {
                let key = e.key();
                tagged(e, "root")
                    || (cited.get(&key).is_some_and(|n| *n > 0) && citing.get(&key).copied().unwrap_or(0) == 0)
            })
            .map(|e| e.key())
            .collect()
    }

    /// Papers tagged `survey`, or citing at least [`SURVEY_MIN_CITES`] papers
    #[must_use]
    pub fn survey_papers(&self) -> Vec<EntityKey> {
        let (_, citing) = self.citation_degrees();
        self.entities()
            .into_iter()
            .filter(|e| e.kind == EntityKind::Paper)
            .filter(|e| tagged(e, "survey") || citing.get(&e.key()).copied().unwrap_or(0) >= SURVEY_MIN_CITES)
            .map(|e| e.key())
            .collect()
    }

    /// In- and out-degree of every paper over `cites`
    fn citation_degrees(&self) -> (HashMap<EntityKey, usize>, HashMap<EntityKey, usize>) {
        let mut cited = HashMap::new();
        let mut citing = HashMap::new();
        for rel in self.relationships() {
            if rel.kind == RelationKind::Cites && rel.source != rel.target {
                *cited.entry(rel.target).or_default() += 1;
                *citing.entry(rel.source).or_default() += 1;
            }
        }
        (cited, citing)
    }

    /// Counts, root and survey papers and the best-ranked papers
    #[must_use]
    pub fn citation_summary(&self) -> CitationSummary {
        let papers = self
            .entities()
            .iter()
            .filter(|e| e.kind == EntityKind::Paper)
            .count();
        let citations = self
            .relationships()
            .iter()
            .filter(|r| r.kind == RelationKind::Cites)
            .count();
        let top_papers = self
            .rank(&RankConfig::default())
            .into_iter()
            .filter(|(e, _)| e.kind == EntityKind::Paper)
            .take(TOP_PAPERS)
            .map(|(e, score)| (e.key(), score))
            .collect();
        CitationSummary {
            papers,
            citations,
            root_papers: self.root_papers(),
            survey_papers: self.survey_papers(),
            top_papers,
        }
    }

    /// Entities linked to at least `min_domains` domains other than their own
    ///
    /// Ordered by importance, then key.
    #[must_use]
    pub fn bridging_entities(&self, min_domains: usize) -> Vec<BridgingEntity> {
        let entities = self.entities();
        let domains: HashMap<EntityKey, WorkerKind> = entities.iter().map(|e| (e.key(), e.domain)).collect();

        let mut links: HashMap<EntityKey, (BTreeSet<WorkerKind>, usize)> = HashMap::new();
        for rel in self.relationships() {
            if !crosses_domains(&rel, &domains) {
                continue;
            }
            for (this, other) in [(&rel.source, &rel.target), (&rel.target, &rel.source)] {
                let entry = links.entry(this.clone()).or_default();
                entry.0.insert(domains[other]);
                entry.1 += 1;
            }
        }

        let mut out: Vec<BridgingEntity> = entities
            .into_iter()
            .filter_map(|entity| {
                let key = entity.key();
                let (linked, connections) = links.remove(&key)?;
                if linked.len() < min_domains.max(1) {
                    return None;
                }
                #[allow(clippy::cast_precision_loss)]
                let importance = connections as f64 + 2.0 * linked.len() as f64;
                Some(BridgingEntity {
                    key,
                    domain: entity.domain,
                    domains: linked,
                    connections,
                    importance,
                })
            })
            .collect();
        out.sort_by(|a, b| b.importance.total_cmp(&a.importance).then_with(|| a.key.cmp(&b.key)));
        out
    }

    /// Subgraph of relationships between entities of different domains
    ///
    /// Concept links are left out.
    #[must_use]
    pub fn cross_domain_graph(&self) -> CrossDomainGraph {
        let entities = self.entities();
        let domains: HashMap<EntityKey, WorkerKind> = entities.iter().map(|e| (e.key(), e.domain)).collect();
        let edges: Vec<Relationship> = self
            .relationships()
            .into_iter()
            .filter(|rel| crosses_domains(rel, &domains))
            .collect();
        let endpoints: HashSet<&EntityKey> = edges.iter().flat_map(|r| [&r.source, &r.target]).collect();
        let nodes: Vec<Entity> = entities
            .iter()
            .filter(|e| endpoints.contains(&e.key()))
            .cloned()
            .collect();
        let mut by_domain = BTreeMap::new();
        for node in &nodes {
            *by_domain.entry(node.domain).or_default() += 1;
        }
        CrossDomainGraph { nodes, edges, by_domain }
    }
}
