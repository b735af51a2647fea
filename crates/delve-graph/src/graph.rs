//! Semantic graph: typed, deduplicated, weighted entity/relationship store
//!
//! All mutations go through one `RwLock`, so a merge of one entity is never
//! observed half-applied. Rank scores are cached per topology generation.

use chrono::Utc;
use delve_types::WorkerKind;
use parking_lot::{Mutex, RwLock};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::entity::{
    Attributes, Entity, EntityKey, EntityKind, Provenance, RelationKind, Relationship,
    RelationshipKey,
};
use crate::error::GraphError;
use crate::rank::{pagerank, RankConfig};

/// Score attenuation applied to two-hop neighbours
pub const TWO_HOP_FACTOR: f64 = 0.5;

/// Neighbour returned by [`SemanticGraph::related_to`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedEntity {
    /// Neighbouring entity
    pub entity: Entity,
    /// Combined relatedness score
    pub score: f64,
    /// Distance from the query entity (1 or 2)
    pub hops: u8,
}

/// Summary statistics of the graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Number of entities
    pub entities: usize,
    /// Number of relationships
    pub relationships: usize,
    /// Entities per kind
    pub by_kind: BTreeMap<EntityKind, usize>,
    /// Relationships per kind
    pub by_relation: BTreeMap<RelationKind, usize>,
    /// Entities per originating domain
    pub by_domain: BTreeMap<WorkerKind, usize>,
    /// Sum of all edge weights
    pub total_weight: f64,
    /// Highest-ranked entity keys
    pub top_ranked: Vec<(EntityKey, f64)>,
}

#[derive(Debug, Default)]
struct GraphInner {
    graph: DiGraph<Entity, Relationship>,
    nodes: HashMap<EntityKey, NodeIndex>,
    edges: HashMap<RelationshipKey, EdgeIndex>,
    /// Bumped on every topology or weight change
    generation: u64,
}

impl GraphInner {
    fn node(&self, key: &EntityKey) -> Result<NodeIndex, GraphError> {
        self.nodes
            .get(key)
            .copied()
            .ok_or_else(|| GraphError::EntityNotFound(key.clone()))
    }

    fn ensure_node(&mut self, key: &EntityKey, domain: WorkerKind) -> NodeIndex {
        if let Some(idx) = self.nodes.get(key) {
            return *idx;
        }
        let mut entity = Entity::new(key.clone(), domain, Attributes::new(), Utc::now());
        entity.placeholder = true;
        let idx = self.graph.add_node(entity);
        self.nodes.insert(key.clone(), idx);
        self.generation += 1;
        debug!(entity = %key, "created placeholder entity");
        idx
    }

    /// Combined edge weight to every neighbour, both directions
    fn neighbour_weights(&self, idx: NodeIndex) -> HashMap<NodeIndex, f64> {
        let mut weights = HashMap::new();
        for direction in [Direction::Outgoing, Direction::Incoming] {
            for edge in self.graph.edges_directed(idx, direction) {
                let other = if direction == Direction::Outgoing {
                    edge.target()
                } else {
                    edge.source()
                };
                if other != idx {
                    *weights.entry(other).or_insert(0.0) += edge.weight().weight;
                }
            }
        }
        weights
    }

    fn sorted_neighbours(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_undirected(idx).collect();
        out.sort_by(|a, b| self.compare_keys(*a, *b));
        out.dedup();
        out
    }

    fn compare_keys(&self, a: NodeIndex, b: NodeIndex) -> Ordering {
        let (ea, eb) = (&self.graph[a], &self.graph[b]);
        (ea.kind, &ea.id).cmp(&(eb.kind, &eb.id))
    }
}

#[derive(Debug)]
struct RankCache {
    generation: u64,
    config: RankConfig,
    scores: Arc<Vec<f64>>,
}

/// Typed knowledge graph shared by all workers
#[derive(Debug, Default)]
pub struct SemanticGraph {
    inner: RwLock<GraphInner>,
    rank_cache: Mutex<Option<RankCache>>,
}

impl SemanticGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity or merge attributes into the existing one
    ///
    /// Keys present in `attributes` overwrite existing values; other keys are
    /// kept. The domain of an existing entity only changes when it was a
    /// placeholder, which takes the domain of its first real producer.
    pub fn upsert_entity(&self, key: EntityKey, attributes: Attributes, domain: WorkerKind) -> Entity {
        let mut inner = self.inner.write();
        let now = Utc::now();
        if let Some(idx) = inner.nodes.get(&key).copied() {
            let entity = &mut inner.graph[idx];
            entity.merge(attributes, now);
            if entity.placeholder {
                entity.placeholder = false;
                entity.domain = domain;
                debug!(entity = %key, %domain, "placeholder filled");
            } else {
                debug!(entity = %key, "merged entity");
            }
            return entity.clone();
        }

        let entity = Entity::new(key.clone(), domain, attributes, now);
        let idx = inner.graph.add_node(entity.clone());
        inner.nodes.insert(key, idx);
        inner.generation += 1;
        debug!(entity = %entity.key(), %domain, "inserted entity");
        entity
    }

    /// Record an observation of `source -[kind]-> target`
    ///
    /// A repeated observation adds [`Relationship::INITIAL_WEIGHT`] to the
    /// existing edge. Missing endpoints are created as placeholders tagged
    /// with the observing worker's domain.
    pub fn upsert_relationship(
        &self,
        source: EntityKey,
        target: EntityKey,
        kind: RelationKind,
        provenance: Provenance,
    ) -> Relationship {
        let mut inner = self.inner.write();
        let key = RelationshipKey::new(source, target, kind);

        if let Some(edge) = inner.edges.get(&key).copied() {
            inner.generation += 1;
            let rel = &mut inner.graph[edge];
            rel.weight += Relationship::INITIAL_WEIGHT;
            debug!(relationship = %key, weight = rel.weight, "reinforced relationship");
            return rel.clone();
        }

        let from = inner.ensure_node(&key.source, provenance.worker);
        let to = inner.ensure_node(&key.target, provenance.worker);
        let rel = Relationship {
            source: key.source.clone(),
            target: key.target.clone(),
            kind,
            weight: Relationship::INITIAL_WEIGHT,
            provenance,
        };
        let edge = inner.graph.add_edge(from, to, rel.clone());
        debug!(relationship = %key, "inserted relationship");
        inner.edges.insert(key, edge);
        inner.generation += 1;
        rel
    }

    /// Look up an entity
    #[must_use]
    pub fn entity(&self, key: &EntityKey) -> Option<Entity> {
        let inner = self.inner.read();
        inner.nodes.get(key).map(|idx| inner.graph[*idx].clone())
    }

    /// Look up a relationship
    #[must_use]
    pub fn relationship(&self, key: &RelationshipKey) -> Option<Relationship> {
        let inner = self.inner.read();
        inner.edges.get(key).map(|idx| inner.graph[*idx].clone())
    }

    /// Whether the entity exists
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.inner.read().nodes.contains_key(key)
    }

    /// Number of entities
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.inner.read().graph.node_count()
    }

    /// Number of relationships
    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.inner.read().graph.edge_count()
    }

    /// Whether the graph holds no entities
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0
    }

    /// All entities in key order
    #[must_use]
    pub fn entities(&self) -> Vec<Entity> {
        let inner = self.inner.read();
        let mut out: Vec<Entity> = inner.graph.node_weights().cloned().collect();
        out.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));
        out
    }

    /// All relationships in key order
    #[must_use]
    pub fn relationships(&self) -> Vec<Relationship> {
        let inner = self.inner.read();
        let mut out: Vec<Relationship> = inner.graph.edge_weights().cloned().collect();
        out.sort_by_key(Relationship::key);
        out
    }

    fn scores(&self, inner: &GraphInner, config: &RankConfig) -> Arc<Vec<f64>> {
        let mut cache = self.rank_cache.lock();
        if let Some(hit) = cache.as_ref() {
            if hit.generation == inner.generation && hit.config == *config {
                return Arc::clone(&hit.scores);
            }
        }
        let scores = Arc::new(pagerank(&inner.graph, config));
        *cache = Some(RankCache {
            generation: inner.generation,
            config: *config,
            scores: Arc::clone(&scores),
        });
        scores
    }

    /// Weighted PageRank, highest score first, ties by key
    #[must_use]
    pub fn rank(&self, config: &RankConfig) -> Vec<(Entity, f64)> {
        let inner = self.inner.read();
        let scores = self.scores(&inner, config);
        let mut out: Vec<(Entity, f64)> = inner
            .graph
            .node_indices()
            .map(|idx| (inner.graph[idx].clone(), scores[idx.index()]))
            .collect();
        out.sort_by(|(ea, sa), (eb, sb)| {
            sb.total_cmp(sa)
                .then_with(|| (ea.kind, &ea.id).cmp(&(eb.kind, &eb.id)))
        });
        out
    }

    /// Neighbours of `key` ranked by relatedness
    ///
    /// Direct neighbours score their combined edge weight plus their rank
    /// score normalized to the top score. When fewer than `top_k` exist, the
    /// remainder is filled from two-hop neighbours scored by
    /// [`TWO_HOP_FACTOR`] times the strongest path weight product.
    ///
    /// # Errors
    /// [`GraphError::EntityNotFound`] if `key` is unknown
    pub fn related_to(&self, key: &EntityKey, top_k: usize) -> Result<Vec<RelatedEntity>, GraphError> {
        let inner = self.inner.read();
        let origin = inner.node(key)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let scores = self.scores(&inner, &RankConfig::default());
        let max_score = scores.iter().copied().fold(0.0_f64, f64::max);
        let normalized = |idx: NodeIndex| {
            if max_score > 0.0 {
                scores[idx.index()] / max_score
            } else {
                0.0
            }
        };

        let direct = inner.neighbour_weights(origin);
        let mut first: Vec<(NodeIndex, f64)> = direct
            .iter()
            .map(|(idx, weight)| (*idx, weight + normalized(*idx)))
            .collect();
        sort_candidates(&inner, &mut first);

        let mut out: Vec<RelatedEntity> = first
            .into_iter()
            .take(top_k)
            .map(|(idx, score)| RelatedEntity {
                entity: inner.graph[idx].clone(),
                score,
                hops: 1,
            })
            .collect();
        if out.len() >= top_k {
            return Ok(out);
        }

        let mut second: HashMap<NodeIndex, f64> = HashMap::new();
        for (mid, w1) in &direct {
            for (far, w2) in inner.neighbour_weights(*mid) {
                if far == origin || direct.contains_key(&far) {
                    continue;
                }
                let path = TWO_HOP_FACTOR * w1 * w2;
                let best = second.entry(far).or_insert(0.0);
                if path > *best {
                    *best = path;
                }
            }
        }
        let mut second: Vec<(NodeIndex, f64)> = second
            .into_iter()
            .map(|(idx, path)| (idx, path + normalized(idx)))
            .collect();
        sort_candidates(&inner, &mut second);

        let remaining = top_k - out.len();
        out.extend(second.into_iter().take(remaining).map(|(idx, score)| RelatedEntity {
            entity: inner.graph[idx].clone(),
            score,
            hops: 2,
        }));
        Ok(out)
    }

    /// Shortest path ignoring edge direction
    ///
    /// Returns `Ok(None)` when both entities exist but are disconnected.
    /// Among equally short paths the one through lower keys wins.
    ///
    /// # Errors
    /// [`GraphError::EntityNotFound`] if either key is unknown
    pub fn shortest_path(&self, source: &EntityKey, target: &EntityKey) -> Result<Option<Vec<Entity>>, GraphError> {
        let inner = self.inner.read();
        let start = inner.node(source)?;
        let goal = inner.node(target)?;

        let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut seen = vec![false; inner.graph.node_count()];
        seen[start.index()] = true;

        while let Some(current) = queue.pop_front() {
            if current == goal {
                let mut path = vec![inner.graph[current].clone()];
                let mut cursor = current;
                while let Some(prev) = previous.get(&cursor) {
                    path.push(inner.graph[*prev].clone());
                    cursor = *prev;
                }
                path.reverse();
                return Ok(Some(path));
            }
            for next in inner.sorted_neighbours(current) {
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    previous.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        Ok(None)
    }

    /// Summary statistics with the `top_n` best-ranked entities
    #[must_use]
    pub fn stats(&self, top_n: usize) -> GraphStats {
        let mut stats = {
            let inner = self.inner.read();
            let mut stats = GraphStats {
                entities: inner.graph.node_count(),
                relationships: inner.graph.edge_count(),
                ..GraphStats::default()
            };
            for entity in inner.graph.node_weights() {
                *stats.by_kind.entry(entity.kind).or_default() += 1;
                *stats.by_domain.entry(entity.domain).or_default() += 1;
            }
            for rel in inner.graph.edge_weights() {
                *stats.by_relation.entry(rel.kind).or_default() += 1;
                stats.total_weight += rel.weight;
            }
            stats
        };
        stats.top_ranked = self
            .rank(&RankConfig::default())
            .into_iter()
            .take(top_n)
            .map(|(entity, score)| (entity.key(), score))
            .collect();
        stats
    }

    /// Rebuild a graph from stored entities and relationships
    ///
    /// # Errors
    /// [`GraphError::EntityNotFound`] if a relationship refers to an entity
    /// that is not in `entities`
    pub fn from_parts(entities: Vec<Entity>, relationships: Vec<Relationship>) -> Result<Self, GraphError> {
        let mut inner = GraphInner::default();
        for entity in entities {
            let key = entity.key();
            if let Some(idx) = inner.nodes.get(&key).copied() {
                let now = entity.updated_at;
                inner.graph[idx].merge(entity.attributes, now);
                continue;
            }
            let idx = inner.graph.add_node(entity);
            inner.nodes.insert(key, idx);
        }
        for rel in relationships {
            let key = rel.key();
            if let Some(edge) = inner.edges.get(&key).copied() {
                inner.graph[edge].weight += rel.weight;
                continue;
            }
            let from = inner.node(&rel.source)?;
            let to = inner.node(&rel.target)?;
            let edge = inner.graph.add_edge(from, to, rel);
            inner.edges.insert(key, edge);
        }
        inner.generation = 1;
        Ok(Self {
            inner: RwLock::new(inner),
            rank_cache: Mutex::new(None),
        })
    }
}

fn sort_candidates(inner: &GraphInner, candidates: &mut [(NodeIndex, f64)]) {
    candidates.sort_by(|(ia, sa), (ib, sb)| sb.total_cmp(sa).then_with(|| inner.compare_keys(*ia, *ib)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), serde_json::Value::from(*v)))
            .collect()
    }

    fn cite(graph: &SemanticGraph, a: &str, b: &str) -> Relationship {
        graph.upsert_relationship(
            EntityKey::paper(a),
            EntityKey::paper(b),
            RelationKind::Cites,
            Provenance::now(WorkerKind::Academic),
        )
    }

    #[test]
    fn upsert_twice_yields_one_merged_entity() {
        let graph = SemanticGraph::new();
        graph.upsert_entity(EntityKey::paper("P1"), attrs(&[("title", "A")]), WorkerKind::Academic);
        let merged = graph.upsert_entity(EntityKey::paper("P1"), attrs(&[("summary", "B")]), WorkerKind::Github);

        assert_eq!(graph.entity_count(), 1);
        assert_eq!(merged.attributes["title"], "A");
        assert_eq!(merged.attributes["summary"], "B");
        assert_eq!(merged.domain, WorkerKind::Academic);
    }

    #[test]
    fn repeated_observation_increments_weight() {
        let graph = SemanticGraph::new();
        cite(&graph, "P1", "P2");
        cite(&graph, "P1", "P2");
        let rel = cite(&graph, "P1", "P2");

        assert!((rel.weight - 3.0).abs() < f64::EPSILON);
        assert_eq!(graph.relationship_count(), 1);
    }

    #[test]
    fn edge_creates_placeholder_endpoints() {
        let graph = SemanticGraph::new();
        graph.upsert_relationship(
            EntityKey::project("org/repo"),
            EntityKey::paper("P9"),
            RelationKind::Implements,
            Provenance::now(WorkerKind::Github),
        );

        let placeholder = graph.entity(&EntityKey::paper("P9")).unwrap();
        assert!(placeholder.attributes.is_empty());
        assert!(placeholder.placeholder);
        assert_eq!(placeholder.domain, WorkerKind::Github);

        let filled = graph.upsert_entity(EntityKey::paper("P9"), attrs(&[("title", "T")]), WorkerKind::Academic);
        assert_eq!(filled.attributes["title"], "T");
        assert!(!filled.placeholder);
        assert_eq!(filled.domain, WorkerKind::Academic);
        assert_eq!(graph.entity_count(), 2);

        // the first real producer wins; later ones only merge
        let again = graph.upsert_entity(EntityKey::paper("P9"), Attributes::new(), WorkerKind::Community);
        assert_eq!(again.domain, WorkerKind::Academic);
        assert_eq!(graph.stats(0).by_domain[&WorkerKind::Academic], 1);
    }

    #[test]
    fn related_to_unknown_key_is_not_found() {
        let graph = SemanticGraph::new();
        let err = graph.related_to(&EntityKey::paper("nope"), 5).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn related_to_isolated_entity_is_empty() {
        let graph = SemanticGraph::new();
        graph.upsert_entity(EntityKey::paper("lonely"), Attributes::new(), WorkerKind::Academic);
        assert!(graph.related_to(&EntityKey::paper("lonely"), 5).unwrap().is_empty());
    }

    #[test]
    fn related_to_prefers_direct_then_fills_two_hop() {
        let graph = SemanticGraph::new();
        cite(&graph, "A", "B");
        cite(&graph, "A", "B");
        cite(&graph, "C", "A");
        cite(&graph, "B", "D");

        let related = graph.related_to(&EntityKey::paper("A"), 3).unwrap();
        let ids: Vec<&str> = related.iter().map(|r| r.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "C", "D"]);
        assert_eq!(related[0].hops, 1);
        assert_eq!(related[2].hops, 2);

        let only_direct = graph.related_to(&EntityKey::paper("A"), 1).unwrap();
        assert_eq!(only_direct.len(), 1);
        assert_eq!(only_direct[0].entity.id, "B");
    }

    #[test]
    fn shortest_path_distinguishes_missing_from_disconnected() {
        let graph = SemanticGraph::new();
        cite(&graph, "A", "B");
        cite(&graph, "C", "B");
        graph.upsert_entity(EntityKey::paper("Z"), Attributes::new(), WorkerKind::Academic);

        let path = graph.shortest_path(&EntityKey::paper("A"), &EntityKey::paper("C")).unwrap().unwrap();
        let ids: Vec<&str> = path.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);

        assert!(graph.shortest_path(&EntityKey::paper("A"), &EntityKey::paper("Z")).unwrap().is_none());
        assert!(graph.shortest_path(&EntityKey::paper("A"), &EntityKey::paper("Q")).is_err());

        let trivial = graph.shortest_path(&EntityKey::paper("A"), &EntityKey::paper("A")).unwrap().unwrap();
        assert_eq!(trivial.len(), 1);
    }

    #[test]
    fn stats_count_by_kind_relation_and_domain() {
        let graph = SemanticGraph::new();
        cite(&graph, "A", "B");
        graph.upsert_relationship(
            EntityKey::discussion("t/1"),
            EntityKey::paper("A"),
            RelationKind::Discusses,
            Provenance::now(WorkerKind::Community),
        );

        let stats = graph.stats(2);
        assert_eq!(stats.entities, 3);
        assert_eq!(stats.relationships, 2);
        assert_eq!(stats.by_kind[&EntityKind::Paper], 2);
        assert_eq!(stats.by_relation[&RelationKind::Discusses], 1);
        assert_eq!(stats.by_domain[&WorkerKind::Community], 1);
        assert_eq!(stats.top_ranked.len(), 2);
    }

    #[test]
    fn rank_cache_invalidates_on_new_edge() {
        let graph = SemanticGraph::new();
        cite(&graph, "A", "B");
        let before = graph.rank(&RankConfig::default());
        assert_eq!(before[0].0.id, "B");

        cite(&graph, "B", "C");
        cite(&graph, "A", "C");
        let after = graph.rank(&RankConfig::default());
        assert_eq!(after[0].0.id, "C");
    }
}
