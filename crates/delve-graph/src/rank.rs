//! Weighted PageRank over the knowledge graph
//!
//! Edge weight is the transition mass out of a node. Mass of dangling nodes
//! is spread uniformly. Nodes are visited in `EntityKey` order so scores do
//! not depend on insertion order.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Relationship};

/// PageRank parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    /// Damping factor
    pub damping: f64,
    /// L1 convergence threshold
    pub tolerance: f64,
    /// Iteration cap
    pub max_iterations: usize,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            damping: 0.85,
            tolerance: 1e-9,
            max_iterations: 100,
        }
    }
}

/// Compute scores indexed by `NodeIndex::index()`
pub(crate) fn pagerank(graph: &DiGraph<Entity, Relationship>, config: &RankConfig) -> Vec<f64> {
    let n = graph.node_count();
    if n == 0 {
        return Vec::new();
    }

    let mut order: Vec<NodeIndex> = graph.node_indices().collect();
    order.sort_by(|a, b| (graph[*a].kind, &graph[*a].id).cmp(&(graph[*b].kind, &graph[*b].id)));

    let mut position = vec![0usize; n];
    for (pos, idx) in order.iter().enumerate() {
        position[idx.index()] = pos;
    }

    let out_weight: Vec<f64> = order
        .iter()
        .map(|idx| {
            graph
                .edges_directed(*idx, Direction::Outgoing)
                .map(|e| e.weight().weight)
                .sum()
        })
        .collect();

    // incoming[j] = (source position, weight), sorted for a stable summation order
    let incoming: Vec<Vec<(usize, f64)>> = order
        .iter()
        .map(|idx| {
            let mut edges: Vec<(usize, f64)> = graph
                .edges_directed(*idx, Direction::Incoming)
                .map(|e| (position[e.source().index()], e.weight().weight))
                .collect();
            edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
            edges
        })
        .collect();

    #[allow(clippy::cast_precision_loss)]
    let n_f = n as f64;
    let damping = config.damping.clamp(0.0, 1.0);
    let base = (1.0 - damping) / n_f;
    let mut rank = vec![1.0 / n_f; n];

    for iteration in 0..config.max_iterations {
        let dangling: f64 = (0..n)
            .filter(|i| out_weight[*i] <= 0.0)
            .map(|i| rank[i])
            .sum();
        let spread = damping * dangling / n_f;

        let next: Vec<f64> = incoming
            .iter()
            .map(|edges| {
                let flow: f64 = edges
                    .iter()
                    .map(|(src, w)| rank[*src] * w / out_weight[*src])
                    .sum();
                base + spread + damping * flow
            })
            .collect();

        let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < config.tolerance {
            tracing::trace!(iteration, delta, "pagerank converged");
            break;
        }
    }

    let mut by_index = vec![0.0; n];
    for (pos, idx) in order.iter().enumerate() {
        by_index[idx.index()] = rank[pos];
    }
    by_index
}
