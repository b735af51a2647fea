//! Property tests for the semantic graph

use delve_graph::{
    Attributes, EntityKey, EntityKind, Provenance, RankConfig, RelationKind, SemanticGraph,
};
use delve_types::WorkerKind;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn kind_strategy() -> impl Strategy<Value = EntityKind> {
    prop_oneof![
        Just(EntityKind::Paper),
        Just(EntityKind::Project),
        Just(EntityKind::Discussion),
        Just(EntityKind::Concept),
    ]
}

fn relation_strategy() -> impl Strategy<Value = RelationKind> {
    prop_oneof![
        Just(RelationKind::Cites),
        Just(RelationKind::Implements),
        Just(RelationKind::Discusses),
        Just(RelationKind::RelatesTo),
    ]
}

fn key_strategy() -> impl Strategy<Value = EntityKey> {
    (kind_strategy(), "[a-e]").prop_map(|(kind, id)| EntityKey::new(kind, id))
}

fn edges_strategy() -> impl Strategy<Value = Vec<(EntityKey, EntityKey, RelationKind)>> {
    prop::collection::vec((key_strategy(), key_strategy(), relation_strategy()), 0..40)
}

fn build(edges: &[(EntityKey, EntityKey, RelationKind)]) -> SemanticGraph {
    let graph = SemanticGraph::new();
    for (src, dst, kind) in edges {
        graph.upsert_relationship(src.clone(), dst.clone(), *kind, Provenance::now(WorkerKind::Academic));
    }
    graph
}

proptest! {
    #[test]
    fn no_duplicate_entities(keys in prop::collection::vec(key_strategy(), 1..50)) {
        let graph = SemanticGraph::new();
        for (i, key) in keys.iter().enumerate() {
            let attrs = Attributes::from([(format!("a{}", i % 3), serde_json::Value::from(i))]);
            graph.upsert_entity(key.clone(), attrs, WorkerKind::Community);
        }
        let mut distinct = keys.clone();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(graph.entity_count(), distinct.len());
    }

    #[test]
    fn merge_is_idempotent(key in key_strategy(), title in "[a-z]{1,8}") {
        let graph = SemanticGraph::new();
        let attrs = Attributes::from([("title".to_string(), serde_json::Value::from(title))]);
        let once = graph.upsert_entity(key.clone(), attrs.clone(), WorkerKind::Academic);
        let twice = graph.upsert_entity(key, attrs, WorkerKind::Academic);
        prop_assert_eq!(once.attributes, twice.attributes);
        prop_assert_eq!(graph.entity_count(), 1);
    }

    #[test]
    fn weight_equals_observation_count(edges in edges_strategy()) {
        let graph = build(&edges);
        for rel in graph.relationships() {
            #[allow(clippy::cast_precision_loss)]
            let observed = edges
                .iter()
                .filter(|(s, d, k)| *s == rel.source && *d == rel.target && *k == rel.kind)
                .count() as f64;
            prop_assert!((rel.weight - observed).abs() < 1e-9);
        }
    }

    #[test]
    fn graph_is_closed_under_edges(edges in edges_strategy()) {
        let graph = build(&edges);
        for rel in graph.relationships() {
            prop_assert!(graph.contains(&rel.source));
            prop_assert!(graph.contains(&rel.target));
        }
    }

    #[test]
    fn rank_is_deterministic_across_insertion_order(edges in edges_strategy()) {
        let forward = build(&edges);
        let mut reversed_edges = edges.clone();
        reversed_edges.reverse();
        let backward = build(&reversed_edges);

        let a: BTreeMap<EntityKey, f64> = forward.rank(&RankConfig::default()).into_iter().map(|(e, s)| (e.key(), s)).collect();
        let b: BTreeMap<EntityKey, f64> = backward.rank(&RankConfig::default()).into_iter().map(|(e, s)| (e.key(), s)).collect();
        prop_assert_eq!(a.len(), b.len());
        for (key, score) in &a {
            prop_assert!((score - b[key]).abs() < 1e-9);
        }
    }

    #[test]
    fn related_to_is_repeatable(edges in edges_strategy(), top_k in 0usize..8) {
        let graph = build(&edges);
        for entity in graph.entities() {
            let first = graph.related_to(&entity.key(), top_k).unwrap();
            let second = graph.related_to(&entity.key(), top_k).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert!(first.len() <= top_k);
            prop_assert!(first.iter().all(|r| r.entity.key() != entity.key()));
        }
    }
}

#[test]
fn three_upserts_give_weight_three() {
    let graph = SemanticGraph::new();
    for _ in 0..3 {
        graph.upsert_relationship(
            EntityKey::paper("P1"),
            EntityKey::paper("P2"),
            RelationKind::Cites,
            Provenance::now(WorkerKind::Academic),
        );
    }
    let rels = graph.relationships();
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].weight, 3.0);
}

#[test]
fn identical_input_gives_identical_related_and_path() {
    let edges = vec![
        (EntityKey::paper("A"), EntityKey::paper("B"), RelationKind::Cites),
        (EntityKey::project("r"), EntityKey::paper("A"), RelationKind::Implements),
        (EntityKey::discussion("t"), EntityKey::project("r"), RelationKind::Discusses),
        (EntityKey::paper("B"), EntityKey::concept("c"), RelationKind::RelatesTo),
    ];
    let g1 = build(&edges);
    let g2 = build(&edges);

    assert_eq!(
        g1.related_to(&EntityKey::paper("A"), 10).unwrap(),
        g2.related_to(&EntityKey::paper("A"), 10).unwrap()
    );
    let path = g1
        .shortest_path(&EntityKey::discussion("t"), &EntityKey::concept("c"))
        .unwrap()
        .unwrap();
    let keys: Vec<String> = path.iter().map(|e| e.key().to_string()).collect();
    assert_eq!(keys, vec!["discussion:t", "project:r", "paper:A", "paper:B", "concept:c"]);
}
