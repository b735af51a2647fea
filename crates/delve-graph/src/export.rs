//! Visualization exports: JSON, Mermaid, Graphviz DOT, GraphML

use std::fmt::Write as _;
use std::str::FromStr;

use crate::entity::{Entity, EntityKind};
use crate::error::GraphError;
use crate::graph::SemanticGraph;
use crate::store::GraphDocument;

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Graph document as pretty JSON
    Json,
    /// Mermaid flowchart
    Mermaid,
    /// Graphviz DOT
    Dot,
    /// GraphML XML
    GraphMl,
}

impl FromStr for ExportFormat {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "mermaid" | "mmd" => Ok(Self::Mermaid),
            "dot" | "graphviz" => Ok(Self::Dot),
            "graphml" => Ok(Self::GraphMl),
            other => Err(GraphError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Render the graph in the requested format
///
/// # Errors
/// Only JSON serialization can fail
pub fn export(graph: &SemanticGraph, format: ExportFormat) -> Result<String, GraphError> {
    let document = GraphDocument::from_graph(graph);
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(&document)?),
        ExportFormat::Mermaid => Ok(mermaid(&document)),
        ExportFormat::Dot => Ok(dot(&document)),
        ExportFormat::GraphMl => Ok(graphml(&document)),
    }
}

fn node_ids(document: &GraphDocument) -> std::collections::HashMap<String, String> {
    document
        .nodes
        .iter()
        .enumerate()
        .map(|(i, e)| (e.key().to_string(), format!("n{i}")))
        .collect()
}

fn class_style(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Paper => "fill:#e1f5fe,stroke:#0277bd",
        EntityKind::Project => "fill:#e8f5e9,stroke:#2e7d32",
        EntityKind::Discussion => "fill:#fff3e0,stroke:#ef6c00",
        EntityKind::Concept => "fill:#f3e5f5,stroke:#6a1b9a",
    }
}

fn mermaid_label(entity: &Entity) -> String {
    entity.label().replace('"', "#quot;").replace('\n', " ")
}

fn mermaid(document: &GraphDocument) -> String {
    let ids = node_ids(document);
    let mut out = String::from("graph TD\n");
    for kind in EntityKind::ALL {
        let _ = writeln!(out, "    classDef {kind} {}", class_style(kind));
    }
    for (i, entity) in document.nodes.iter().enumerate() {
        let _ = writeln!(out, "    n{i}[\"{}\"]:::{}", mermaid_label(entity), entity.kind);
    }
    for rel in &document.edges {
        let (Some(src), Some(dst)) = (ids.get(&rel.source.to_string()), ids.get(&rel.target.to_string())) else {
            continue;
        };
        let _ = writeln!(out, "    {src} -->|{}| {dst}", rel.kind);
    }
    out
}

fn dot_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn dot(document: &GraphDocument) -> String {
    let mut out = String::from("digraph knowledge {\n    rankdir=LR;\n");
    for entity in &document.nodes {
        let shape = match entity.kind {
            EntityKind::Paper => "note",
            EntityKind::Project => "box",
            EntityKind::Discussion => "ellipse",
            EntityKind::Concept => "diamond",
        };
        let _ = writeln!(
            out,
            "    \"{}\" [label=\"{}\", shape={shape}, domain=\"{}\"];",
            dot_escape(&entity.key().to_string()),
            dot_escape(entity.label()),
            entity.domain
        );
    }
    for rel in &document.edges {
        let _ = writeln!(
            out,
            "    \"{}\" -> \"{}\" [label=\"{}\", weight={}];",
            dot_escape(&rel.source.to_string()),
            dot_escape(&rel.target.to_string()),
            rel.kind,
            rel.weight
        );
    }
    out.push_str("}\n");
    out
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn graphml(document: &GraphDocument) -> String {
    let mut out = String::from(concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
        "<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n",
        "  <key id=\"kind\" for=\"node\" attr.name=\"kind\" attr.type=\"string\"/>\n",
        "  <key id=\"label\" for=\"node\" attr.name=\"label\" attr.type=\"string\"/>\n",
        "  <key id=\"domain\" for=\"node\" attr.name=\"domain\" attr.type=\"string\"/>\n",
        "  <key id=\"relation\" for=\"edge\" attr.name=\"relation\" attr.type=\"string\"/>\n",
        "  <key id=\"weight\" for=\"edge\" attr.name=\"weight\" attr.type=\"double\"/>\n",
        "  <graph id=\"knowledge\" edgedefault=\"directed\">\n",
    ));
    for entity in &document.nodes {
        let _ = writeln!(out, "    <node id=\"{}\">", xml_escape(&entity.key().to_string()));
        let _ = writeln!(out, "      <data key=\"kind\">{}</data>", entity.kind);
        let _ = writeln!(out, "      <data key=\"label\">{}</data>", xml_escape(entity.label()));
        let _ = writeln!(out, "      <data key=\"domain\">{}</data>", entity.domain);
        out.push_str("    </node>\n");
    }
    for (i, rel) in document.edges.iter().enumerate() {
        let _ = writeln!(
            out,
            "    <edge id=\"e{i}\" source=\"{}\" target=\"{}\">",
            xml_escape(&rel.source.to_string()),
            xml_escape(&rel.target.to_string())
        );
        let _ = writeln!(out, "      <data key=\"relation\">{}</data>", rel.kind);
        let _ = writeln!(out, "      <data key=\"weight\">{}</data>", rel.weight);
        out.push_str("    </edge>\n");
    }
    out.push_str("  </graph>\n</graphml>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Attributes, EntityKey, Provenance, RelationKind};
    use delve_types::WorkerKind;

    fn sample() -> SemanticGraph {
        let graph = SemanticGraph::new();
        let attrs = Attributes::from([("title".to_string(), serde_json::Value::from("Say \"hi\" & <go>"))]);
        graph.upsert_entity(EntityKey::paper("P1"), attrs, WorkerKind::Academic);
        graph.upsert_relationship(
            EntityKey::project("org/repo"),
            EntityKey::paper("P1"),
            RelationKind::Implements,
            Provenance::now(WorkerKind::Github),
        );
        graph
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("GraphML".parse::<ExportFormat>().unwrap(), ExportFormat::GraphMl);
        assert_eq!("dot".parse::<ExportFormat>().unwrap(), ExportFormat::Dot);
        assert!(matches!(
            "svg".parse::<ExportFormat>(),
            Err(GraphError::UnsupportedFormat(f)) if f == "svg"
        ));
    }

    #[test]
    fn mermaid_has_classes_and_edges() {
        let out = export(&sample(), ExportFormat::Mermaid).unwrap();
        assert!(out.starts_with("graph TD\n"));
        assert!(out.contains("classDef paper"));
        assert!(out.contains(":::project"));
        assert!(out.contains("#quot;hi#quot;"));
        assert!(out.contains("-->|implements|"));
    }

    #[test]
    fn dot_and_graphml_escape_labels() {
        let graph = sample();
        let dot = export(&graph, ExportFormat::Dot).unwrap();
        assert!(dot.contains("\\\"hi\\\""));
        assert!(dot.contains("\"project:org/repo\" -> \"paper:P1\""));

        let xml = export(&graph, ExportFormat::GraphMl).unwrap();
        assert!(xml.contains("&quot;hi&quot; &amp; &lt;go&gt;"));
        assert!(xml.contains("<data key=\"weight\">1</data>"));
    }

    #[test]
    fn json_export_is_a_graph_document() {
        let out = export(&sample(), ExportFormat::Json).unwrap();
        let doc: GraphDocument = serde_json::from_str(&out).unwrap();
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.edges.len(), 1);
    }
}
