//! Subcommand handlers
//!
//! Each handler writes JSON (or the requested export format) to `out` and
//! returns the process outcome. Read-only commands never create the graph.

use crate::Exit;
use anyhow::Context as _;
use delve_checkpoint::CheckpointManager;
use delve_core::{DelveConfig, FindingBatch, IngestReport, ResearchContext};
use delve_graph::{export as render, EntityKey, ExportFormat, GraphRef, GraphStore, SemanticGraph};
use delve_memory::TemporalLog;
use delve_types::{SessionId, WorkerId, WorkerKind};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn load_graph(config: &DelveConfig) -> anyhow::Result<SemanticGraph> {
    let store = GraphStore::new(&config.data_dir);
    store
        .load(&config.knowledge_base)
        .with_context(|| format!("knowledge base {:?}", config.knowledge_base))
}

fn write_json(out: &mut dyn Write, value: &impl serde::Serialize) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// Ingest batch files in one session and persist the graph
///
/// # Errors
/// Unreadable batches or store failures
pub fn build_graph(
    config: DelveConfig,
    files: &[PathBuf],
    query: &str,
    out: &mut dyn Write,
) -> anyhow::Result<Exit> {
    let batches = files
        .iter()
        .map(|path| FindingBatch::from_path(path))
        .collect::<Result<Vec<_>, _>>()?;

    let ctx = ResearchContext::open(config, query)?;
    let session = ctx.session();
    let mut total = IngestReport::default();
    let mut phases: Vec<&str> = Vec::new();
    for batch in &batches {
        let phase = batch.kind.as_str();
        let report = ctx.ingest(phase, batch)?;
        debug!(worker = %batch.worker, entities = report.entities, "batch ingested");
        total.entities += report.entities;
        total.relationships += report.relationships;
        total.primary += report.primary;
        total.key += report.key;
        total.record_seq = report.record_seq;
        if !phases.contains(&phase) {
            phases.push(phase);
        }
    }
    for phase in phases {
        ctx.complete_phase(phase)?;
    }
    let graph_path = GraphStore::new(&ctx.config().data_dir).path(&ctx.config().knowledge_base);
    let stats = ctx.graph().stats(0);
    let summary = ctx.close()?;
    info!(%session, batches = batches.len(), "graph built");

    write_json(
        out,
        &json!({
            "session": session,
            "batches": batches.len(),
            "ingested": total,
            "graph": graph_path,
            "entities": stats.entities,
            "relationships": stats.relationships,
            "phases_completed": summary.phases_completed,
        }),
    )?;
    Ok(Exit::Success)
}

/// Print the entities most related to `key`
///
/// # Errors
/// Missing store, malformed key or unknown entity
pub fn related(config: &DelveConfig, key: &str, top_k: usize, out: &mut dyn Write) -> anyhow::Result<Exit> {
    let key: EntityKey = key.parse()?;
    let graph = load_graph(config)?;
    let related = graph.related_to(&key, top_k)?;
    write_json(out, &related)?;
    Ok(Exit::Success)
}

/// Print the shortest connection between two entities
///
/// # Errors
/// Missing store, malformed keys or unknown entities
pub fn path(config: &DelveConfig, source: &str, target: &str, out: &mut dyn Write) -> anyhow::Result<Exit> {
    let source: EntityKey = source.parse()?;
    let target: EntityKey = target.parse()?;
    let graph = load_graph(config)?;
    match graph.shortest_path(&source, &target)? {
        Some(path) => {
            write_json(out, &path)?;
            Ok(Exit::Success)
        }
        None => {
            warn!(%source, %target, "entities are not connected");
            write_json(out, &json!({ "source": source, "target": target, "path": null }))?;
            Ok(Exit::NotFound)
        }
    }
}

/// Print graph statistics
///
/// # Errors
/// Missing store
pub fn stats(config: &DelveConfig, top: usize, out: &mut dyn Write) -> anyhow::Result<Exit> {
    let graph = load_graph(config)?;
    write_json(out, &graph.stats(top))?;
    Ok(Exit::Success)
}

/// Render the graph to `output` or `out`
///
/// # Errors
/// Missing store, unknown format or unwritable output
pub fn export(
    config: &DelveConfig,
    format: &str,
    output: Option<&PathBuf>,
    out: &mut dyn Write,
) -> anyhow::Result<Exit> {
    let format: ExportFormat = format.parse()?;
    let graph = load_graph(config)?;
    let rendered = render(&graph, format)?;
    match output {
        Some(path) => write_file(path, &rendered)?,
        None => {
            out.write_all(rendered.as_bytes())?;
            if !rendered.ends_with('\n') {
                writeln!(out)?;
            }
        }
    }
    Ok(Exit::Success)
}

fn write_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "export written");
    Ok(())
}

/// Compare a worker's latest checkpoint with the minimum for its kind
///
/// Unmet thresholds return [`Exit::Partial`] with the deficits printed.
///
/// # Errors
/// Invalid worker id, unknown kind or unreadable checkpoints
pub fn progress(
    config: &DelveConfig,
    worker: &str,
    kind: Option<&str>,
    out: &mut dyn Write,
) -> anyhow::Result<Exit> {
    let worker = WorkerId::new(worker)?;
    let kind: WorkerKind = match kind {
        Some(kind) => kind.parse()?,
        None => worker
            .as_str()
            .parse()
            .with_context(|| format!("cannot infer the kind of {worker}, pass --kind"))?,
    };

    let checkpoints = CheckpointManager::new(&config.data_dir, config.requirements);
    let latest = checkpoints.latest(&worker)?;
    let check = checkpoints.meets_minimum(&worker, kind)?;
    write_json(
        out,
        &json!({
            "worker": worker,
            "kind": kind,
            "met": check.met,
            "checkpoint": latest.as_ref().map(|c| c.sequence),
            "counts": latest.as_ref().map(|c| c.counts).unwrap_or_default(),
            "deficits": check.deficits,
        }),
    )?;
    Ok(if check.met { Exit::Success } else { Exit::Partial })
}

/// Print a session's temporal records as JSON lines
///
/// # Errors
/// Invalid session id, unknown phase, broken chain or unreadable log
pub fn replay(
    config: &DelveConfig,
    session: &str,
    from_phase: Option<&str>,
    verify: bool,
    out: &mut dyn Write,
) -> anyhow::Result<Exit> {
    let session: SessionId = session.parse()?;
    let log = TemporalLog::open(&config.data_dir)?;
    if verify {
        let verified = log.verify_chain(session)?;
        info!(%session, records = verified, "hash chain verified");
    }

    let replay = log.replay(session, from_phase)?;
    if replay.is_empty() {
        warn!(%session, "no records for session");
        return Ok(Exit::NotFound);
    }
    for record in replay.iter() {
        serde_json::to_writer(&mut *out, &record?)?;
        writeln!(out)?;
    }
    Ok(Exit::Success)
}

/// Print a session's events, or one snapshot per phase
///
/// # Errors
/// Invalid session id or unreadable log
pub fn timeline(config: &DelveConfig, session: &str, evolution: bool, out: &mut dyn Write) -> anyhow::Result<Exit> {
    let session: SessionId = session.parse()?;
    let log = TemporalLog::open(&config.data_dir)?;
    let empty = if evolution {
        let snapshots = log.evolution(session)?;
        write_json(out, &snapshots)?;
        snapshots.is_empty()
    } else {
        let events = log.timeline(session)?;
        write_json(out, &events)?;
        events.is_empty()
    };
    if empty {
        warn!(%session, "no records for session");
        return Ok(Exit::NotFound);
    }
    Ok(Exit::Success)
}

/// Print every temporal record that touched an entity
///
/// # Errors
/// Malformed key or unreadable log
pub fn provenance(config: &DelveConfig, key: &str, out: &mut dyn Write) -> anyhow::Result<Exit> {
    let key: EntityKey = key.parse()?;
    let log = TemporalLog::open(&config.data_dir)?;
    let records = log.provenance(&GraphRef::from(key.clone()))?;
    write_json(out, &records)?;
    if records.is_empty() {
        warn!(entity = %key, "entity never recorded");
        return Ok(Exit::NotFound);
    }
    Ok(Exit::Success)
}

/// Print the citation summary, or the chain cited by `paper`
///
/// # Errors
/// Missing store, malformed key or unknown paper
pub fn citations(config: &DelveConfig, paper: Option<&str>, depth: usize, out: &mut dyn Write) -> anyhow::Result<Exit> {
    let graph = load_graph(config)?;
    match paper {
        Some(paper) => {
            let paper: EntityKey = paper.parse()?;
            write_json(out, &graph.citation_chain(&paper, depth)?)?;
        }
        None => write_json(out, &graph.citation_summary())?,
    }
    Ok(Exit::Success)
}

/// Print entities bridging domains, or the cross-domain subgraph
///
/// # Errors
/// Missing store
pub fn bridges(config: &DelveConfig, min_domains: usize, subgraph: bool, out: &mut dyn Write) -> anyhow::Result<Exit> {
    let graph = load_graph(config)?;
    if subgraph {
        write_json(out, &graph.cross_domain_graph())?;
    } else {
        write_json(out, &graph.bridging_entities(min_domains))?;
    }
    Ok(Exit::Success)
}
