//! `delve` command line
//!
//! Thin layer over the stores. Command handlers write their results to any
//! [`std::io::Write`] so they can be exercised without a process; logs go to
//! stderr and never mix with the JSON on stdout.
//!
//! Exit codes:
//! - `0` success
//! - `1` fatal error
//! - `2` not found
//! - `3` partial: minimum not met, the deficit is printed as JSON

#![warn(unreachable_pub)]

pub mod commands;

use anyhow::Context as _;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use delve_core::{CoreError, DelveConfig};
use delve_graph::GraphError;
use delve_memory::MemoryError;
use std::io::Write;
use std::path::PathBuf;

/// Process outcome of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Command succeeded
    Success,
    /// Requested entity, session or store does not exist
    NotFound,
    /// Thresholds unmet
    Partial,
    /// Unrecoverable failure
    Fatal,
}

impl Exit {
    /// Process exit code
    #[inline]
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Fatal => 1,
            Self::NotFound => 2,
            Self::Partial => 3,
        }
    }
}

/// Map an error chain to an exit code
#[must_use]
pub fn classify(err: &anyhow::Error) -> Exit {
    let not_found = err.chain().any(|cause| {
        cause.downcast_ref::<CoreError>().is_some_and(CoreError::is_not_found)
            || cause.downcast_ref::<GraphError>().is_some_and(GraphError::is_not_found)
            || cause.downcast_ref::<MemoryError>().is_some_and(MemoryError::is_not_found)
    });
    if not_found {
        Exit::NotFound
    } else {
        Exit::Fatal
    }
}

/// Command definition
#[must_use]
pub fn cli() -> Command {
    Command::new("delve")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect and build Delve research memory")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .env("DELVE_DATA_DIR")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Root of the durable state, overrides the config file"),
        )
        .arg(
            Arg::new("knowledge-base")
                .long("kb")
                .global(true)
                .help("Knowledge base name, overrides the config file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("build-graph")
                .about("Ingest finding batches into the knowledge base")
                .arg(
                    Arg::new("batches")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(PathBuf))
                        .help("Finding batch JSON files"),
                )
                .arg(
                    Arg::new("query")
                        .long("query")
                        .default_value("build-graph")
                        .help("Research query recorded for the session"),
                ),
        )
        .subcommand(
            Command::new("related")
                .about("Entities most related to a key")
                .arg(Arg::new("key").required(true).help("Entity key, e.g. paper:2305.10601"))
                .arg(
                    Arg::new("top-k")
                        .long("top-k")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Maximum number of results"),
                ),
        )
        .subcommand(
            Command::new("path")
                .about("Shortest connection between two entities")
                .arg(Arg::new("source").required(true))
                .arg(Arg::new("target").required(true)),
        )
        .subcommand(
            Command::new("stats").about("Knowledge base statistics").arg(
                Arg::new("top")
                    .long("top")
                    .default_value("10")
                    .value_parser(value_parser!(usize))
                    .help("Number of top-ranked entities"),
            ),
        )
        .subcommand(
            Command::new("export")
                .about("Render the knowledge base")
                .arg(
                    Arg::new("format")
                        .long("format")
                        .default_value("json")
                        .help("json, mermaid, dot or graphml"),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .value_parser(value_parser!(PathBuf))
                        .help("Write to a file instead of stdout"),
                ),
        )
        .subcommand(
            Command::new("progress")
                .about("Compare a worker's latest checkpoint with its minimum")
                .arg(Arg::new("worker").required(true))
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .help("academic, github or community; defaults to the worker's role"),
                ),
        )
        .subcommand(
            Command::new("replay")
                .about("Print a session's temporal records in order")
                .arg(Arg::new("session").required(true))
                .arg(
                    Arg::new("from-phase")
                        .long("from-phase")
                        .help("Start at this phase"),
                )
                .arg(
                    Arg::new("verify")
                        .long("verify")
                        .action(ArgAction::SetTrue)
                        .help("Check the hash chain first"),
                ),
        )
        .subcommand(
            Command::new("timeline")
                .about("Events of a session, or its per-phase evolution")
                .arg(Arg::new("session").required(true))
                .arg(
                    Arg::new("evolution")
                        .long("evolution")
                        .action(ArgAction::SetTrue)
                        .help("Print one snapshot per phase instead"),
                ),
        )
        .subcommand(
            Command::new("provenance")
                .about("Temporal records that touched an entity, across sessions")
                .arg(Arg::new("key").required(true).help("Entity key, e.g. paper:2305.10601")),
        )
        .subcommand(
            Command::new("citations")
                .about("Citation network summary, or the chain cited by one paper")
                .arg(Arg::new("paper").help("Paper key; omit for the summary"))
                .arg(
                    Arg::new("depth")
                        .long("depth")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Citation hops to follow"),
                ),
        )
        .subcommand(
            Command::new("bridges")
                .about("Entities linking several domains")
                .arg(
                    Arg::new("min-domains")
                        .long("min-domains")
                        .default_value("2")
                        .value_parser(value_parser!(usize))
                        .help("Other domains an entity must reach"),
                )
                .arg(
                    Arg::new("graph")
                        .long("graph")
                        .action(ArgAction::SetTrue)
                        .help("Print the cross-domain subgraph instead"),
                ),
        )
}

/// Resolve configuration from the file and command line overrides
///
/// # Errors
/// Unreadable or invalid configuration
pub fn load_config(matches: &ArgMatches) -> anyhow::Result<DelveConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => {
            DelveConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => DelveConfig::default(),
    };
    if let Some(dir) = matches.get_one::<PathBuf>("data-dir") {
        config = config.with_data_dir(dir);
    }
    if let Some(kb) = matches.get_one::<String>("knowledge-base") {
        config = config.with_knowledge_base(kb);
    }
    config.validate()?;
    Ok(config)
}

/// Run the selected subcommand
///
/// # Errors
/// Whatever the command fails with; see [`classify`] for exit codes
pub fn run(matches: &ArgMatches, out: &mut dyn Write) -> anyhow::Result<Exit> {
    let config = load_config(matches)?;
    match matches.subcommand() {
        Some(("build-graph", args)) => {
            let files: Vec<PathBuf> = args
                .get_many::<PathBuf>("batches")
                .map(|v| v.cloned().collect())
                .unwrap_or_default();
            let query = args.get_one::<String>("query").map_or("build-graph", String::as_str);
            commands::build_graph(config, &files, query, out)
        }
        Some(("related", args)) => {
            let key = required(args, "key")?;
            let top_k = args.get_one::<usize>("top-k").copied().unwrap_or(10);
            commands::related(&config, key, top_k, out)
        }
        Some(("path", args)) => {
            commands::path(&config, required(args, "source")?, required(args, "target")?, out)
        }
        Some(("stats", args)) => {
            let top = args.get_one::<usize>("top").copied().unwrap_or(10);
            commands::stats(&config, top, out)
        }
        Some(("export", args)) => {
            let format = args.get_one::<String>("format").map_or("json", String::as_str);
            commands::export(&config, format, args.get_one::<PathBuf>("output"), out)
        }
        Some(("progress", args)) => {
            let kind = args.get_one::<String>("kind").map(String::as_str);
            commands::progress(&config, required(args, "worker")?, kind, out)
        }
        Some(("replay", args)) => {
            let from_phase = args.get_one::<String>("from-phase").map(String::as_str);
            commands::replay(&config, required(args, "session")?, from_phase, args.get_flag("verify"), out)
        }
        Some(("timeline", args)) => {
            commands::timeline(&config, required(args, "session")?, args.get_flag("evolution"), out)
        }
        Some(("provenance", args)) => commands::provenance(&config, required(args, "key")?, out),
        Some(("citations", args)) => {
            let paper = args.get_one::<String>("paper").map(String::as_str);
            let depth = args.get_one::<usize>("depth").copied().unwrap_or(3);
            commands::citations(&config, paper, depth, out)
        }
        Some(("bridges", args)) => {
            let min_domains = args.get_one::<usize>("min-domains").copied().unwrap_or(2);
            commands::bridges(&config, min_domains, args.get_flag("graph"), out)
        }
        Some((other, _)) => anyhow::bail!("unknown command {other}"),
        None => anyhow::bail!("no command given"),
    }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> anyhow::Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing argument <{name}>"))
}
