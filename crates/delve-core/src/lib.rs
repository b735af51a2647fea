//! Delve orchestration layer
//!
//! Ties the stores together for a research run:
//! - [`ResearchContext`]: explicit handle over graph, memory and checkpoints
//!   for one session
//! - [`FindingBatch`]: typed worker findings and their ingestion
//! - [`ContinuationController`]: per-worker lifecycle, relaunch instructions
//!   and acceptance of partial work
//! - [`PhaseRunner`]: concurrent execution of a phase's workers
//! - [`DeliveryReport`]: final outcomes with caveats
//! - [`DelveConfig`]: every tunable, loadable from TOML

#![warn(unreachable_pub)]

pub mod config;
pub mod context;
pub mod continuation;
pub mod error;
pub mod findings;
pub mod policy;
pub mod report;
pub mod runner;

pub use config::{ContinuationPolicy, DelveConfig};
pub use context::{ResearchContext, FINDINGS_NOTE};
pub use continuation::{
    CheckpointRef, ContinuationController, ContinuationInstruction, Decision, TerminationSignal,
    WorkerStatus,
};
pub use error::CoreError;
pub use findings::{concept_id, Finding, FindingBatch, IngestReport};
pub use policy::{AccelerationMode, AccelerationStrategy, NoAcceleration, RelaxRequirements};
pub use report::{DeliveryReport, WorkerOutcome};
pub use runner::{PhaseOutcome, PhaseRunner, Worker, WorkerFailure, WorkerTask};
