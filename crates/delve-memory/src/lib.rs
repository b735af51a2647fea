//! Delve memory layers
//!
//! - [`TemporalLog`]: append-only, hash-chained provenance timeline keyed by
//!   session and phase, replayable in `(timestamp, seq)` order
//! - [`EpisodicWindow`]: bounded working set of each active session, with
//!   summaries persisted at session end and lexical similarity search over
//!   past sessions
//! - Provenance, time-range, timeline and per-phase evolution queries over
//!   the temporal log

#![warn(unreachable_pub)]

pub mod episodic;
pub mod error;
pub mod temporal;
pub mod timeline;

pub use episodic::{
    DomainCounts, EpisodicSession, EpisodicWindow, SessionSummary, SimilarSession, WindowLimits,
};
pub use error::MemoryError;
pub use temporal::{
    RecordProvenance, Replay, ReplayIter, TemporalLog, TemporalRecord, GENESIS_HASH, SESSION_PHASE,
};
pub use timeline::{PhaseSnapshot, TimelineEvent};
