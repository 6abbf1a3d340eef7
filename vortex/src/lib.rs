#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments)]

//! # Vortex
//! Core trading engine of the Vortex platform.
//!
//! The `Engine` processes typed [`EngineEvent`]s on a single cooperative
//! dispatch loop with priority semantics: it maintains the authoritative
//! account and order state, gates every order through the risk engine, drives
//! the simulated venue fill model, hosts the strategy runtime, persists
//! periodic state snapshots for warm restart, and emits a serialized
//! newline-delimited JSON stream of observable events.
//!
//! I/O-bound work (venue adapters, disk) runs on the tokio executor and
//! communicates with the loop exclusively via typed events, keeping the loop
//! itself synchronous and deterministic.

use crate::{
    command::Command,
    control::ControlRequest,
    risk::breaker::BreakerCommand,
};
use derive_more::{Constructor, From};
use serde::{Deserialize, Serialize};
use vortex_data::event::MarketEvent;
use vortex_execution::client::UserEvent;
use vortex_integration::{Shutdown, Terminal, channel::Priority};

/// Line-oriented text command parsing.
pub mod command;

/// Typed control surface consumed by the HTTP gateway in service mode.
pub mod control;

/// The `Engine`: event processing, account & order state, and the dispatch
/// loop.
pub mod engine;

/// Serialized single-writer JSON-line event emission.
pub mod emitter;

/// All possible errors in the Vortex core, and stable machine-readable
/// rejection codes.
pub mod error;

/// Tracing logging initialisers.
pub mod logging;

/// Periodic state snapshots and warm-start restoration.
pub mod persistence;

/// Pre-trade risk gating, dynamic thresholds, rule evaluation and the
/// account circuit breaker.
pub mod risk;

/// The application shell: configuration, component wiring, run modes and
/// the shutdown sequence.
pub mod shell;

/// Strategy interfaces, the runtime registry and signal routing.
pub mod strategy;

/// Monotonically increasing event sequence number.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Default,
    Deserialize,
    Serialize,
    Constructor,
)]
pub struct Sequence(pub u64);

impl Sequence {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn fetch_add(&mut self) -> Sequence {
        let sequence = *self;
        self.0 += 1;
        sequence
    }
}

/// Engine input event, processed serially by the dispatch loop.
#[derive(Debug, From)]
pub enum EngineEvent {
    /// Graceful shutdown request.
    Shutdown(Shutdown),
    /// Parsed external command (stdio surface).
    Command(Command),
    /// Normalised market data.
    Market(MarketEvent),
    /// Venue execution completion or user-stream push.
    Execution(UserEvent),
    /// Operator circuit breaker directive.
    Breaker(BreakerCommand),
    /// Typed gateway request (service mode).
    Control(ControlRequest),
    /// Monotonic timer tick driving due fills and snapshot cadence.
    Tick(chrono::DateTime<chrono::Utc>),
}

impl EngineEvent {
    /// Dispatch priority used when an explicit priority is not supplied.
    pub fn default_priority(&self) -> Priority {
        match self {
            EngineEvent::Shutdown(_) | EngineEvent::Breaker(_) => Priority::Critical,
            EngineEvent::Command(_)
            | EngineEvent::Execution(_)
            | EngineEvent::Control(_)
            | EngineEvent::Tick(_) => Priority::High,
            EngineEvent::Market(_) => Priority::Normal,
        }
    }
}

impl Terminal for EngineEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, EngineEvent::Shutdown(_))
    }
}
