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
#![allow(clippy::type_complexity)]

//! # Vortex-Integration
//! Low-level plumbing shared by the Vortex trading core crates: channel
//! abstractions (including the priority channel backing the engine event
//! loop), the [`Snapshot`] newtype, and error classification markers.

use serde::{Deserialize, Serialize};

/// Channel abstractions used to communicate between core components.
///
/// eg/ `Tx`, `UnboundedTx`, `PriorityTx`, `ChannelTxDroppable`.
pub mod channel;

/// [`Snapshot`] wrapper communicating that a value represents a point-in-time
/// state, not an incremental change.
pub mod snapshot;

pub use snapshot::Snapshot;

/// Determines if something is terminal - ie/ if processing should cease after
/// it has been observed.
pub trait Terminal {
    fn is_terminal(&self) -> bool;
}

/// Determines if an error is unrecoverable - ie/ if it requires a graceful
/// shutdown rather than local handling.
pub trait Unrecoverable {
    fn is_unrecoverable(&self) -> bool;
}

/// Shutdown marker event.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize,
)]
pub struct Shutdown;
