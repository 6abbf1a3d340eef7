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

//! # Vortex-Execution
//! Execution venue abstraction for the Vortex trading core.
//!
//! Defines the normalised order, balance and fill types, the
//! [`ExecutionClient`](client::ExecutionClient) capability set implemented by
//! live venue adapters, the fill model of the in-process simulated venue, the
//! resilience wrappers every live adapter is composed with (token-bucket rate
//! limiting, transient-error retry, circuit breaking), and venue-vs-local
//! state reconciliation.

/// Asset balances.
pub mod balance;

/// The [`ExecutionClient`](client::ExecutionClient) venue capability set and
/// user-stream event types.
pub mod client;

/// All errors generated in `vortex-execution`.
pub mod error;

/// Order identifiers, requests and state records.
pub mod order;

/// Venue-vs-local state reconciliation.
pub mod reconcile;

/// Resilience wrappers: rate limiter, retry policy and circuit breaker.
pub mod resilience;

/// Fill model of the in-process simulated venue.
pub mod simulated;

/// Fills and fees.
pub mod trade;
