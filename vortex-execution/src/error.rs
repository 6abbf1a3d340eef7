use crate::order::ClientOrderId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vortex_integration::Unrecoverable;

/// All errors generated when interacting with an execution venue.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum ExecutionError {
    /// Temporary venue failure, eg/ connection reset, 5xx, rate limit burst.
    /// Retried by the adapter's resilience layer.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// Non-retryable venue failure, eg/ invalid request, auth failure.
    #[error("permanent venue error: {0}")]
    Permanent(String),

    /// Venue request deadline expired.
    #[error("venue request timed out after {0}ms")]
    Timeout(u64),

    /// Venue rejected the order.
    #[error("order rejected by venue: {0}")]
    Rejected(String),

    #[error("order not found on venue: {0}")]
    OrderNotFound(ClientOrderId),

    /// The adapter circuit breaker is open.
    #[error("venue circuit breaker open")]
    CircuitOpen,
}

impl ExecutionError {
    /// True if the resilience layer should retry the failed request.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient(_) | ExecutionError::Timeout(_))
    }
}

impl Unrecoverable for ExecutionError {
    fn is_unrecoverable(&self) -> bool {
        matches!(self, ExecutionError::Permanent(_))
    }
}

/// Errors produced when validating a
/// [`PlaceOrderRequest`](crate::order::PlaceOrderRequest) before it reaches
/// any venue.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum RequestValidationError {
    #[error("order qty must be positive")]
    QtyNotPositive,

    #[error("limit orders require a price")]
    PriceMissing,

    #[error("market orders must not carry a price")]
    PriceUnexpected,

    #[error("limit order price must be positive")]
    PriceNotPositive,

    #[error("client order id invalid: {0}")]
    ClientOrderIdInvalid(String),

    #[error("unknown order kind: {0}")]
    UnknownOrderKind(String),

    #[error("unknown time in force: {0}")]
    UnknownTimeInForce(String),
}
