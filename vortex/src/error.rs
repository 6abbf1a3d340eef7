use serde::{Deserialize, Serialize};
use thiserror::Error;
use vortex_data::error::DataError;
use vortex_execution::error::{ExecutionError, RequestValidationError};
use vortex_instrument::symbol::SymbolError;
use vortex_integration::Unrecoverable;

/// Stable machine-readable rejection code attached to every user-facing
/// rejection, alongside a human-readable message.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum RejectCode {
    DuplicateCoid,
    InsufficientFunds,
    CircuitBreaker,
    NotionalCap,
    PositionCap,
    LeverageCap,
    PriceDeviation,
    DailyLoss,
    RuleRejected,
    InvalidRequest,
    OrderNotFound,
    VenueTimeout,
    QueueFull,
}

impl RejectCode {
    /// Stable code string suitable for programmatic handling.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::DuplicateCoid => "DUPLICATE_COID",
            RejectCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            RejectCode::CircuitBreaker => "CIRCUIT_BREAKER",
            RejectCode::NotionalCap => "NOTIONAL_CAP",
            RejectCode::PositionCap => "POSITION_CAP",
            RejectCode::LeverageCap => "LEVERAGE_CAP",
            RejectCode::PriceDeviation => "PRICE_DEVIATION",
            RejectCode::DailyLoss => "DAILY_LOSS",
            RejectCode::RuleRejected => "RULE_REJECTED",
            RejectCode::InvalidRequest => "INVALID_REQUEST",
            RejectCode::OrderNotFound => "ORDER_NOT_FOUND",
            RejectCode::VenueTimeout => "VENUE_TIMEOUT",
            RejectCode::QueueFull => "QUEUE_FULL",
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Represents possible errors that can occur in the engine.
///
/// A distinction is made between a recoverable and unrecoverable error:
/// - Recoverable errors do not result in the termination of the engine.
/// - Unrecoverable errors result in the graceful termination of the engine.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum EngineError {
    #[error("recoverable error: {0}")]
    Recoverable(#[from] RecoverableEngineError),

    #[error("unrecoverable error: {0}")]
    Unrecoverable(#[from] UnrecoverableEngineError),
}

/// Represents temporary error conditions the engine can recover from.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum RecoverableEngineError {
    #[error("event queue full - non-critical producer back-pressured")]
    QueueFull,

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("transient execution error: {0}")]
    Execution(ExecutionError),

    #[error("strategy error: {0}")]
    Strategy(String),

    #[error("handler failed: {0}")]
    Handler(String),
}

/// Represents fatal error conditions the engine cannot recover from.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum UnrecoverableEngineError {
    #[error("critical event admission failed: {0}")]
    CriticalAdmissionFailed(String),

    #[error("state corruption detected on restore: {0}")]
    StateCorrupt(String),

    #[error("persistence IO failure: {0}")]
    PersistenceIo(String),

    #[error("{0}")]
    Custom(String),
}

impl Unrecoverable for EngineError {
    fn is_unrecoverable(&self) -> bool {
        matches!(self, EngineError::Unrecoverable(_))
    }
}

impl From<ExecutionError> for EngineError {
    fn from(error: ExecutionError) -> Self {
        if error.is_unrecoverable() {
            EngineError::Unrecoverable(UnrecoverableEngineError::Custom(error.to_string()))
        } else {
            EngineError::Recoverable(RecoverableEngineError::Execution(error))
        }
    }
}

impl From<DataError> for EngineError {
    fn from(error: DataError) -> Self {
        EngineError::Recoverable(RecoverableEngineError::Data(error))
    }
}

/// User-facing order rejection: a stable [`RejectCode`] plus a
/// human-readable message, with any dynamic-threshold adjustment
/// explanations attached for audit.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct OrderReject {
    pub code: RejectCode,
    pub message: String,
    pub adjustments: Vec<String>,
}

impl OrderReject {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            adjustments: Vec::new(),
        }
    }

    pub fn with_adjustments(mut self, adjustments: Vec<String>) -> Self {
        self.adjustments = adjustments;
        self
    }

    /// Reason string carried on emitted order updates and error events.
    pub fn reason(&self) -> String {
        if self.message.is_empty() {
            self.code.to_string()
        } else {
            format!("{}: {}", self.code, self.message)
        }
    }
}

impl From<RequestValidationError> for OrderReject {
    fn from(error: RequestValidationError) -> Self {
        OrderReject::new(RejectCode::InvalidRequest, error.to_string())
    }
}

impl From<SymbolError> for OrderReject {
    fn from(error: SymbolError) -> Self {
        OrderReject::new(RejectCode::InvalidRequest, error.to_string())
    }
}
