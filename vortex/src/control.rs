use serde::Serialize;
use smol_str::SmolStr;
use vortex_data::connection::ConnectionState;
use vortex_execution::order::StrategyId;
use vortex_instrument::venue::Venue;
use vortex_integration::channel::UnboundedTx;

/// Typed request from the HTTP gateway into the core (service mode).
///
/// The gateway owns HTTP parsing and status mapping; the core only consumes
/// these typed requests and replies on the carried channel.
#[derive(Debug)]
pub struct ControlRequest {
    pub kind: ControlRequestKind,
    pub reply: UnboundedTx<ControlResponse>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlRequestKind {
    Status,
    Health,
    /// Enable trading.
    Start,
    /// Disable trading.
    Stop,
    ListStrategies,
    GetStrategy(StrategyId),
    StartStrategy(StrategyId),
    StopStrategy(StrategyId),
}

/// Serializable response to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResponse {
    Status(EngineStatus),
    Health { healthy: bool },
    Ack,
    Strategies(Vec<StrategyInfo>),
    Strategy(StrategyInfo),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub trading_enabled: bool,
    pub breaker_tripped: bool,
    pub pending_orders: usize,
    pub events_processed: u64,
    pub venues: Vec<VenueStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VenueStatus {
    pub venue: Venue,
    pub connection: ConnectionState,
    pub messages: u64,
    pub gaps: u64,
    pub reconnects: u64,
    pub latency_ewma_ms: f64,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct StrategyInfo {
    pub id: StrategyId,
    pub name: SmolStr,
    pub status: SmolStr,
}
