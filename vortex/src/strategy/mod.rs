use crate::strategy::params::{ParamSchema, ParamSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use vortex_data::{books::map::OrderBookMap, event::MarketEvent};
use vortex_execution::{
    order::{OrderStateRecord, PlaceOrderRequest, StrategyId},
    trade::Fill,
};
use vortex_instrument::symbol::SymbolId;
use vortex_integration::channel::{Tx, UnboundedTx};

/// A built-in threshold-crossing strategy.
pub mod builtin;

/// Typed strategy parameters and update validation.
pub mod params;

/// The strategy registry, lifecycle management and signal routing.
pub mod runtime;

/// Lifecycle status of a hosted strategy.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Loaded,
    Running,
    Paused,
    Stopped,
    Error,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            StrategyStatus::Loaded => "loaded",
            StrategyStatus::Running => "running",
            StrategyStatus::Paused => "paused",
            StrategyStatus::Stopped => "stopped",
            StrategyStatus::Error => "error",
        };
        write!(f, "{status}")
    }
}

/// Error raised by a strategy callback. The runtime transitions the raising
/// strategy to [`StrategyStatus::Error`]; the engine does not crash.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("strategy error: {0}")]
pub struct StrategyError(pub String);

impl StrategyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Execution context handed to strategy callbacks.
///
/// Strategies emit orders by submitting [`PlaceOrderRequest`]s to the signal
/// channel; every signal is tagged with the strategy's id and risk-gated
/// before reaching any venue. The order book handle is non-owning: the
/// runtime owns strategies and outlives them.
#[derive(Debug)]
pub struct StrategyContext<'a> {
    pub now: DateTime<Utc>,
    pub books: &'a OrderBookMap,
    strategy_id: &'a StrategyId,
    signals: &'a UnboundedTx<PlaceOrderRequest>,
}

impl<'a> StrategyContext<'a> {
    pub(crate) fn new(
        now: DateTime<Utc>,
        books: &'a OrderBookMap,
        strategy_id: &'a StrategyId,
        signals: &'a UnboundedTx<PlaceOrderRequest>,
    ) -> Self {
        Self {
            now,
            books,
            strategy_id,
            signals,
        }
    }

    /// Submit an order signal, tagged with this strategy's id.
    pub fn submit(&self, mut request: PlaceOrderRequest) {
        request.strategy_id = Some(self.strategy_id.clone());
        if self.signals.send(request).is_err() {
            warn!(strategy_id = %self.strategy_id, "strategy signal channel dropped");
        }
    }
}

/// A hosted trading strategy.
///
/// Callbacks run on the engine loop and must not block; anything slow
/// belongs on the I/O executor. A callback returning `Err` transitions the
/// strategy to `Error` and cancels its in-flight orders.
pub trait Strategy: Send {
    fn id(&self) -> &StrategyId;

    /// Symbols this strategy wants market events for.
    fn symbols(&self) -> &[SymbolId];

    /// Declared parameter schema, validated before any hot update.
    fn param_schema(&self) -> ParamSchema;

    /// Current parameter values.
    fn parameters(&self) -> ParamSet;

    fn on_market(
        &mut self,
        event: &MarketEvent,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError>;

    fn on_fill(&mut self, _fill: &Fill, _ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_order_update(
        &mut self,
        _update: &OrderStateRecord,
        _ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    /// Invoked after a validated parameter update has been swapped in.
    fn on_parameters_changed(&mut self, params: &ParamSet);

    /// Opaque state persisted into engine snapshots.
    fn state_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Rehydrate opaque state from a snapshot.
    fn restore_state(&mut self, _state: &serde_json::Value) {}
}
