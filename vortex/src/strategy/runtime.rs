use crate::{
    control::StrategyInfo,
    strategy::{
        Strategy, StrategyContext, StrategyError, StrategyStatus,
        params::{ParamError, ParamSet},
    },
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, ToSmolStr};
use thiserror::Error;
use tracing::{error, info};
use vortex_data::{books::map::OrderBookMap, event::MarketEvent};
use vortex_execution::{
    order::{OrderStateRecord, PlaceOrderRequest, StrategyId},
    trade::Fill,
};
use vortex_integration::channel::{UnboundedRx, UnboundedTx, mpsc_unbounded};

/// Constructor for a named strategy kind, registered with the runtime.
pub type StrategyFactory =
    Box<dyn Fn(StrategyId, &ParamSet) -> Result<Box<dyn Strategy>, StrategyError> + Send>;

/// Errors produced by strategy lifecycle operations.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StrategyRuntimeError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(StrategyId),

    #[error("unknown strategy kind: {0}")]
    UnknownKind(SmolStr),

    #[error("strategy already loaded: {0}")]
    DuplicateId(StrategyId),

    #[error("invalid transition from {from} for strategy {id}")]
    InvalidTransition { id: StrategyId, from: StrategyStatus },

    #[error(transparent)]
    Params(#[from] ParamError),

    #[error(transparent)]
    Factory(#[from] StrategyError),
}

/// Persisted strategy state, carried inside engine snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StrategySnapshot {
    pub id: StrategyId,
    pub name: SmolStr,
    pub status: StrategyStatus,
    pub params: ParamSet,
    pub state: serde_json::Value,
}

/// Budget for a single strategy callback on the engine loop. Exceeding the
/// budget is reported as slow; repeated slow callbacks transition the
/// strategy to `Error`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SlowCallbackPolicy {
    pub budget_ms: u64,
    pub max_strikes: u32,
}

impl Default for SlowCallbackPolicy {
    fn default() -> Self {
        Self {
            budget_ms: 50,
            max_strikes: 3,
        }
    }
}

struct StrategyEntry {
    name: SmolStr,
    strategy: Box<dyn Strategy>,
    status: StrategyStatus,
    error: Option<String>,
    slow_strikes: u32,
}

impl std::fmt::Debug for StrategyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEntry")
            .field("name", &self.name)
            .field("id", &self.strategy.id())
            .field("status", &self.status)
            .field("error", &self.error)
            .finish()
    }
}

/// Outcome of dispatching an input to the hosted strategies.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Order signals emitted by strategies, already tagged with their ids.
    pub signals: Vec<PlaceOrderRequest>,
    /// Strategies transitioned to `Error` by this dispatch. The engine
    /// cancels their in-flight orders.
    pub errored: Vec<(StrategyId, String)>,
}

/// Hosts strategy instances, owns their lifecycle, and routes their order
/// signals onwards for risk gating.
pub struct StrategyRuntime {
    factories: FnvHashMap<SmolStr, StrategyFactory>,
    entries: IndexMap<StrategyId, StrategyEntry>,
    slow_policy: SlowCallbackPolicy,
    signal_tx: UnboundedTx<PlaceOrderRequest>,
    signal_rx: UnboundedRx<PlaceOrderRequest>,
}

impl std::fmt::Debug for StrategyRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRuntime")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .field("entries", &self.entries)
            .finish()
    }
}

impl StrategyRuntime {
    pub fn new() -> Self {
        Self::with_slow_policy(SlowCallbackPolicy::default())
    }

    pub fn with_slow_policy(slow_policy: SlowCallbackPolicy) -> Self {
        let (signal_tx, signal_rx) = mpsc_unbounded();
        Self {
            factories: FnvHashMap::default(),
            entries: IndexMap::new(),
            slow_policy,
            signal_tx,
            signal_rx,
        }
    }

    /// Register a named strategy kind.
    pub fn register_factory(&mut self, name: impl Into<SmolStr>, factory: StrategyFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiate and load a strategy.
    pub fn load(
        &mut self,
        name: &SmolStr,
        id: StrategyId,
        params: &ParamSet,
    ) -> Result<(), StrategyRuntimeError> {
        if self.entries.contains_key(&id) {
            return Err(StrategyRuntimeError::DuplicateId(id));
        }
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StrategyRuntimeError::UnknownKind(name.clone()))?;

        let strategy = factory(id.clone(), params)?;
        info!(strategy_id = %id, kind = %name, "strategy loaded");

        self.entries.insert(
            id,
            StrategyEntry {
                name: name.clone(),
                strategy,
                status: StrategyStatus::Loaded,
                error: None,
                slow_strikes: 0,
            },
        );
        Ok(())
    }

    pub fn start(&mut self, id: &StrategyId) -> Result<(), StrategyRuntimeError> {
        self.transition(id, StrategyStatus::Running, |from| {
            matches!(
                from,
                StrategyStatus::Loaded | StrategyStatus::Paused | StrategyStatus::Stopped
            )
        })
    }

    pub fn pause(&mut self, id: &StrategyId) -> Result<(), StrategyRuntimeError> {
        self.transition(id, StrategyStatus::Paused, |from| {
            from == StrategyStatus::Running
        })
    }

    pub fn resume(&mut self, id: &StrategyId) -> Result<(), StrategyRuntimeError> {
        self.transition(id, StrategyStatus::Running, |from| {
            from == StrategyStatus::Paused
        })
    }

    pub fn stop(&mut self, id: &StrategyId) -> Result<(), StrategyRuntimeError> {
        self.transition(id, StrategyStatus::Stopped, |from| {
            matches!(
                from,
                StrategyStatus::Running | StrategyStatus::Paused | StrategyStatus::Loaded
            )
        })
    }

    pub fn unload(&mut self, id: &StrategyId) -> Result<(), StrategyRuntimeError> {
        self.entries
            .shift_remove(id)
            .map(|_| info!(strategy_id = %id, "strategy unloaded"))
            .ok_or_else(|| StrategyRuntimeError::UnknownStrategy(id.clone()))
    }

    pub fn status(&self, id: &StrategyId) -> Option<StrategyStatus> {
        self.entries.get(id).map(|entry| entry.status)
    }

    pub fn list(&self) -> Vec<StrategyInfo> {
        self.entries
            .iter()
            .map(|(id, entry)| StrategyInfo {
                id: id.clone(),
                name: entry.name.clone(),
                status: entry.status.to_smolstr(),
            })
            .collect()
    }

    /// Pause every running strategy, returning the ids paused (used by the
    /// circuit breaker, which resumes exactly these on reset).
    pub fn pause_all(&mut self) -> Vec<StrategyId> {
        let mut paused = Vec::new();
        for (id, entry) in &mut self.entries {
            if entry.status == StrategyStatus::Running {
                entry.status = StrategyStatus::Paused;
                paused.push(id.clone());
            }
        }
        paused
    }

    /// Deliver a market event to running strategies that declared its
    /// symbol.
    pub fn dispatch_market(
        &mut self,
        event: &MarketEvent,
        books: &OrderBookMap,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for (id, entry) in &mut self.entries {
            if entry.status != StrategyStatus::Running {
                continue;
            }
            if !entry.strategy.symbols().contains(&event.symbol) {
                continue;
            }

            let mut ctx = StrategyContext::new(now, books, id, &self.signal_tx);
            let started = std::time::Instant::now();
            let result = entry.strategy.on_market(event, &mut ctx);
            Self::finish_callback(
                id,
                entry,
                result,
                started.elapsed(),
                self.slow_policy,
                &mut outcome,
            );
        }

        outcome.signals = self.signal_rx.drain();
        outcome
    }

    /// Deliver a fill to the strategy that originated the order.
    pub fn dispatch_fill(
        &mut self,
        strategy_id: &StrategyId,
        fill: &Fill,
        books: &OrderBookMap,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if let Some(entry) = self.entries.get_mut(strategy_id) {
            if matches!(entry.status, StrategyStatus::Running | StrategyStatus::Paused) {
                let mut ctx = StrategyContext::new(now, books, strategy_id, &self.signal_tx);
                let started = std::time::Instant::now();
                let result = entry.strategy.on_fill(fill, &mut ctx);
                Self::finish_callback(
                    strategy_id,
                    entry,
                    result,
                    started.elapsed(),
                    self.slow_policy,
                    &mut outcome,
                );
            }
        }

        outcome.signals = self.signal_rx.drain();
        outcome
    }

    /// Deliver an order update to the strategy that originated the order.
    pub fn dispatch_order_update(
        &mut self,
        strategy_id: &StrategyId,
        update: &OrderStateRecord,
        books: &OrderBookMap,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if let Some(entry) = self.entries.get_mut(strategy_id) {
            if matches!(entry.status, StrategyStatus::Running | StrategyStatus::Paused) {
                let mut ctx = StrategyContext::new(now, books, strategy_id, &self.signal_tx);
                let started = std::time::Instant::now();
                let result = entry.strategy.on_order_update(update, &mut ctx);
                Self::finish_callback(
                    strategy_id,
                    entry,
                    result,
                    started.elapsed(),
                    self.slow_policy,
                    &mut outcome,
                );
            }
        }

        outcome.signals = self.signal_rx.drain();
        outcome
    }

    /// Validate a parameter update against the strategy's schema, swap the
    /// merged set in, and notify the strategy.
    pub fn update_parameters(
        &mut self,
        id: &StrategyId,
        update: &ParamSet,
    ) -> Result<(), StrategyRuntimeError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StrategyRuntimeError::UnknownStrategy(id.clone()))?;

        entry.strategy.param_schema().validate(update)?;

        let merged = entry.strategy.parameters().merged_with(update);
        entry.strategy.on_parameters_changed(&merged);
        info!(strategy_id = %id, "strategy parameters updated");
        Ok(())
    }

    /// Persistable snapshots of all hosted strategies.
    pub fn snapshots(&self) -> Vec<StrategySnapshot> {
        self.entries
            .iter()
            .map(|(id, entry)| StrategySnapshot {
                id: id.clone(),
                name: entry.name.clone(),
                status: entry.status,
                params: entry.strategy.parameters(),
                state: entry.strategy.state_snapshot(),
            })
            .collect()
    }

    /// Rehydrate strategies from persisted snapshots via their registered
    /// factories. Unknown kinds are skipped with an error log.
    pub fn restore(&mut self, snapshots: Vec<StrategySnapshot>) {
        for snapshot in snapshots {
            match self.load(&snapshot.name, snapshot.id.clone(), &snapshot.params) {
                Ok(()) => {
                    let entry = self
                        .entries
                        .get_mut(&snapshot.id)
                        .expect("strategy loaded above");
                    entry.strategy.restore_state(&snapshot.state);
                    entry.status = snapshot.status;
                }
                Err(restore_error) => {
                    error!(
                        strategy_id = %snapshot.id,
                        %restore_error,
                        "failed to restore strategy from snapshot"
                    );
                }
            }
        }
    }

    fn transition(
        &mut self,
        id: &StrategyId,
        to: StrategyStatus,
        allowed_from: impl Fn(StrategyStatus) -> bool,
    ) -> Result<(), StrategyRuntimeError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StrategyRuntimeError::UnknownStrategy(id.clone()))?;

        if !allowed_from(entry.status) {
            return Err(StrategyRuntimeError::InvalidTransition {
                id: id.clone(),
                from: entry.status,
            });
        }

        info!(strategy_id = %id, from = %entry.status, to = %to, "strategy transition");
        entry.status = to;
        Ok(())
    }

    /// Post-callback bookkeeping: fail errored strategies, and track slow
    /// callbacks against the budget.
    fn finish_callback(
        id: &StrategyId,
        entry: &mut StrategyEntry,
        result: Result<(), StrategyError>,
        elapsed: std::time::Duration,
        policy: SlowCallbackPolicy,
        outcome: &mut DispatchOutcome,
    ) {
        if let Err(strategy_error) = result {
            Self::fail(id, entry, strategy_error, outcome);
            return;
        }

        if elapsed.as_millis() as u64 > policy.budget_ms {
            entry.slow_strikes += 1;
            tracing::warn!(
                strategy_id = %id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = policy.budget_ms,
                strikes = entry.slow_strikes,
                "slow strategy callback"
            );

            if entry.slow_strikes >= policy.max_strikes {
                Self::fail(
                    id,
                    entry,
                    StrategyError::new(format!(
                        "exceeded the {}ms callback budget {} times",
                        policy.budget_ms, entry.slow_strikes
                    )),
                    outcome,
                );
            }
        }
    }

    fn fail(
        id: &StrategyId,
        entry: &mut StrategyEntry,
        strategy_error: StrategyError,
        outcome: &mut DispatchOutcome,
    ) {
        error!(strategy_id = %id, %strategy_error, "strategy callback failed");
        entry.status = StrategyStatus::Error;
        entry.error = Some(strategy_error.0.clone());
        outcome.errored.push((id.clone(), strategy_error.0));
    }
}

impl Default for StrategyRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::builtin::ThresholdCross;
    use crate::strategy::params::ParamValue;
    use rust_decimal_macros::dec;
    use vortex_data::event::{DataKind, PublicTrade};
    use vortex_instrument::{Side, symbol::SymbolId, venue::Venue};

    fn runtime_with_threshold() -> StrategyRuntime {
        let mut runtime = StrategyRuntime::new();
        runtime.register_factory(
            ThresholdCross::NAME,
            Box::new(|id, params| {
                ThresholdCross::from_params(id, SymbolId::new("BTCUSDT").unwrap(), params)
                    .map(|strategy| Box::new(strategy) as Box<dyn Strategy>)
            }),
        );
        runtime
    }

    fn params() -> ParamSet {
        ParamSet::new(vec![
            ("buy_below", ParamValue::Decimal(dec!(49_000))),
            ("qty", ParamValue::Decimal(dec!(0.1))),
        ])
    }

    fn trade_event(price: rust_decimal::Decimal) -> MarketEvent {
        let now = Utc::now();
        MarketEvent::new(
            Venue::Simulated,
            SymbolId::new("BTCUSDT").unwrap(),
            now,
            now,
            DataKind::Trade(PublicTrade::new("t1".into(), price, dec!(1), Side::Sell)),
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut runtime = runtime_with_threshold();
        let id = StrategyId::new("s1");
        let name = SmolStr::new(ThresholdCross::NAME);

        runtime.load(&name, id.clone(), &params()).unwrap();
        assert_eq!(runtime.status(&id), Some(StrategyStatus::Loaded));

        // Pause before running is invalid
        assert!(matches!(
            runtime.pause(&id),
            Err(StrategyRuntimeError::InvalidTransition { .. })
        ));

        runtime.start(&id).unwrap();
        runtime.pause(&id).unwrap();
        runtime.resume(&id).unwrap();
        runtime.stop(&id).unwrap();
        runtime.unload(&id).unwrap();
        assert_eq!(runtime.status(&id), None);

        // Duplicate loads are rejected
        runtime.load(&name, id.clone(), &params()).unwrap();
        assert!(matches!(
            runtime.load(&name, id, &params()),
            Err(StrategyRuntimeError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_dispatch_routes_signals_only_from_running_strategies() {
        let mut runtime = runtime_with_threshold();
        let id = StrategyId::new("s1");
        let books = OrderBookMap::default();

        runtime
            .load(&SmolStr::new(ThresholdCross::NAME), id.clone(), &params())
            .unwrap();

        // Loaded but not running: no delivery
        let outcome = runtime.dispatch_market(&trade_event(dec!(48_000)), &books, Utc::now());
        assert!(outcome.signals.is_empty());

        runtime.start(&id).unwrap();
        let outcome = runtime.dispatch_market(&trade_event(dec!(48_000)), &books, Utc::now());
        assert_eq!(outcome.signals.len(), 1);
        assert_eq!(outcome.signals[0].strategy_id, Some(id));
    }

    #[test]
    fn test_parameter_update_validates_and_applies() {
        let mut runtime = runtime_with_threshold();
        let id = StrategyId::new("s1");
        runtime
            .load(&SmolStr::new(ThresholdCross::NAME), id.clone(), &params())
            .unwrap();

        // Out-of-range qty is rejected by the declared schema
        let invalid = ParamSet::new(vec![("qty", ParamValue::Decimal(dec!(100_000)))]);
        assert!(matches!(
            runtime.update_parameters(&id, &invalid),
            Err(StrategyRuntimeError::Params(_))
        ));

        let update = ParamSet::new(vec![("buy_below", ParamValue::Decimal(dec!(40_000)))]);
        runtime.update_parameters(&id, &update).unwrap();

        let snapshots = runtime.snapshots();
        assert_eq!(snapshots[0].params.decimal("buy_below"), Some(dec!(40_000)));
    }

    #[test]
    fn test_repeatedly_slow_callbacks_transition_to_error() {
        use crate::strategy::params::ParamSchema;

        struct Sleepy {
            id: StrategyId,
            symbols: Vec<SymbolId>,
        }

        impl Strategy for Sleepy {
            fn id(&self) -> &StrategyId {
                &self.id
            }
            fn symbols(&self) -> &[SymbolId] {
                &self.symbols
            }
            fn param_schema(&self) -> ParamSchema {
                ParamSchema::default()
            }
            fn parameters(&self) -> ParamSet {
                ParamSet::default()
            }
            fn on_market(
                &mut self,
                _event: &MarketEvent,
                _ctx: &mut crate::strategy::StrategyContext<'_>,
            ) -> Result<(), crate::strategy::StrategyError> {
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(())
            }
            fn on_parameters_changed(&mut self, _params: &ParamSet) {}
        }

        let mut runtime = StrategyRuntime::with_slow_policy(SlowCallbackPolicy {
            budget_ms: 1,
            max_strikes: 2,
        });
        runtime.register_factory(
            "sleepy",
            Box::new(|id, _params| {
                Ok(Box::new(Sleepy {
                    id,
                    symbols: vec![SymbolId::new("BTCUSDT").unwrap()],
                }) as Box<dyn Strategy>)
            }),
        );

        let id = StrategyId::new("s1");
        runtime
            .load(&SmolStr::new("sleepy"), id.clone(), &ParamSet::default())
            .unwrap();
        runtime.start(&id).unwrap();
        let books = OrderBookMap::default();

        let first = runtime.dispatch_market(&trade_event(dec!(1)), &books, Utc::now());
        assert!(first.errored.is_empty());
        assert_eq!(runtime.status(&id), Some(StrategyStatus::Running));

        let second = runtime.dispatch_market(&trade_event(dec!(1)), &books, Utc::now());
        assert_eq!(second.errored.len(), 1);
        assert_eq!(runtime.status(&id), Some(StrategyStatus::Error));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut runtime = runtime_with_threshold();
        let id = StrategyId::new("s1");
        runtime
            .load(&SmolStr::new(ThresholdCross::NAME), id.clone(), &params())
            .unwrap();
        runtime.start(&id).unwrap();

        let snapshots = runtime.snapshots();

        let mut restored = runtime_with_threshold();
        restored.restore(snapshots);
        assert_eq!(restored.status(&id), Some(StrategyStatus::Running));
    }
}
