use crate::strategy::{
    Strategy, StrategyContext, StrategyError,
    params::{ParamKind, ParamSchema, ParamSet, ParamSpec, ParamValue},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vortex_data::event::{DataKind, MarketEvent};
use vortex_execution::order::{OrderKind, PlaceOrderRequest, StrategyId, TimeInForce};
use vortex_instrument::{Side, symbol::SymbolId, venue::Venue};

/// Buys a fixed quantity when the mid price crosses below a threshold, then
/// re-arms once the mid recovers above it.
#[derive(Debug)]
pub struct ThresholdCross {
    id: StrategyId,
    symbols: Vec<SymbolId>,
    buy_below: Decimal,
    qty: Decimal,
    armed: bool,
    signals_sent: u64,
}

#[derive(Debug, Deserialize, Serialize)]
struct ThresholdCrossState {
    armed: bool,
    signals_sent: u64,
}

impl ThresholdCross {
    pub const NAME: &'static str = "threshold";

    pub fn new(id: StrategyId, symbol: SymbolId, buy_below: Decimal, qty: Decimal) -> Self {
        Self {
            id,
            symbols: vec![symbol],
            buy_below,
            qty,
            armed: true,
            signals_sent: 0,
        }
    }

    /// Construct from a parameter set, falling back to defaults.
    pub fn from_params(
        id: StrategyId,
        symbol: SymbolId,
        params: &ParamSet,
    ) -> Result<Self, StrategyError> {
        let buy_below = params
            .decimal("buy_below")
            .ok_or_else(|| StrategyError::new("missing required parameter: buy_below"))?;
        let qty = params.decimal("qty").unwrap_or(Decimal::ONE);

        Ok(Self::new(id, symbol, buy_below, qty))
    }

    fn event_mid(event: &MarketEvent) -> Option<Decimal> {
        match &event.kind {
            DataKind::Trade(trade) => Some(trade.price),
            DataKind::Ticker(ticker) => Some((ticker.bid + ticker.ask) / Decimal::TWO),
            DataKind::Book(_) => None,
            DataKind::MarkPrice(mark) => Some(mark.price),
            _ => None,
        }
    }
}

impl Strategy for ThresholdCross {
    fn id(&self) -> &StrategyId {
        &self.id
    }

    fn symbols(&self) -> &[SymbolId] {
        &self.symbols
    }

    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new(vec![
            (
                "buy_below",
                ParamSpec::of(ParamKind::Decimal),
            ),
            (
                "qty",
                ParamSpec::decimal_range(Decimal::new(1, 4), Decimal::new(1_000, 0)),
            ),
        ])
    }

    fn parameters(&self) -> ParamSet {
        ParamSet::new(vec![
            ("buy_below", ParamValue::Decimal(self.buy_below)),
            ("qty", ParamValue::Decimal(self.qty)),
        ])
    }

    fn on_market(
        &mut self,
        event: &MarketEvent,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError> {
        // Prefer the local book mid where available
        let mid = ctx
            .books
            .find(event.venue, &event.symbol)
            .and_then(|book| book.read().book().and_then(|book| book.mid_price()))
            .or_else(|| Self::event_mid(event));

        let Some(mid) = mid else {
            return Ok(());
        };

        if self.armed && mid < self.buy_below {
            self.armed = false;
            self.signals_sent += 1;

            ctx.submit(PlaceOrderRequest::new(
                signal_cid(&self.id, self.signals_sent)?,
                event.symbol.clone(),
                Venue::Simulated,
                Side::Buy,
                OrderKind::Limit,
                self.qty,
                Some(mid),
                TimeInForce::Gtc,
                None,
                None,
            ));
        } else if !self.armed && mid > self.buy_below {
            self.armed = true;
        }

        Ok(())
    }

    fn on_parameters_changed(&mut self, params: &ParamSet) {
        if let Some(buy_below) = params.decimal("buy_below") {
            self.buy_below = buy_below;
        }
        if let Some(qty) = params.decimal("qty") {
            self.qty = qty;
        }
    }

    fn state_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(ThresholdCrossState {
            armed: self.armed,
            signals_sent: self.signals_sent,
        })
        .unwrap_or(serde_json::Value::Null)
    }

    fn restore_state(&mut self, state: &serde_json::Value) {
        if let Ok(state) = serde_json::from_value::<ThresholdCrossState>(state.clone()) {
            self.armed = state.armed;
            self.signals_sent = state.signals_sent;
        }
    }
}

/// Deterministic client order id for the nth signal of a strategy.
fn signal_cid(
    id: &StrategyId,
    sequence: u64,
) -> Result<vortex_execution::order::ClientOrderId, StrategyError> {
    vortex_execution::order::ClientOrderId::new(format!("{id}-sig-{sequence}"))
        .map_err(|error| StrategyError::new(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use vortex_data::books::map::OrderBookMap;
    use vortex_data::event::PublicTrade;
    use vortex_integration::channel::mpsc_unbounded;

    fn trade_event(price: Decimal) -> MarketEvent {
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
    fn test_signals_once_per_crossing() {
        let id = StrategyId::new("s1");
        let mut strategy = ThresholdCross::new(
            id.clone(),
            SymbolId::new("BTCUSDT").unwrap(),
            dec!(49_000),
            dec!(0.1),
        );
        let (tx, mut rx) = mpsc_unbounded();
        let books = OrderBookMap::default();

        let mut ctx = StrategyContext::new(Utc::now(), &books, &id, &tx);

        // Above threshold: no signal
        strategy.on_market(&trade_event(dec!(50_000)), &mut ctx).unwrap();
        assert!(rx.drain().is_empty());

        // Crossing below: one signal, tagged with the strategy id
        strategy.on_market(&trade_event(dec!(48_500)), &mut ctx).unwrap();
        let signals = rx.drain();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].strategy_id, Some(id.clone()));

        // Still below: disarmed, no further signal
        strategy.on_market(&trade_event(dec!(48_000)), &mut ctx).unwrap();
        assert!(rx.drain().is_empty());

        // Recovery re-arms
        strategy.on_market(&trade_event(dec!(49_500)), &mut ctx).unwrap();
        strategy.on_market(&trade_event(dec!(48_900)), &mut ctx).unwrap();
        assert_eq!(rx.drain().len(), 1);
    }
}
