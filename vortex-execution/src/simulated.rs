use crate::order::{OrderKind, PlaceOrderRequest};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vortex_instrument::Side;

/// Configuration of the in-process simulated venue fill model.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulatedExecutionConfig {
    /// Simulated round-trip latency between acceptance and fill.
    pub latency_ms: u64,
    /// Adverse slippage applied to market orders, in basis points.
    pub slippage_bps: i64,
    /// Taker fees, in basis points of fill notional.
    pub fees_bps: i64,
}

impl Default for SimulatedExecutionConfig {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            slippage_bps: 5,
            fees_bps: 0,
        }
    }
}

/// Fill model of the simulated venue.
///
/// Every order admitted by the risk engine is accepted and scheduled to fill
/// in full after `latency_ms`: limit orders at their limit price, market
/// orders at the adversely slipped touch. The engine's due-fill timer drives
/// collection.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct SimulatedExecution {
    pub config: SimulatedExecutionConfig,
}

impl SimulatedExecution {
    pub fn new(config: SimulatedExecutionConfig) -> Self {
        Self { config }
    }

    /// Time at which an order accepted at `now` becomes due to fill.
    pub fn due_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + TimeDelta::milliseconds(self.config.latency_ms as i64)
    }

    /// Price the order will fill at, given the top-of-book at fill time.
    ///
    /// Returns `None` for a market order with no usable touch price.
    pub fn fill_price(
        &self,
        request: &PlaceOrderRequest,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
    ) -> Option<Decimal> {
        match request.kind {
            OrderKind::Limit => request.price,
            OrderKind::Market => match request.side {
                Side::Buy => best_ask.map(|ask| ask * (Decimal::ONE + self.slippage())),
                Side::Sell => best_bid.map(|bid| bid * (Decimal::ONE - self.slippage())),
            },
        }
    }

    /// Worst-case quote cost of a market buy, used to reserve against the
    /// order before its fill price is known.
    pub fn adverse_buy_estimate(&self, qty: Decimal, best_ask: Decimal) -> Decimal {
        qty * best_ask * (Decimal::ONE + self.slippage())
    }

    /// Fees charged on the provided fill notional.
    pub fn fees(&self, notional: Decimal) -> Decimal {
        notional * Decimal::new(self.config.fees_bps, 4)
    }

    fn slippage(&self) -> Decimal {
        Decimal::new(self.config.slippage_bps, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{ClientOrderId, TimeInForce};
    use rust_decimal_macros::dec;
    use vortex_instrument::{symbol::SymbolId, venue::Venue};

    fn request(side: Side, kind: OrderKind, price: Option<Decimal>) -> PlaceOrderRequest {
        PlaceOrderRequest::new(
            ClientOrderId::new("c1").unwrap(),
            SymbolId::new("BTCUSDT").unwrap(),
            Venue::Simulated,
            side,
            kind,
            dec!(2),
            price,
            TimeInForce::Gtc,
            None,
            None,
        )
    }

    #[test]
    fn test_limit_orders_fill_at_limit_price() {
        let sim = SimulatedExecution::default();
        let request = request(Side::Buy, OrderKind::Limit, Some(dec!(49_000)));

        assert_eq!(
            sim.fill_price(&request, Some(dec!(49_990)), Some(dec!(50_010))),
            Some(dec!(49_000))
        );
    }

    #[test]
    fn test_market_orders_fill_at_adverse_touch() {
        let sim = SimulatedExecution::new(SimulatedExecutionConfig {
            latency_ms: 0,
            slippage_bps: 10,
            fees_bps: 0,
        });

        let buy = request(Side::Buy, OrderKind::Market, None);
        assert_eq!(
            sim.fill_price(&buy, Some(dec!(99)), Some(dec!(100))),
            Some(dec!(100.100))
        );

        let sell = request(Side::Sell, OrderKind::Market, None);
        assert_eq!(
            sim.fill_price(&sell, Some(dec!(100)), Some(dec!(101))),
            Some(dec!(99.900))
        );

        // No touch, no fill price
        assert_eq!(sim.fill_price(&buy, Some(dec!(99)), None), None);
    }

    #[test]
    fn test_fees_fixed_bps_of_notional() {
        let sim = SimulatedExecution::new(SimulatedExecutionConfig {
            latency_ms: 0,
            slippage_bps: 0,
            fees_bps: 10,
        });
        assert_eq!(sim.fees(dec!(10_000)), dec!(10.0000));
        assert_eq!(SimulatedExecution::default().fees(dec!(10_000)), dec!(0));
    }
}
