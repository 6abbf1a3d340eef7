use crate::{
    error::{OrderReject, RejectCode},
    risk::{
        adjust::{DrawdownTracker, ThresholdAdjuster},
        breaker::RiskCircuitBreaker,
        rules::{RuleContext, RuleSet},
    },
};
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vortex_execution::order::{OrderKind, PlaceOrderRequest};
use vortex_instrument::{Side, symbol::SymbolId};

/// Dynamic threshold multiplier curves and the drawdown tracker.
pub mod adjust;

/// The account circuit breaker (kill switch).
pub mod breaker;

/// User-defined composite rule evaluation.
pub mod rules;

/// Base pre-trade limits. Effective limits are derived by multiplying with
/// the dynamic adjustment curves in [`adjust`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RiskLimits {
    pub max_order_notional: Decimal,
    pub max_position_per_symbol: Decimal,
    pub max_leverage: Decimal,
    /// Maximum drawdown as a fraction of peak equity.
    pub max_daily_loss_pct: Decimal,
    /// Maximum relative deviation of a limit price from the reference price.
    pub max_price_deviation: Decimal,
    /// Reference prices per symbol for price sanity checks; falls back to
    /// the live mid price where absent.
    pub reference_prices: FnvHashMap<SymbolId, Decimal>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_order_notional: Decimal::new(100_000, 0),
            max_position_per_symbol: Decimal::new(10, 0),
            max_leverage: Decimal::new(5, 0),
            max_daily_loss_pct: Decimal::new(10, 2),
            max_price_deviation: Decimal::new(10, 2),
            reference_prices: FnvHashMap::default(),
        }
    }
}

/// Account and market observations required by the pre-trade checks,
/// assembled by the engine from its state and books.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskContext {
    pub mid_price: Option<Decimal>,
    /// Current signed position size for the order's symbol.
    pub position_size: Decimal,
    pub equity: Decimal,
    /// Gross open position notional across all symbols.
    pub total_notional: Decimal,
}

/// Pre-trade gate and ongoing risk monitor.
#[derive(Debug, Default)]
pub struct RiskEngine {
    pub limits: RiskLimits,
    pub adjuster: ThresholdAdjuster,
    pub drawdown: DrawdownTracker,
    pub rules: RuleSet,
    pub breaker: RiskCircuitBreaker,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            ..Default::default()
        }
    }

    /// Update the reference price used for price sanity checks.
    pub fn update_reference_price(&mut self, symbol: &SymbolId, price: Decimal) {
        self.limits.reference_prices.insert(symbol.clone(), price);
    }

    /// Observe account equity after a mutation, feeding drawdown tracking.
    pub fn observe_equity(&mut self, equity: Decimal) {
        self.drawdown.update_equity(equity);
    }

    /// Pre-trade checks in fixed order, short-circuiting on the first
    /// rejection. Every rejection carries a stable code and the dynamic
    /// adjustment explanations applied to the violated threshold.
    pub fn pre_trade(
        &self,
        request: &PlaceOrderRequest,
        ctx: &RiskContext,
    ) -> Result<(), OrderReject> {
        // 1. Kill switch
        if self.breaker.is_tripped() {
            return Err(OrderReject::new(
                RejectCode::CircuitBreaker,
                self.breaker.trip_reason().unwrap_or_default(),
            ));
        }

        let drawdown = self.drawdown.drawdown_pct();
        let reference_price = self.reference_price(request, ctx);
        let notional = self.notional(request, ctx);

        // 2. Notional cap
        if let Some(notional) = notional {
            let effective = self
                .adjuster
                .effective(self.limits.max_order_notional, drawdown);
            if notional > effective.value {
                return Err(OrderReject::new(
                    RejectCode::NotionalCap,
                    format!(
                        "order notional {notional} exceeds effective cap {}",
                        effective.value
                    ),
                )
                .with_adjustments(effective.adjustments));
            }
        }

        // 3. Per-symbol position cap on the projected post-fill size
        let signed_qty = match request.side {
            Side::Buy => request.qty,
            Side::Sell => -request.qty,
        };
        let projected = (ctx.position_size + signed_qty).abs();
        let effective = self
            .adjuster
            .effective(self.limits.max_position_per_symbol, drawdown);
        if projected > effective.value {
            return Err(OrderReject::new(
                RejectCode::PositionCap,
                format!(
                    "projected position {projected} exceeds effective cap {}",
                    effective.value
                ),
            )
            .with_adjustments(effective.adjustments));
        }

        // 4. Leverage cap
        if let Some(notional) = notional {
            let effective = self.adjuster.effective(self.limits.max_leverage, drawdown);
            if ctx.equity <= Decimal::ZERO {
                return Err(OrderReject::new(
                    RejectCode::LeverageCap,
                    "equity is not positive",
                ));
            }
            let projected_leverage = (ctx.total_notional + notional) / ctx.equity;
            if projected_leverage > effective.value {
                return Err(OrderReject::new(
                    RejectCode::LeverageCap,
                    format!(
                        "projected leverage {projected_leverage} exceeds effective cap {}",
                        effective.value
                    ),
                )
                .with_adjustments(effective.adjustments));
            }
        }

        // 5. Price sanity (limit orders)
        if request.kind == OrderKind::Limit {
            if let (Some(price), Some(reference)) = (request.price, reference_price) {
                let deviation = (price - reference).abs() / reference;
                if deviation > self.limits.max_price_deviation {
                    return Err(OrderReject::new(
                        RejectCode::PriceDeviation,
                        format!(
                            "limit price {price} deviates {deviation} from reference {reference}"
                        ),
                    ));
                }
            }
        }

        // 6. Daily loss
        let effective = self
            .adjuster
            .effective(self.limits.max_daily_loss_pct, drawdown);
        if drawdown > effective.value {
            return Err(OrderReject::new(
                RejectCode::DailyLoss,
                format!(
                    "drawdown {drawdown} exceeds effective limit {}",
                    effective.value
                ),
            )
            .with_adjustments(effective.adjustments));
        }

        // 7. User-defined rules
        let rule_ctx = RuleContext {
            notional,
            position_size: ctx.position_size,
            mid_price: ctx.mid_price,
        };
        if let Some(rule) = self.rules.evaluate(request, &rule_ctx) {
            return Err(OrderReject::new(
                RejectCode::RuleRejected,
                format!("rule matched: {rule}"),
            ));
        }

        Ok(())
    }

    fn reference_price(&self, request: &PlaceOrderRequest, ctx: &RiskContext) -> Option<Decimal> {
        self.limits
            .reference_prices
            .get(&request.symbol)
            .copied()
            .or(ctx.mid_price)
    }

    fn notional(&self, request: &PlaceOrderRequest, ctx: &RiskContext) -> Option<Decimal> {
        request
            .price
            .or(ctx.mid_price)
            .or_else(|| self.limits.reference_prices.get(&request.symbol).copied())
            .map(|price| request.qty * price)
    }
}
