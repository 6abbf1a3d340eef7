use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broad market regime classification, set by the operator or an external
/// monitor.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MarketCondition {
    #[default]
    Normal,
    Stressed,
    Crisis,
}

/// Configuration of the dynamic threshold multiplier curves.
///
/// Each curve is clamped piecewise-linear and monotone non-increasing:
/// exactly 1.0 at or below the `soft` knee, descending linearly to `floor`
/// at the `hard` knee, and `floor` beyond it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RiskAdjustConfig {
    /// Volatility percentile (0..=1) at which thresholds start tightening.
    pub vol_soft: Decimal,
    /// Volatility percentile at which the multiplier bottoms out.
    pub vol_hard: Decimal,
    /// Multiplier floor under extreme volatility.
    pub vol_floor: Decimal,

    /// Drawdown fraction at which thresholds start tightening.
    pub dd_soft: Decimal,
    /// Drawdown fraction at which the multiplier bottoms out.
    pub dd_hard: Decimal,
    /// Multiplier floor under deep drawdown.
    pub dd_floor: Decimal,

    /// Multiplier applied under [`MarketCondition::Stressed`].
    pub stressed_multiplier: Decimal,
    /// Multiplier applied under [`MarketCondition::Crisis`].
    pub crisis_multiplier: Decimal,
}

impl Default for RiskAdjustConfig {
    fn default() -> Self {
        Self {
            vol_soft: Decimal::new(80, 2),
            vol_hard: Decimal::new(99, 2),
            vol_floor: Decimal::new(25, 2),
            dd_soft: Decimal::new(5, 2),
            dd_hard: Decimal::new(20, 2),
            dd_floor: Decimal::new(30, 2),
            stressed_multiplier: Decimal::new(75, 2),
            crisis_multiplier: Decimal::new(25, 2),
        }
    }
}

/// An effective threshold together with the adjustment explanations applied
/// to its base value, attached to rejections for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effective {
    pub value: Decimal,
    pub adjustments: Vec<String>,
}

/// Computes effective risk thresholds from base limits and current
/// volatility / drawdown / market-condition observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdAdjuster {
    config: RiskAdjustConfig,
    vol_percentile: Decimal,
    condition: MarketCondition,
}

impl ThresholdAdjuster {
    pub fn new(config: RiskAdjustConfig) -> Self {
        Self {
            config,
            vol_percentile: Decimal::ZERO,
            condition: MarketCondition::Normal,
        }
    }

    pub fn set_vol_percentile(&mut self, percentile: Decimal) {
        self.vol_percentile = percentile.clamp(Decimal::ZERO, Decimal::ONE);
    }

    pub fn set_condition(&mut self, condition: MarketCondition) {
        self.condition = condition;
    }

    pub fn condition(&self) -> MarketCondition {
        self.condition
    }

    /// Multiplier derived from the current volatility percentile.
    pub fn vol_multiplier(&self) -> Decimal {
        descend(
            self.vol_percentile,
            self.config.vol_soft,
            self.config.vol_hard,
            self.config.vol_floor,
        )
    }

    /// Multiplier derived from the current drawdown fraction.
    pub fn dd_multiplier(&self, drawdown: Decimal) -> Decimal {
        descend(
            drawdown,
            self.config.dd_soft,
            self.config.dd_hard,
            self.config.dd_floor,
        )
    }

    /// Multiplier derived from the market condition classification.
    pub fn condition_multiplier(&self) -> Decimal {
        match self.condition {
            MarketCondition::Normal => Decimal::ONE,
            MarketCondition::Stressed => self.config.stressed_multiplier,
            MarketCondition::Crisis => self.config.crisis_multiplier,
        }
    }

    /// Effective threshold: `base × vol × drawdown × condition`, with an
    /// explanation string per non-unit multiplier.
    pub fn effective(&self, base: Decimal, drawdown: Decimal) -> Effective {
        let vol = self.vol_multiplier();
        let dd = self.dd_multiplier(drawdown);
        let condition = self.condition_multiplier();

        let mut adjustments = Vec::new();
        if vol != Decimal::ONE {
            adjustments.push(format!(
                "vol_multiplier={vol} (vol_percentile={})",
                self.vol_percentile
            ));
        }
        if dd != Decimal::ONE {
            adjustments.push(format!("dd_multiplier={dd} (drawdown={drawdown})"));
        }
        if condition != Decimal::ONE {
            adjustments.push(format!(
                "market_condition_multiplier={condition} ({:?})",
                self.condition
            ));
        }

        Effective {
            value: base * vol * dd * condition,
            adjustments,
        }
    }
}

impl Default for ThresholdAdjuster {
    fn default() -> Self {
        Self::new(RiskAdjustConfig::default())
    }
}

/// Clamped piecewise-linear descent from 1.0 at `soft` to `floor` at `hard`.
fn descend(x: Decimal, soft: Decimal, hard: Decimal, floor: Decimal) -> Decimal {
    if x <= soft {
        return Decimal::ONE;
    }
    if x >= hard {
        return floor;
    }

    Decimal::ONE - (Decimal::ONE - floor) * (x - soft) / (hard - soft)
}

/// Tracks account equity peak and current value to derive drawdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct DrawdownTracker {
    peak: Decimal,
    current: Decimal,
}

impl DrawdownTracker {
    pub fn update_equity(&mut self, equity: Decimal) {
        self.current = equity;
        if equity > self.peak {
            self.peak = equity;
        }
    }

    /// Drawdown from peak as a fraction of peak equity.
    pub fn drawdown_pct(&self) -> Decimal {
        if self.peak.is_zero() {
            return Decimal::ZERO;
        }
        ((self.peak - self.current) / self.peak).max(Decimal::ZERO)
    }
}
