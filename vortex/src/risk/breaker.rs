use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Operator directive for the account circuit breaker.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum BreakerCommand {
    Trip { reason: String },
    Reset,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RiskBreakerConfig {
    /// Rolling window over which realized losses accumulate.
    pub loss_window_secs: i64,
    /// Cumulative realized loss within the window that trips the breaker.
    pub loss_threshold: Decimal,
    /// Consecutive venue errors that trip the breaker.
    pub max_consecutive_venue_errors: u32,
}

impl Default for RiskBreakerConfig {
    fn default() -> Self {
        Self {
            loss_window_secs: 3_600,
            loss_threshold: Decimal::new(10_000, 0),
            max_consecutive_venue_errors: 5,
        }
    }
}

/// Account-level kill switch.
///
/// Trips automatically on cumulative rolling-window losses or consecutive
/// venue errors, or explicitly by operator command. While tripped, all new
/// orders reject and the strategy runtime is paused. Reset is explicit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskCircuitBreaker {
    config: RiskBreakerConfig,
    tripped: Option<String>,
    losses: VecDeque<(DateTime<Utc>, Decimal)>,
    consecutive_venue_errors: u32,
}

impl RiskCircuitBreaker {
    pub fn new(config: RiskBreakerConfig) -> Self {
        Self {
            config,
            tripped: None,
            losses: VecDeque::new(),
            consecutive_venue_errors: 0,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.is_some()
    }

    pub fn trip_reason(&self) -> Option<&str> {
        self.tripped.as_deref()
    }

    /// Operator trip.
    pub fn trip(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "circuit breaker tripped");
        self.tripped = Some(reason);
    }

    /// Explicit operator reset, clearing the loss window and error counter.
    pub fn reset(&mut self) {
        self.tripped = None;
        self.losses.clear();
        self.consecutive_venue_errors = 0;
    }

    /// Record realized PnL. Losses accumulate in the rolling window and trip
    /// the breaker once the threshold is exceeded.
    pub fn record_realized_pnl(&mut self, now: DateTime<Utc>, pnl: Decimal) {
        if pnl >= Decimal::ZERO {
            return;
        }

        self.losses.push_back((now, -pnl));
        self.evict_expired(now);

        let window_loss: Decimal = self.losses.iter().map(|(_, loss)| *loss).sum();
        if window_loss > self.config.loss_threshold && !self.is_tripped() {
            self.trip(format!(
                "rolling window loss {window_loss} exceeds threshold {}",
                self.config.loss_threshold
            ));
        }
    }

    /// Record a venue error; N consecutive errors trip the breaker.
    pub fn record_venue_error(&mut self) {
        self.consecutive_venue_errors += 1;

        if self.consecutive_venue_errors >= self.config.max_consecutive_venue_errors
            && !self.is_tripped()
        {
            self.trip(format!(
                "{} consecutive venue errors",
                self.consecutive_venue_errors
            ));
        }
    }

    pub fn record_venue_success(&mut self) {
        self.consecutive_venue_errors = 0;
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let cutoff = now - TimeDelta::seconds(self.config.loss_window_secs);
        while self
            .losses
            .front()
            .is_some_and(|(time, _)| *time < cutoff)
        {
            self.losses.pop_front();
        }
    }
}

impl Default for RiskCircuitBreaker {
    fn default() -> Self {
        Self::new(RiskBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trips_on_rolling_window_loss() {
        let mut breaker = RiskCircuitBreaker::new(RiskBreakerConfig {
            loss_window_secs: 60,
            loss_threshold: dec!(1_000),
            max_consecutive_venue_errors: 5,
        });
        let t0 = Utc::now();

        breaker.record_realized_pnl(t0, dec!(-600));
        assert!(!breaker.is_tripped());

        // Profit does not offset the loss window
        breaker.record_realized_pnl(t0, dec!(500));
        breaker.record_realized_pnl(t0, dec!(-500));
        assert!(breaker.is_tripped());
    }

    #[test]
    fn test_expired_losses_leave_the_window() {
        let mut breaker = RiskCircuitBreaker::new(RiskBreakerConfig {
            loss_window_secs: 60,
            loss_threshold: dec!(1_000),
            max_consecutive_venue_errors: 5,
        });
        let t0 = Utc::now();

        breaker.record_realized_pnl(t0, dec!(-600));
        breaker.record_realized_pnl(t0 + TimeDelta::seconds(120), dec!(-600));
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn test_trips_on_consecutive_venue_errors_and_resets() {
        let mut breaker = RiskCircuitBreaker::new(RiskBreakerConfig {
            loss_window_secs: 60,
            loss_threshold: dec!(1_000),
            max_consecutive_venue_errors: 3,
        });

        breaker.record_venue_error();
        breaker.record_venue_error();
        breaker.record_venue_success();
        breaker.record_venue_error();
        breaker.record_venue_error();
        assert!(!breaker.is_tripped());

        breaker.record_venue_error();
        assert!(breaker.is_tripped());

        breaker.reset();
        assert!(!breaker.is_tripped());
    }
}
