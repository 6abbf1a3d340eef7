use chrono::{DateTime, Utc};
use derive_more::Constructor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection state of a venue market data link.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected but unhealthy, eg/ repeated sequence gaps or high latency.
    Degraded,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        write!(f, "{state}")
    }
}

/// Reconnection backoff policy for a venue connection.
#[derive(
    Debug, Copy, Clone, PartialEq, Deserialize, Serialize, Constructor,
)]
pub struct BackoffPolicy {
    /// Initial backoff millisecond duration after the first disconnection.
    ///
    /// This value then scales with the `backoff_multiplier` in the case of
    /// repeated failed reconnection attempts.
    pub backoff_ms_initial: u64,

    /// Scaling factor for the backoff duration in the case of repeated
    /// reconnection attempts.
    pub backoff_multiplier: u8,

    /// Maximum possible backoff duration between reconnection attempts.
    pub backoff_ms_max: u64,

    /// Uniform jitter fraction applied to each delay (0.1 => ±10%), keeping
    /// reconnection attempts from synchronising across venues.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            backoff_ms_initial: 250,
            backoff_multiplier: 2,
            backoff_ms_max: 30_000,
            jitter: 0.2,
        }
    }
}

/// Current backoff state derived from a [`BackoffPolicy`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackoffState {
    policy: BackoffPolicy,
    backoff_ms_current: u64,
}

impl From<BackoffPolicy> for BackoffState {
    fn from(policy: BackoffPolicy) -> Self {
        Self {
            backoff_ms_current: policy.backoff_ms_initial,
            policy,
        }
    }
}

impl BackoffState {
    /// Jittered delay to sleep before the next reconnection attempt, scaling
    /// the internal backoff for the attempt after.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.backoff_ms_current;
        self.multiply_backoff();

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let spread = (base as f64 * jitter).round() as i64;
        let offset = if spread > 0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0
        };

        Duration::from_millis(base.saturating_add_signed(offset))
    }

    /// Reset the backoff after a successful reconnection.
    pub fn reset(&mut self) {
        self.backoff_ms_current = self.policy.backoff_ms_initial;
    }

    fn multiply_backoff(&mut self) {
        let next = self
            .backoff_ms_current
            .saturating_mul(self.policy.backoff_multiplier as u64);
        self.backoff_ms_current = std::cmp::min(next, self.policy.backoff_ms_max);
    }
}

/// Per-venue stream quality metrics.
///
/// Latency is tracked as an exponentially weighted moving average of
/// `time_received - time_exchange`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct StreamQuality {
    pub messages: u64,
    pub gaps: u64,
    pub reconnects: u64,
    pub latency_ewma_ms: f64,
    pub time_first_message: Option<DateTime<Utc>>,
    pub time_last_message: Option<DateTime<Utc>>,
}

const LATENCY_EWMA_ALPHA: f64 = 0.1;

impl StreamQuality {
    pub fn on_message(&mut self, time_exchange: DateTime<Utc>, time_received: DateTime<Utc>) {
        self.messages += 1;
        self.time_first_message.get_or_insert(time_received);
        self.time_last_message = Some(time_received);

        let latency_ms = time_received
            .signed_duration_since(time_exchange)
            .num_milliseconds()
            .max(0) as f64;

        self.latency_ewma_ms = if self.messages == 1 {
            latency_ms
        } else {
            LATENCY_EWMA_ALPHA * latency_ms + (1.0 - LATENCY_EWMA_ALPHA) * self.latency_ewma_ms
        };
    }

    pub fn on_gap(&mut self) {
        self.gaps += 1;
    }

    pub fn on_reconnect(&mut self) {
        self.reconnects += 1;
    }

    /// Average message rate in messages per second over the observed window.
    pub fn message_rate(&self) -> f64 {
        match (self.time_first_message, self.time_last_message) {
            (Some(first), Some(last)) if last > first => {
                let window_secs =
                    last.signed_duration_since(first).num_milliseconds() as f64 / 1_000.0;
                self.messages as f64 / window_secs
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_backoff_scales_and_caps() {
        let mut state = BackoffState::from(BackoffPolicy {
            backoff_ms_initial: 100,
            backoff_multiplier: 4,
            backoff_ms_max: 1_000,
            jitter: 0.0,
        });

        assert_eq!(state.next_delay(), Duration::from_millis(100));
        assert_eq!(state.next_delay(), Duration::from_millis(400));
        assert_eq!(state.next_delay(), Duration::from_millis(1_000));
        assert_eq!(state.next_delay(), Duration::from_millis(1_000));

        state.reset();
        assert_eq!(state.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let mut state = BackoffState::from(BackoffPolicy {
            backoff_ms_initial: 1_000,
            backoff_multiplier: 2,
            backoff_ms_max: 10_000,
            jitter: 0.5,
        });

        for _ in 0..50 {
            state.reset();
            let delay = state.next_delay().as_millis() as u64;
            assert!((500..=1_500).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_stream_quality_latency_and_rate() {
        let mut quality = StreamQuality::default();
        let t0 = DateTime::<Utc>::MIN_UTC;

        quality.on_message(t0, t0 + TimeDelta::milliseconds(50));
        assert_eq!(quality.latency_ewma_ms, 50.0);

        quality.on_message(
            t0 + TimeDelta::seconds(1),
            t0 + TimeDelta::seconds(1) + TimeDelta::milliseconds(150),
        );
        assert_eq!(quality.messages, 2);
        // EWMA moves a tenth of the way towards the new observation
        assert!((quality.latency_ewma_ms - 60.0).abs() < 1e-9);
        assert!(quality.message_rate() > 0.0);
    }
}
