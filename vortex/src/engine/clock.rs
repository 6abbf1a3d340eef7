use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{ops::Add, sync::Arc};

/// Defines how the engine determines the current time.
///
/// Generally an engine will use a:
/// * [`LiveClock`] for live-trading.
/// * [`HistoricalClock`] when driven by a backtest data source.
pub trait EngineClock {
    fn time(&self) -> DateTime<Utc>;

    /// Observe an event timestamp, allowing historical clocks to advance.
    fn advance_to(&self, _time: DateTime<Utc>) {}
}

/// Live clock using `Utc::now()`.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize,
)]
pub struct LiveClock;

impl EngineClock for LiveClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Historical clock using processed event timestamps to estimate the current
/// historical time, so a backtest data source can drive the engine with
/// approximately correct timestamps.
#[derive(Debug, Clone)]
pub struct HistoricalClock {
    inner: Arc<RwLock<HistoricalClockInner>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct HistoricalClockInner {
    time_event_last: DateTime<Utc>,
    time_live_last_event: DateTime<Utc>,
}

impl HistoricalClock {
    /// Construct a new `HistoricalClock` seeded with the provided historical
    /// time.
    pub fn new(time_seed: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HistoricalClockInner {
                time_event_last: time_seed,
                time_live_last_event: Utc::now(),
            })),
        }
    }
}

impl EngineClock for HistoricalClock {
    fn time(&self) -> DateTime<Utc> {
        let lock = self.inner.read();
        let time_event_last = lock.time_event_last;
        let time_live_last_event = lock.time_live_last_event;
        drop(lock);

        let delta_since_last_event = Utc::now().signed_duration_since(time_live_last_event);

        // Only add the delta if it's positive to handle out of order updates
        match delta_since_last_event {
            delta if delta.num_milliseconds() >= 0 => time_event_last.add(delta),
            _ => time_event_last,
        }
    }

    fn advance_to(&self, time: DateTime<Utc>) {
        let mut lock = self.inner.write();
        if time >= lock.time_event_last {
            lock.time_event_last = time;
            lock.time_live_last_event = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_historical_clock_ignores_out_of_order_timestamps() {
        let time_base = DateTime::<Utc>::MIN_UTC;
        let clock = HistoricalClock::new(time_base + TimeDelta::seconds(10));

        clock.advance_to(time_base + TimeDelta::seconds(5));
        assert!(clock.time() >= time_base + TimeDelta::seconds(10));

        clock.advance_to(time_base + TimeDelta::seconds(20));
        assert!(clock.time() >= time_base + TimeDelta::seconds(20));
    }
}
