use crate::{
    balance::AssetBalance,
    client::{ExecutionClient, ExecutionReport, UserEvent},
    error::ExecutionError,
    order::{ClientOrderId, OrderStatus, PlaceOrderRequest},
    reconcile::ReconcileOrder,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};
use vortex_instrument::venue::Venue;

/// Simple token bucket rate limiter allowing `capacity` operations every
/// `interval`, refilled in full at each interval boundary.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<tokio::sync::Mutex<RateLimiterInner>>,
}

#[derive(Debug)]
struct RateLimiterInner {
    capacity: u32,
    tokens: u32,
    interval: Duration,
    last_refill: Instant,
}

impl RateLimiter {
    /// Construct a new [`RateLimiter`] allowing `capacity` operations every
    /// `interval`.
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(RateLimiterInner {
                capacity,
                tokens: capacity,
                interval,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Acquire a permit, sleeping until the next refill if the bucket is
    /// empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                inner.refill(Instant::now());

                if inner.tokens > 0 {
                    inner.tokens -= 1;
                    return;
                }

                inner
                    .interval
                    .saturating_sub(inner.last_refill.elapsed())
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Acquire a permit without waiting, returning false if exhausted.
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.refill(Instant::now());

        if inner.tokens > 0 {
            inner.tokens -= 1;
            true
        } else {
            false
        }
    }
}

impl RateLimiterInner {
    fn refill(&mut self, now: Instant) {
        if now.duration_since(self.last_refill) >= self.interval {
            self.tokens = self.capacity;
            self.last_refill = now;
        }
    }
}

/// Exponential backoff retry policy for transient venue errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms_initial: u64,
    pub backoff_multiplier: u8,
    pub backoff_ms_max: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms_initial: 100,
            backoff_multiplier: 2,
            backoff_ms_max: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying on [`ExecutionError::is_transient`] failures with
    /// exponential backoff. Permanent errors propagate immediately.
    pub async fn retry<F, Fut, T>(&self, mut op: F) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let mut backoff_ms = self.backoff_ms_initial;
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    debug!(attempt, %error, backoff_ms, "transient venue error - retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = std::cmp::min(
                        backoff_ms.saturating_mul(self.backoff_multiplier as u64),
                        self.backoff_ms_max,
                    );
                }
                Err(error) => return Err(error),
            }
        }

        unreachable!("retry loop returns on final attempt")
    }
}

/// Circuit breaker state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BreakerState {
    /// Requests flow; consecutive failures are counted.
    Closed,
    /// Requests rejected until the cool-down expires.
    Open,
    /// Cool-down expired; requests probe the venue again.
    HalfOpen,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures after which the breaker opens.
    pub failure_threshold: u32,
    /// Cool-down before an open breaker transitions to half-open.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 10_000,
        }
    }
}

#[derive(Debug)]
enum BreakerInner {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Per-adapter circuit breaker: opens after N consecutive venue failures,
/// transitions Open → HalfOpen after the cool-down, and closes again on the
/// first half-open success.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock() {
            BreakerInner::Closed { .. } => BreakerState::Closed,
            BreakerInner::Open { .. } => BreakerState::Open,
            BreakerInner::HalfOpen => BreakerState::HalfOpen,
        }
    }

    pub fn try_acquire(&self) -> Result<(), ExecutionError> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<(), ExecutionError> {
        let mut inner = self.inner.lock();

        match *inner {
            BreakerInner::Closed { .. } | BreakerInner::HalfOpen => Ok(()),
            BreakerInner::Open { until } if now >= until => {
                *inner = BreakerInner::HalfOpen;
                Ok(())
            }
            BreakerInner::Open { .. } => Err(ExecutionError::CircuitOpen),
        }
    }

    pub fn on_success(&self) {
        *self.inner.lock() = BreakerInner::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now())
    }

    pub fn on_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let cooldown = Duration::from_millis(self.config.cooldown_ms);

        match *inner {
            BreakerInner::Closed {
                consecutive_failures,
            } => {
                let consecutive_failures = consecutive_failures + 1;
                if consecutive_failures >= self.config.failure_threshold {
                    warn!(consecutive_failures, "circuit breaker opening");
                    *inner = BreakerInner::Open {
                        until: now + cooldown,
                    };
                } else {
                    *inner = BreakerInner::Closed {
                        consecutive_failures,
                    };
                }
            }
            // A half-open probe failure re-opens immediately
            BreakerInner::HalfOpen => {
                warn!("circuit breaker half-open probe failed - re-opening");
                *inner = BreakerInner::Open {
                    until: now + cooldown,
                };
            }
            BreakerInner::Open { .. } => {}
        }
    }
}

/// [`ExecutionClient`] wrapper composing the resilient pattern every live
/// adapter carries: rate limiting, transient-error retry and circuit
/// breaking.
#[derive(Debug)]
pub struct ResilientClient<Client> {
    client: Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl<Client> ResilientClient<Client>
where
    Client: ExecutionClient,
{
    pub fn new(
        client: Client,
        limiter: RateLimiter,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            client,
            limiter,
            retry,
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<F, Fut, T>(&self, op: F) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        self.breaker.try_acquire()?;
        self.limiter.acquire().await;

        match self.retry.retry(op).await {
            Ok(value) => {
                self.breaker.on_success();
                Ok(value)
            }
            Err(error) => {
                self.breaker.on_failure();
                Err(error)
            }
        }
    }
}

#[async_trait]
impl<Client> ExecutionClient for ResilientClient<Client>
where
    Client: ExecutionClient,
{
    fn venue(&self) -> Venue {
        self.client.venue()
    }

    async fn place(
        &self,
        request: &PlaceOrderRequest,
        deadline_ms: u64,
    ) -> Result<ExecutionReport, ExecutionError> {
        self.guarded(|| self.client.place(request, deadline_ms))
            .await
    }

    async fn cancel(
        &self,
        cid: &ClientOrderId,
        deadline_ms: u64,
    ) -> Result<ExecutionReport, ExecutionError> {
        self.guarded(|| self.client.cancel(cid, deadline_ms)).await
    }

    async fn query(&self, cid: &ClientOrderId) -> Result<OrderStatus, ExecutionError> {
        self.guarded(|| self.client.query(cid)).await
    }

    fn user_events(&self) -> BoxStream<'static, UserEvent> {
        self.client.user_events()
    }

    async fn open_orders(&self) -> Result<Vec<ReconcileOrder>, ExecutionError> {
        self.guarded(|| self.client.open_orders()).await
    }

    async fn balances(&self) -> Result<Vec<AssetBalance>, ExecutionError> {
        self.guarded(|| self.client.balances()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result = policy
            .retry(|| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        Err(ExecutionError::Transient("reset".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_retry_propagates_permanent_errors_without_retrying() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<(), _> = policy
            .retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ExecutionError::Permanent("bad request".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_breaker_opens_after_threshold_and_half_opens_after_cooldown() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 1_000,
        });
        let t0 = Instant::now();

        breaker.on_failure_at(t0);
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.on_failure_at(t0);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(
            breaker.try_acquire_at(t0),
            Err(ExecutionError::CircuitOpen)
        );

        // Cool-down expiry transitions to half-open and admits a probe
        assert!(breaker
            .try_acquire_at(t0 + Duration::from_millis(1_001))
            .is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Probe success closes
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_breaker_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 1_000,
        });
        let t0 = Instant::now();

        breaker.on_failure_at(t0);
        assert!(breaker
            .try_acquire_at(t0 + Duration::from_millis(1_500))
            .is_ok());

        breaker.on_failure_at(t0 + Duration::from_millis(1_500));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_rate_limiter_exhausts_and_refills() {
        let limiter = RateLimiter::new(2, Duration::from_millis(10));

        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(limiter.try_acquire().await);
    }
}
