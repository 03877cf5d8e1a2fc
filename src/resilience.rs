// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience primitives: retry backoff, rate limiting, bulkhead.
//!
//! The upstream client retries connects with exponential backoff; the
//! reconciliation engine rate-limits repair requests through a shared
//! [`RateLimiter`]; the streaming endpoint bounds concurrent subscriber
//! sessions with a [`Bulkhead`].

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Patient schedule for first connect at process start.
    pub fn startup() -> RetryConfig {
        RetryConfig {
            max_attempts: 30,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
        }
    }

    /// Endless schedule for long-running reconnect loops.
    pub fn daemon() -> RetryConfig {
        RetryConfig {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    pub fn for_testing() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(62);
        let factor = self.multiplier.powi(exp as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Process-wide rate limiter over governor's token bucket.
pub struct RateLimiter {
    inner: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    per_second: u32,
}

impl RateLimiter {
    /// `per_second` must be positive; a zero rate is a config error upstream.
    pub fn new(per_second: u32) -> RateLimiter {
        let rate = NonZeroU32::new(per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(rate);
        RateLimiter {
            inner: GovLimiter::direct(quota),
            per_second: per_second.max(1),
        }
    }

    /// Wait until a permit is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Take a permit without waiting; false when exhausted.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }

    pub fn per_second(&self) -> u32 {
        self.per_second
    }
}

/// Caps concurrent sessions; rejects instead of queueing unboundedly.
#[derive(Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("bulkhead full: {capacity} sessions already active")]
pub struct BulkheadFull {
    pub capacity: usize,
}

impl Bulkhead {
    pub fn new(capacity: usize) -> Bulkhead {
        Bulkhead {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => Err(BulkheadFull {
                capacity: self.capacity,
            }),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
