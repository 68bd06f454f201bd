//! Per-instance refresh rate limiting
//!
//! Token bucket tracked as a theoretical arrival time, so waits are exact
//! multiples of the interval and work under a paused tokio clock.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Refresh rate limit of one instance cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Refreshes allowed back to back
    pub burst: u32,
    /// Time to earn one more refresh
    pub interval: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            burst: 2,
            interval: Duration::from_secs(30),
        }
    }
}

impl RateLimit {
    /// Create a limit of `burst` back-to-back refreshes, then one per `interval`
    pub fn new(burst: u32, interval: Duration) -> Self {
        Self { burst, interval }
    }

    /// No limit at all
    pub fn unlimited() -> Self {
        Self {
            burst: 1,
            interval: Duration::ZERO,
        }
    }

    fn is_unlimited(&self) -> bool {
        self.interval.is_zero()
    }
}

/// Async token bucket
#[derive(Debug)]
pub(crate) struct RateLimiter {
    limit: RateLimit,
    // Time at which the bucket would be full again
    tat: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub(crate) fn new(limit: RateLimit) -> Self {
        Self {
            limit: RateLimit {
                burst: limit.burst.max(1),
                interval: limit.interval,
            },
            tat: Mutex::new(None),
        }
    }

    /// Take a token, returning how long the caller must wait before using it
    pub(crate) fn reserve(&self) -> Duration {
        if self.limit.is_unlimited() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let mut tat = self.tat.lock().unwrap_or_else(PoisonError::into_inner);
        let start = match *tat {
            Some(t) if t > now => t,
            _ => now,
        };
        let next = start + self.limit.interval;
        *tat = Some(next);

        let window = self.limit.interval * self.limit.burst;
        match next.checked_sub(window) {
            Some(allowed_at) => allowed_at.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Wait until a refresh is allowed
    pub(crate) async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "refresh rate limited");
            tokio::time::sleep(wait).await;
        }
    }
}
