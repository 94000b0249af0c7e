//! Token bucket rate limiting for job copy traffic
//!
//! The bucket refills continuously at the configured rate and holds at most
//! one slice worth of budget. A request larger than the available budget is
//! granted at once and drives the bucket into debt; the caller then sleeps
//! until the debt is paid back. This keeps requests larger than the bucket
//! from stalling forever and makes every granted byte count exactly once,
//! even across rate changes.

use crate::error::{Error, Result};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Default burst window
pub const DEFAULT_SLICE: Duration = Duration::from_millis(100);

/// Bytes-per-second limiter; a rate of zero means unlimited
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    rate: u64,
    slice: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn capacity(&self) -> f64 {
        self.rate as f64 * self.slice.as_secs_f64()
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        if self.rate == 0 {
            return;
        }
        let refilled = self.tokens + elapsed.as_secs_f64() * self.rate as f64;
        self.tokens = refilled.min(self.capacity());
    }
}

impl RateLimiter {
    /// Create a limiter with the default slice
    pub fn new(rate: u64) -> Self {
        Self::with_slice(rate, DEFAULT_SLICE)
    }

    /// Create a limiter whose bucket holds `slice` worth of budget
    pub fn with_slice(rate: u64, slice: Duration) -> Self {
        let mut bucket = Bucket {
            rate,
            slice,
            tokens: 0.0,
            last_refill: Instant::now(),
        };
        bucket.tokens = bucket.capacity();
        Self {
            bucket: Mutex::new(bucket),
        }
    }

    /// Currently configured rate in bytes per second
    pub fn rate(&self) -> u64 {
        self.bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rate
    }

    /// Whether the limiter lets everything through
    pub fn is_unlimited(&self) -> bool {
        self.rate() == 0
    }

    /// Change the rate for all future acquisitions.
    ///
    /// Negative rates are rejected and leave the previous rate in place.
    pub fn set_rate(&self, rate: i64) -> Result<()> {
        let rate = u64::try_from(rate).map_err(|_| Error::InvalidSpeed(rate))?;

        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        bucket.refill(now);

        let was_unlimited = bucket.rate == 0;
        bucket.rate = rate;
        let capacity = bucket.capacity();
        bucket.tokens = if was_unlimited {
            capacity
        } else {
            bucket.tokens.min(capacity)
        };

        tracing::debug!("Rate limit set to {} B/s", rate);
        Ok(())
    }

    /// Take `bytes` of budget now and return how long the caller must wait
    /// before using it
    pub fn reserve(&self, bytes: u64) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        if bucket.rate == 0 {
            return Duration::ZERO;
        }

        bucket.refill(Instant::now());
        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64)
        }
    }

    /// Wait until `bytes` of budget are available
    pub async fn acquire(&self, bytes: u64) {
        let delay = self.reserve(bytes);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(0)
    }
}
