//! Rate limiting algorithms and keyed state management.

mod clock;
mod fixed_window;
mod leaky_bucket;
mod manager;
mod registry;
mod sliding_window;
mod sweeper;
mod token_bucket;

use std::time::{Duration, Instant};

use crate::error::{Result, TurnstileError};

pub use clock::{Clock, ManualClock, SystemClock};
pub use fixed_window::{
    ExpiringFixedWindowLimiter, FixedWindowLimiter, KeyedFixedWindowLimiter, RetryAfter,
};
pub use leaky_bucket::{KeyedLeakyBucketLimiter, LeakyBucketLimiter};
pub use manager::IpRateLimiter;
pub use sliding_window::{KeyedSlidingWindowLimiter, SlidingWindowLimiter};
pub use sweeper::{spawn_sweeper, SweeperHandle};
pub use token_bucket::TokenBucket;

/// A limiter with one shared state for every caller.
pub trait Limiter: Send + Sync {
    /// Decide whether one request may proceed, consuming quota if so.
    fn allow(&self) -> bool;
}

/// A limiter with independent state per key.
pub trait KeyedLimiter: Send + Sync {
    /// Decide whether one request for `key` may proceed, consuming quota if so.
    fn allow(&self, key: &str) -> bool;

    /// Like [`KeyedLimiter::allow`], with an optional hint on when to retry.
    fn decide(&self, key: &str) -> Decision {
        Decision::from(self.allow(key))
    }
}

/// A keyed limiter whose idle state can be swept on demand.
pub trait Sweep: Send + Sync {
    /// Remove idle or expired keys. Returns how many were removed.
    fn sweep(&self) -> usize;
}

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Admit,
    /// The request is over the limit.
    Reject {
        /// How long the caller should wait, when the algorithm knows.
        retry_after: Option<Duration>,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Admit => None,
            Decision::Reject { retry_after } => *retry_after,
        }
    }

    /// Split into `(admitted, retry_after)`, with a zero wait on admission.
    pub fn into_parts(self) -> (bool, Duration) {
        (self.is_admitted(), self.retry_after().unwrap_or(Duration::ZERO))
    }
}

impl From<bool> for Decision {
    fn from(admitted: bool) -> Self {
        if admitted {
            Decision::Admit
        } else {
            Decision::Reject { retry_after: None }
        }
    }
}

pub(crate) fn ensure_nonzero_count(name: &'static str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(TurnstileError::invalid(name, "must be greater than zero"));
    }
    Ok(())
}

pub(crate) fn ensure_nonzero_duration(name: &'static str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(TurnstileError::invalid(name, "must be a non-zero duration"));
    }
    Ok(())
}

/// Non-zero, and short enough that `now + value` is a valid deadline.
pub(crate) fn ensure_deadline_fits(name: &'static str, now: Instant, value: Duration) -> Result<()> {
    ensure_nonzero_duration(name, value)?;
    if now.checked_add(value).is_none() {
        return Err(TurnstileError::invalid(name, "is too long to be used as a deadline"));
    }
    Ok(())
}

pub(crate) fn ensure_positive_rate(name: &'static str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(TurnstileError::invalid(
            name,
            format!("must be a finite number greater than zero, got {}", value),
        ));
    }
    Ok(())
}
