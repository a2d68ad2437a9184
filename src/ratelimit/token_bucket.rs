//! Token bucket rate limiting.

use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::{ensure_nonzero_count, ensure_positive_rate, Limiter};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct TokenState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenState {
    /// Add the whole tokens earned since the last refill, capped at `capacity`.
    ///
    /// Every call restarts the refill clock, so time that did not amount to a
    /// whole token is dropped.
    fn refill(&mut self, now: Instant, rate: f64, capacity: u32) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let earned = (elapsed * rate).floor();
        if earned >= 1.0 {
            self.tokens = self.tokens.saturating_add(earned as u32).min(capacity);
        }
    }
}

/// A token bucket: bursts up to `capacity`, sustained throughput of `rate`
/// requests per second.
///
/// The bucket starts full.
pub struct TokenBucket<C: Clock = SystemClock> {
    capacity: u32,
    rate: f64,
    state: Mutex<TokenState>,
    clock: C,
}

impl TokenBucket {
    /// Create a bucket adding `rate` tokens per second, holding at most `capacity`.
    pub fn new(rate: f64, capacity: u32) -> Result<Self> {
        Self::with_clock(rate, capacity, SystemClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    pub fn with_clock(rate: f64, capacity: u32, clock: C) -> Result<Self> {
        ensure_positive_rate("rate", rate)?;
        ensure_nonzero_count("capacity", capacity)?;

        let now = clock.now();
        Ok(Self::from_validated(rate, capacity, clock, now))
    }

    pub(crate) fn from_validated(rate: f64, capacity: u32, clock: C, now: Instant) -> Self {
        Self {
            capacity,
            rate,
            state: Mutex::new(TokenState {
                tokens: capacity,
                last_refill: now,
            }),
            clock,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Tokens a request arriving now would see.
    ///
    /// Reads a copy, so it does not restart the refill clock.
    pub fn tokens(&self) -> u32 {
        let mut state = *self.state.lock();
        state.refill(self.clock.now(), self.rate, self.capacity);
        state.tokens
    }
}

impl<C: Clock> Limiter for TokenBucket<C> {
    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        state.refill(self.clock.now(), self.rate, self.capacity);

        let admitted = state.tokens > 0;
        if admitted {
            state.tokens -= 1;
        }

        trace!(tokens = state.tokens, admitted, "Token bucket decision");
        admitted
    }
}
