//! Fixed window rate limiting.
//!
//! Time is divided into contiguous windows of a fixed length. Each window
//! admits up to `limit` requests; the counter resets when the window ends.
//! A burst straddling a boundary can therefore admit up to `2 * limit`
//! requests within one window-length interval.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::registry::KeyedRegistry;
use super::{ensure_deadline_fits, ensure_nonzero_count, Decision, KeyedLimiter, Limiter, Sweep};
use crate::error::Result;

/// Counter for the current window.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    /// Requests admitted in the current window
    count: u32,
    /// When the current window ends
    window_end: Instant,
}

impl WindowCounter {
    /// A counter whose window has already ended, so the next request opens a new one.
    fn expired_at(now: Instant) -> Self {
        Self {
            count: 0,
            window_end: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.window_end
    }

    fn try_admit(&mut self, now: Instant, limit: u32, window: Duration) -> bool {
        if self.is_expired(now) {
            self.count = 1;
            self.window_end = now + window;
            return true;
        }

        if self.count < limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    fn current_count(&self, now: Instant) -> u32 {
        if self.is_expired(now) {
            0
        } else {
            self.count
        }
    }

    fn until_reset(&self, now: Instant) -> Duration {
        self.window_end.saturating_duration_since(now)
    }
}

/// A fixed window limiter shared by every caller.
pub struct FixedWindowLimiter<C: Clock = SystemClock> {
    limit: u32,
    window: Duration,
    state: Mutex<WindowCounter>,
    clock: C,
}

impl FixedWindowLimiter {
    /// Create a limiter admitting `limit` requests per `window`.
    ///
    /// The first window starts now.
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        Self::with_clock(limit, window, SystemClock)
    }
}

impl<C: Clock> FixedWindowLimiter<C> {
    /// Create a limiter reading time from `clock`.
    pub fn with_clock(limit: u32, window: Duration, clock: C) -> Result<Self> {
        let now = clock.now();
        ensure_nonzero_count("limit", limit)?;
        ensure_deadline_fits("window", now, window)?;

        Ok(Self {
            limit,
            window,
            state: Mutex::new(WindowCounter {
                count: 0,
                window_end: now + window,
            }),
            clock,
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted in the current window.
    pub fn current_count(&self) -> u32 {
        self.state.lock().current_count(self.clock.now())
    }

    /// Requests still available in the current window.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.current_count())
    }

    /// Time until the current window ends.
    pub fn duration_until_reset(&self) -> Duration {
        self.state.lock().until_reset(self.clock.now())
    }
}

impl<C: Clock> Limiter for FixedWindowLimiter<C> {
    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let admitted = state.try_admit(self.clock.now(), self.limit, self.window);

        trace!(count = state.count, limit = self.limit, admitted, "Fixed window decision");
        if !admitted {
            debug!(limit = self.limit, "Global fixed window limit exceeded");
        }
        admitted
    }
}

/// A fixed window limiter with an independent window per key.
///
/// Keys whose window has ended are removed on every call.
pub struct KeyedFixedWindowLimiter<C: Clock = SystemClock> {
    limit: u32,
    window: Duration,
    visits: Mutex<KeyedRegistry<WindowCounter>>,
    clock: C,
}

impl KeyedFixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        Self::with_clock(limit, window, SystemClock)
    }
}

impl<C: Clock> KeyedFixedWindowLimiter<C> {
    pub fn with_clock(limit: u32, window: Duration, clock: C) -> Result<Self> {
        ensure_nonzero_count("limit", limit)?;
        ensure_deadline_fits("window", clock.now(), window)?;

        Ok(Self {
            limit,
            window,
            visits: Mutex::new(KeyedRegistry::new()),
            clock,
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted for `key` in its current window.
    pub fn current_count(&self, key: &str) -> u32 {
        let now = self.clock.now();
        self.visits
            .lock()
            .get(key)
            .map(|entry| entry.state.current_count(now))
            .unwrap_or(0)
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.visits.lock().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.visits.lock().contains(key)
    }
}

impl<C: Clock> KeyedLimiter for KeyedFixedWindowLimiter<C> {
    fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut visits = self.visits.lock();

        let expired = visits.retain(|entry| !entry.state.is_expired(now));
        if expired > 0 {
            trace!(expired, "Removed expired fixed window keys");
        }

        let counter = visits.touch(key, now, || WindowCounter::expired_at(now));
        let admitted = counter.try_admit(now, self.limit, self.window);

        trace!(key = %key, count = counter.count, admitted, "Keyed fixed window decision");
        if !admitted {
            debug!(key = %key, limit = self.limit, "Fixed window limit exceeded");
        }
        admitted
    }
}

impl<C: Clock> Sweep for KeyedFixedWindowLimiter<C> {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.visits.lock().retain(|entry| !entry.state.is_expired(now))
    }
}

/// How a rejected caller is told to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAfter {
    /// Always the full window length, regardless of how much of it is left.
    FullWindow,
    /// The time left until the key's window ends.
    #[default]
    Remaining,
}

/// A keyed fixed window limiter that reports when to retry.
///
/// A key's window opens on its first request and ends `window` later. The
/// deadline is stored with the key and expired keys are swept lazily, at
/// most once per window.
pub struct ExpiringFixedWindowLimiter<C: Clock = SystemClock> {
    limit: u32,
    window: Duration,
    retry_after: RetryAfter,
    clients: Mutex<KeyedRegistry<WindowCounter>>,
    clock: C,
}

impl ExpiringFixedWindowLimiter {
    pub fn new(limit: u32, window: Duration, retry_after: RetryAfter) -> Result<Self> {
        Self::with_clock(limit, window, retry_after, SystemClock)
    }
}

impl<C: Clock> ExpiringFixedWindowLimiter<C> {
    pub fn with_clock(limit: u32, window: Duration, retry_after: RetryAfter, clock: C) -> Result<Self> {
        ensure_nonzero_count("limit", limit)?;
        ensure_deadline_fits("window", clock.now(), window)?;

        Ok(Self {
            limit,
            window,
            retry_after,
            clients: Mutex::new(KeyedRegistry::new()),
            clock,
        })
    }

    /// Decide for `key`, with a retry hint on rejection.
    pub fn check(&self, key: &str) -> Decision {
        let now = self.clock.now();
        let mut clients = self.clients.lock();

        if clients.sweep_due(now, self.window) {
            let expired = clients.retain(|entry| !entry.state.is_expired(now));
            trace!(expired, "Swept expired fixed window keys");
        }

        let counter = clients.touch(key, now, || WindowCounter::expired_at(now));
        if counter.try_admit(now, self.limit, self.window) {
            return Decision::Admit;
        }

        let wait = match self.retry_after {
            RetryAfter::FullWindow => self.window,
            RetryAfter::Remaining => counter.until_reset(now),
        };
        debug!(key = %key, limit = self.limit, retry_after_ms = wait.as_millis() as u64, "Fixed window limit exceeded");
        Decision::Reject {
            retry_after: Some(wait),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.clients.lock().len()
    }
}

impl<C: Clock> KeyedLimiter for ExpiringFixedWindowLimiter<C> {
    fn allow(&self, key: &str) -> bool {
        self.check(key).is_admitted()
    }

    fn decide(&self, key: &str) -> Decision {
        self.check(key)
    }
}

impl<C: Clock> Sweep for ExpiringFixedWindowLimiter<C> {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.clients.lock().retain(|entry| !entry.state.is_expired(now))
    }
}
