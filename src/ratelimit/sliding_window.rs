//! Sliding window rate limiting.
//!
//! Keeps the instant of every admitted request and counts only those inside
//! the trailing window, so there is no boundary burst. The cost is memory and
//! time proportional to the number of requests in the window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::registry::KeyedRegistry;
use super::{ensure_nonzero_count, ensure_nonzero_duration, KeyedLimiter, Limiter, Sweep};
use crate::error::{Result, TurnstileError};

/// Admission instants inside the trailing window, oldest first.
#[derive(Debug, Default)]
struct RequestLog {
    timestamps: VecDeque<Instant>,
}

impl RequestLog {
    fn try_admit(&mut self, now: Instant, limit: u32, window: Duration) -> bool {
        self.expire(now, window);

        if self.timestamps.len() < limit as usize {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drop every instant at or before `now - window`.
    fn expire(&mut self, now: Instant, window: Duration) {
        let Some(window_start) = now.checked_sub(window) else {
            return;
        };
        while self
            .timestamps
            .front()
            .is_some_and(|&ts| ts <= window_start)
        {
            self.timestamps.pop_front();
        }
    }

    fn occupancy(&mut self, now: Instant, window: Duration) -> usize {
        self.expire(now, window);
        self.timestamps.len()
    }
}

/// A sliding window limiter shared by every caller.
pub struct SlidingWindowLimiter<C: Clock = SystemClock> {
    limit: u32,
    window: Duration,
    log: Mutex<RequestLog>,
    clock: C,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting `limit` requests in any trailing `window`.
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        Self::with_clock(limit, window, SystemClock)
    }
}

impl<C: Clock> SlidingWindowLimiter<C> {
    pub fn with_clock(limit: u32, window: Duration, clock: C) -> Result<Self> {
        ensure_nonzero_count("limit", limit)?;
        ensure_nonzero_duration("window", window)?;

        Ok(Self {
            limit,
            window,
            log: Mutex::new(RequestLog::default()),
            clock,
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted within the trailing window.
    pub fn current_count(&self) -> usize {
        self.log.lock().occupancy(self.clock.now(), self.window)
    }
}

impl<C: Clock> Limiter for SlidingWindowLimiter<C> {
    fn allow(&self) -> bool {
        let mut log = self.log.lock();
        let admitted = log.try_admit(self.clock.now(), self.limit, self.window);

        trace!(in_window = log.timestamps.len(), admitted, "Sliding window decision");
        if !admitted {
            debug!(limit = self.limit, "Global sliding window limit exceeded");
        }
        admitted
    }
}

/// A sliding window limiter with an independent log per key.
///
/// Keys idle for longer than the retention interval are swept lazily, at
/// most once per interval. The default retention equals the window, after
/// which every stored instant has expired anyway.
pub struct KeyedSlidingWindowLimiter<C: Clock = SystemClock> {
    limit: u32,
    window: Duration,
    retention: Duration,
    clients: Mutex<KeyedRegistry<RequestLog>>,
    clock: C,
}

impl KeyedSlidingWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        Self::with_clock(limit, window, SystemClock)
    }
}

impl<C: Clock> KeyedSlidingWindowLimiter<C> {
    pub fn with_clock(limit: u32, window: Duration, clock: C) -> Result<Self> {
        ensure_nonzero_count("limit", limit)?;
        ensure_nonzero_duration("window", window)?;

        Ok(Self {
            limit,
            window,
            retention: window,
            clients: Mutex::new(KeyedRegistry::new()),
            clock,
        })
    }

    /// Keep idle keys for `retention` instead of one window.
    ///
    /// Retention shorter than the window would forget admissions that still
    /// count, so it is rejected.
    pub fn with_retention(mut self, retention: Duration) -> Result<Self> {
        if retention < self.window {
            return Err(TurnstileError::invalid(
                "retention",
                "must not be shorter than the window",
            ));
        }
        self.retention = retention;
        Ok(self)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted for `key` within the trailing window.
    pub fn current_count(&self, key: &str) -> usize {
        let now = self.clock.now();
        self.clients
            .lock()
            .get(key)
            .map(|entry| {
                entry
                    .state
                    .timestamps
                    .iter()
                    .filter(|&&ts| now.saturating_duration_since(ts) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn tracked_keys(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.clients.lock().contains(key)
    }
}

impl<C: Clock> KeyedLimiter for KeyedSlidingWindowLimiter<C> {
    fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut clients = self.clients.lock();

        if clients.sweep_due(now, self.retention) {
            let evicted = clients.evict_idle(now, self.retention);
            if evicted > 0 {
                debug!(evicted, "Evicted idle sliding window keys");
            }
        }

        let log = clients.touch(key, now, RequestLog::default);
        let admitted = log.try_admit(now, self.limit, self.window);

        trace!(key = %key, in_window = log.timestamps.len(), admitted, "Keyed sliding window decision");
        if !admitted {
            debug!(key = %key, limit = self.limit, "Sliding window limit exceeded");
        }
        admitted
    }
}

impl<C: Clock> Sweep for KeyedSlidingWindowLimiter<C> {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.clients.lock().evict_idle(now, self.retention)
    }
}
