//! Leaky bucket rate limiting.
//!
//! Each admitted request pours one unit of water into a bucket that drains at
//! a constant rate. Requests are admitted while the bucket is below capacity,
//! which smooths bursts into the drain rate.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::registry::KeyedRegistry;
use super::{ensure_nonzero_count, ensure_positive_rate, KeyedLimiter, Limiter, Sweep};
use crate::error::{Result, TurnstileError};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Outstanding request credits, never negative
    water: f64,
    last_leak: Instant,
}

impl Bucket {
    fn empty(now: Instant) -> Self {
        Self {
            water: 0.0,
            last_leak: now,
        }
    }

    fn leak(&mut self, now: Instant, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_leak).as_secs_f64();
        self.water = (self.water - elapsed * rate).max(0.0);
        self.last_leak = now;
    }

    fn try_admit(&mut self, now: Instant, rate: f64, capacity: f64) -> bool {
        self.leak(now, rate);

        if self.water < capacity {
            self.water += 1.0;
            true
        } else {
            false
        }
    }
}

/// Time for the fullest possible bucket to drain completely.
///
/// An admission can lift the level to just under `capacity + 1`.
fn drain_time(rate: f64, capacity: u32) -> Result<Duration> {
    Duration::try_from_secs_f64((capacity as f64 + 1.0) / rate).map_err(|_| {
        TurnstileError::invalid("rate", format!("{} is too slow to drain a bucket of {}", rate, capacity))
    })
}

/// A leaky bucket limiter shared by every caller.
pub struct LeakyBucketLimiter<C: Clock = SystemClock> {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
    clock: C,
}

impl LeakyBucketLimiter {
    /// Create a limiter draining `rate` requests per second from a bucket
    /// holding at most `capacity`.
    pub fn new(rate: f64, capacity: u32) -> Result<Self> {
        Self::with_clock(rate, capacity, SystemClock)
    }
}

impl<C: Clock> LeakyBucketLimiter<C> {
    pub fn with_clock(rate: f64, capacity: u32, clock: C) -> Result<Self> {
        ensure_positive_rate("rate", rate)?;
        ensure_nonzero_count("capacity", capacity)?;

        let now = clock.now();
        Ok(Self {
            rate,
            capacity: capacity as f64,
            bucket: Mutex::new(Bucket::empty(now)),
            clock,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Current water level after draining up to now.
    pub fn level(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.leak(self.clock.now(), self.rate);
        bucket.water
    }
}

impl<C: Clock> Limiter for LeakyBucketLimiter<C> {
    fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock();
        let admitted = bucket.try_admit(self.clock.now(), self.rate, self.capacity);

        trace!(water = bucket.water, admitted, "Leaky bucket decision");
        if !admitted {
            debug!(capacity = self.capacity, "Global leaky bucket overflowed");
        }
        admitted
    }
}

/// A leaky bucket limiter with an independent bucket per key.
///
/// Keys idle for longer than the retention interval are swept lazily, at
/// most once per interval. The default retention is the time the fullest
/// possible bucket takes to drain, after which it is indistinguishable from
/// a new one.
pub struct KeyedLeakyBucketLimiter<C: Clock = SystemClock> {
    rate: f64,
    capacity: f64,
    retention: Duration,
    clients: Mutex<KeyedRegistry<Bucket>>,
    clock: C,
}

impl KeyedLeakyBucketLimiter {
    pub fn new(rate: f64, capacity: u32) -> Result<Self> {
        Self::with_clock(rate, capacity, SystemClock)
    }
}

impl<C: Clock> KeyedLeakyBucketLimiter<C> {
    pub fn with_clock(rate: f64, capacity: u32, clock: C) -> Result<Self> {
        ensure_positive_rate("rate", rate)?;
        ensure_nonzero_count("capacity", capacity)?;

        Ok(Self {
            rate,
            capacity: capacity as f64,
            retention: drain_time(rate, capacity)?,
            clients: Mutex::new(KeyedRegistry::new()),
            clock,
        })
    }

    /// Keep idle keys for `retention` instead of the drain time.
    pub fn with_retention(mut self, retention: Duration) -> Result<Self> {
        if retention.as_secs_f64() * self.rate < self.capacity + 1.0 {
            return Err(TurnstileError::invalid(
                "retention",
                "must not be shorter than the time a full bucket takes to drain",
            ));
        }
        self.retention = retention;
        Ok(self)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Water level for `key` after draining up to now.
    pub fn level(&self, key: &str) -> Option<f64> {
        let now = self.clock.now();
        self.clients.lock().get(key).map(|entry| {
            let mut bucket = entry.state;
            bucket.leak(now, self.rate);
            bucket.water
        })
    }

    pub fn tracked_keys(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.clients.lock().contains(key)
    }
}

impl<C: Clock> KeyedLimiter for KeyedLeakyBucketLimiter<C> {
    fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut clients = self.clients.lock();

        if clients.sweep_due(now, self.retention) {
            let evicted = clients.evict_idle(now, self.retention);
            if evicted > 0 {
                debug!(evicted, "Evicted idle leaky buckets");
            }
        }

        let bucket = clients.touch(key, now, || {
            debug!(key = %key, "Creating new leaky bucket");
            Bucket::empty(now)
        });
        let admitted = bucket.try_admit(now, self.rate, self.capacity);

        trace!(key = %key, water = bucket.water, admitted, "Keyed leaky bucket decision");
        if !admitted {
            debug!(key = %key, capacity = self.capacity, "Leaky bucket overflowed");
        }
        admitted
    }
}

impl<C: Clock> Sweep for KeyedLeakyBucketLimiter<C> {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.clients.lock().evict_idle(now, self.retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_global_saturates_at_capacity() {
        let clock = ManualClock::new();
        let limiter = LeakyBucketLimiter::with_clock(2.0, 4, clock).unwrap();

        for _ in 0..4 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn test_global_restores_capacity_after_drain_time() {
        let clock = ManualClock::new();
        let limiter = LeakyBucketLimiter::with_clock(2.0, 4, clock.clone()).unwrap();

        for _ in 0..4 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());

        // capacity / rate = 2 seconds
        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.level(), 0.0);
        for _ in 0..4 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
    }

    #[test]
    fn test_global_drains_at_constant_rate() {
        let clock = ManualClock::new();
        let limiter = LeakyBucketLimiter::with_clock(1.0, 2, clock.clone()).unwrap();

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        // Half a unit drained leaves room for exactly one more request
        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(LeakyBucketLimiter::new(0.0, 1).is_err());
        assert!(LeakyBucketLimiter::new(1.0, 0).is_err());
        assert!(KeyedLeakyBucketLimiter::new(f64::NAN, 1).is_err());
        assert!(KeyedLeakyBucketLimiter::new(1.0, 10)
            .unwrap()
            .with_retention(Duration::from_secs(5))
            .is_err());
    }

    #[test]
    fn test_keyed_keys_are_independent() {
        let clock = ManualClock::new();
        let limiter = KeyedLeakyBucketLimiter::with_clock(1.0, 1, clock).unwrap();

        assert!(limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.1"));
        assert!(limiter.allow("10.0.0.2"));
        assert_eq!(limiter.level("10.0.0.1"), Some(1.0));
        assert_eq!(limiter.level("10.0.0.3"), None);
    }

    #[test]
    fn test_keyed_retention_defaults_to_drain_time() {
        let limiter = KeyedLeakyBucketLimiter::new(4.0, 10).unwrap();
        assert_eq!(limiter.retention(), Duration::from_millis(2750));
    }

    #[test]
    fn test_keyed_rejects_unrepresentable_drain_time() {
        let err = KeyedLeakyBucketLimiter::new(1e-20, 1).err().unwrap();
        assert!(matches!(err, TurnstileError::InvalidParameter { name: "rate", .. }));
    }

    #[test]
    fn test_keyed_overfilled_bucket_outlives_capacity_over_rate() {
        let clock = ManualClock::new();
        let limiter = KeyedLeakyBucketLimiter::with_clock(1.0, 2, clock.clone()).unwrap();

        // Level 1.5 when the third request lands, 2.5 after it
        assert!(limiter.allow("busy"));
        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow("busy"));
        assert!(limiter.allow("busy"));
        assert!(!limiter.allow("busy"));

        // Past capacity / rate the bucket still holds water, so it is kept
        clock.advance(Duration::from_millis(2250));
        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.level("busy"), Some(0.25));

        clock.advance(Duration::from_millis(1000));
        assert_eq!(limiter.sweep(), 1);
    }

    #[test]
    fn test_keyed_drained_keys_are_evicted() {
        let clock = ManualClock::new();
        let limiter = KeyedLeakyBucketLimiter::with_clock(1.0, 2, clock.clone()).unwrap();

        assert!(limiter.allow("idle"));
        clock.advance(Duration::from_secs(4));
        assert!(limiter.allow("active"));

        assert!(!limiter.contains("idle"));
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.sweep(), 0);
    }

    #[test]
    fn test_concurrent_requests_admit_exactly_capacity() {
        let clock = ManualClock::new();
        let limiter = Arc::new(LeakyBucketLimiter::with_clock(1.0, 16, clock).unwrap());
        let admitted = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(50));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let admitted = admitted.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if limiter.allow() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 16);
    }
}
