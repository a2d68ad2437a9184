//! Per-client token buckets with idle eviction.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::registry::KeyedRegistry;
use super::sweeper::{spawn_sweeper, SweeperHandle};
use super::token_bucket::TokenBucket;
use super::{
    ensure_deadline_fits, ensure_nonzero_count, ensure_positive_rate, KeyedLimiter, Limiter, Sweep,
};
use crate::error::Result;

/// Hands out one token bucket per client identifier.
///
/// Buckets for clients not seen for longer than `cleanup_interval` are
/// removed by [`Sweep::sweep`], which [`IpRateLimiter::start`] runs on the
/// same interval in the background.
pub struct IpRateLimiter<C: Clock + Clone = SystemClock> {
    rate: f64,
    capacity: u32,
    cleanup_interval: Duration,
    limiters: Mutex<KeyedRegistry<Arc<TokenBucket<C>>>>,
    clock: C,
}

impl IpRateLimiter {
    pub fn new(rate: f64, capacity: u32, cleanup_interval: Duration) -> Result<Self> {
        Self::with_clock(rate, capacity, cleanup_interval, SystemClock)
    }
}

impl<C: Clock + Clone> IpRateLimiter<C> {
    pub fn with_clock(rate: f64, capacity: u32, cleanup_interval: Duration, clock: C) -> Result<Self> {
        ensure_positive_rate("rate", rate)?;
        ensure_nonzero_count("capacity", capacity)?;
        ensure_deadline_fits("cleanup_interval", clock.now(), cleanup_interval)?;

        Ok(Self {
            rate,
            capacity,
            cleanup_interval,
            limiters: Mutex::new(KeyedRegistry::new()),
            clock,
        })
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// The bucket for `key`, created full if the key is new.
    pub fn get_limiter(&self, key: &str) -> Arc<TokenBucket<C>> {
        let now = self.clock.now();
        let mut limiters = self.limiters.lock();

        let bucket = limiters.touch(key, now, || {
            debug!(key = %key, rate = self.rate, capacity = self.capacity, "Creating new token bucket");
            // Parameters were validated when the manager was built
            Arc::new(TokenBucket::from_validated(self.rate, self.capacity, self.clock.clone(), now))
        });
        Arc::clone(bucket)
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.limiters.lock().contains(key)
    }
}

impl<C: Clock + Clone + 'static> IpRateLimiter<C> {
    /// Start sweeping idle clients every `cleanup_interval`.
    pub fn start(self: &Arc<Self>) -> SweeperHandle {
        spawn_sweeper(Arc::clone(self), self.cleanup_interval)
    }
}

impl<C: Clock + Clone> KeyedLimiter for IpRateLimiter<C> {
    fn allow(&self, key: &str) -> bool {
        let admitted = self.get_limiter(key).allow();
        if !admitted {
            debug!(key = %key, "Client token bucket exhausted");
        }
        admitted
    }
}

impl<C: Clock + Clone> Sweep for IpRateLimiter<C> {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let evicted = self.limiters.lock().evict_idle(now, self.cleanup_interval);
        if evicted > 0 {
            debug!(evicted, "Evicted idle client token buckets");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn manager(clock: &ManualClock) -> IpRateLimiter<ManualClock> {
        IpRateLimiter::with_clock(1.0, 2, Duration::from_secs(60), clock.clone()).unwrap()
    }

    #[test]
    fn test_get_limiter_returns_same_bucket() {
        let clock = ManualClock::new();
        let manager = manager(&clock);

        let first = manager.get_limiter("1.2.3.4");
        let second = manager.get_limiter("1.2.3.4");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.tracked_keys(), 1);
    }

    #[test]
    fn test_new_buckets_start_full() {
        let clock = ManualClock::new();
        let manager = manager(&clock);

        assert_eq!(manager.get_limiter("a").tokens(), 2);
    }

    #[test]
    fn test_clients_do_not_interfere() {
        let clock = ManualClock::new();
        let manager = manager(&clock);

        assert!(manager.allow("a"));
        assert!(manager.allow("a"));
        assert!(!manager.allow("a"));

        assert!(manager.allow("b"));
        assert!(manager.allow("b"));
    }

    #[test]
    fn test_sweep_evicts_idle_clients() {
        let clock = ManualClock::new();
        let manager = manager(&clock);

        assert!(manager.allow("idle"));
        assert!(manager.allow("idle"));
        assert!(!manager.allow("idle"));

        clock.advance(Duration::from_secs(30));
        manager.allow("busy");
        clock.advance(Duration::from_secs(31));

        assert_eq!(manager.sweep(), 1);
        assert!(!manager.contains("idle"));
        assert!(manager.contains("busy"));

        // A returning client gets a fresh, full bucket
        assert_eq!(manager.get_limiter("idle").tokens(), 2);
    }

    #[test]
    fn test_sweep_keeps_client_at_exact_interval() {
        let clock = ManualClock::new();
        let manager = manager(&clock);

        manager.allow("a");
        clock.advance(Duration::from_secs(60));
        assert_eq!(manager.sweep(), 0);
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(IpRateLimiter::new(0.0, 1, Duration::from_secs(1)).is_err());
        assert!(IpRateLimiter::new(1.0, 0, Duration::from_secs(1)).is_err());
        assert!(IpRateLimiter::new(1.0, 1, Duration::ZERO).is_err());
        assert!(IpRateLimiter::new(1.0, 1, Duration::from_secs(u64::MAX)).is_err());
    }

    #[tokio::test]
    async fn test_background_sweep_evicts_and_stops() {
        let clock = ManualClock::new();
        let manager = Arc::new(
            IpRateLimiter::with_clock(1.0, 1, Duration::from_millis(20), clock.clone()).unwrap(),
        );

        manager.allow("10.0.0.1");
        let handle = manager.start();

        clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.contains("10.0.0.1"));

        handle.stop().await;
        assert_eq!(Arc::strong_count(&manager), 1);
    }
}
