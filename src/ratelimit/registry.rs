//! Per-key state storage shared by the keyed limiters.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// State tracked for a single key.
///
/// The last-seen stamp lives next to the state so that eviction removes
/// both in one step.
#[derive(Debug)]
pub(crate) struct Entry<S> {
    pub(crate) state: S,
    pub(crate) last_seen: Instant,
}

/// A key to state map with idle tracking.
///
/// Not synchronized; every keyed limiter wraps its registry in a single
/// mutex so the whole admission decision happens under one lock.
#[derive(Debug)]
pub(crate) struct KeyedRegistry<S> {
    entries: HashMap<String, Entry<S>>,
    last_sweep: Option<Instant>,
}

impl<S> KeyedRegistry<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Get the state for `key`, creating it with `init` on first sight.
    ///
    /// Stamps the key as seen at `now`.
    pub(crate) fn touch<F>(&mut self, key: &str, now: Instant, init: F) -> &mut S
    where
        F: FnOnce() -> S,
    {
        let entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry {
                state: init(),
                last_seen: now,
            });
        entry.last_seen = now;
        &mut entry.state
    }

    /// Drop every entry for which `keep` returns false.
    ///
    /// Returns the number of entries removed.
    pub(crate) fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Entry<S>) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, entry| keep(entry));
        before - self.entries.len()
    }

    /// Drop every entry not seen for longer than `idle`.
    pub(crate) fn evict_idle(&mut self, now: Instant, idle: Duration) -> usize {
        self.retain(|entry| now.saturating_duration_since(entry.last_seen) <= idle)
    }

    /// Whether a lazy sweep should run now.
    ///
    /// The first call only records a baseline; afterwards this returns true
    /// at most once per `every`.
    pub(crate) fn sweep_due(&mut self, now: Instant, every: Duration) -> bool {
        match self.last_sweep {
            Some(last) if now.saturating_duration_since(last) < every => false,
            Some(_) => {
                self.last_sweep = Some(now);
                true
            }
            None => {
                self.last_sweep = Some(now);
                false
            }
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Entry<S>> {
        self.entries.get(key)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
