//! Short-lived "seen recently" table.
//!
//! Used to drop transactions we already fetched from another peer within
//! the last few seconds.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Expiring set of keys.
pub struct RecentTable<K: Eq + Hash> {
    entries: DashMap<K, Instant>,
    ttl: Duration,
    max_size: usize,
}

impl<K: Eq + Hash + Clone> RecentTable<K> {
    /// # Arguments
    /// * `max_size` - Soft cap: size at which expired entries are swept
    /// * `ttl` - Time-to-live for entries
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_size,
        }
    }

    /// Record `key`. Returns `false` if it was already live.
    ///
    /// Reaching `max_size` only sweeps expired entries, so the table grows
    /// past it while every entry is still live.
    pub fn insert(&self, key: K) -> bool {
        if self.entries.len() >= self.max_size {
            self.cleanup();
        }
        let now = Instant::now();
        let mut fresh = true;
        self.entries
            .entry(key)
            .and_modify(|seen| {
                if seen.elapsed() < self.ttl {
                    fresh = false;
                } else {
                    *seen = now;
                }
            })
            .or_insert(now);
        fresh
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map(|seen| seen.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Remove expired entries.
    pub fn cleanup(&self) {
        self.entries.retain(|_, seen| seen.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
