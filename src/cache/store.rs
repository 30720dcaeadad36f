//! Cache Store Module
//!
//! Concurrent entry map. Reads never block each other and writes are atomic
//! per key: a refresh swaps in a new `Arc<CacheEntry>` so readers holding the
//! previous snapshot are unaffected.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::CacheEntry;
use crate::error::{CacheError, Result};
use crate::stats::{Metric, Metrics};
use crate::watch::PathPattern;

// == Cache Store ==
/// Entry storage keyed by cache key, bounded by `max_entries`.
#[derive(Debug)]
pub struct CacheStore<V> {
    /// Key-value storage
    entries: DashMap<String, Arc<CacheEntry<V>>>,
    /// Maximum number of entries allowed
    max_entries: usize,
    /// Shared counters
    metrics: Arc<Metrics>,
}

impl<V> CacheStore<V> {
    // == Constructor ==
    /// Creates a new CacheStore with specified capacity.
    ///
    /// # Arguments
    /// * `max_entries` - Maximum number of entries the cache can hold
    /// * `metrics` - Counter sink shared with the other components
    pub fn new(max_entries: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            metrics,
        }
    }

    // == Get ==
    /// Returns a snapshot of the entry for `key`, fresh or not.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    // == Insert ==
    /// Stores an entry, replacing any previous one for the same key.
    ///
    /// If the key is new and the store is at capacity, the entry closest to
    /// (or furthest past) its expiry is evicted first.
    ///
    /// Returns the replaced entry, if any.
    pub fn insert(&self, entry: CacheEntry<V>) -> Option<Arc<CacheEntry<V>>> {
        if !self.entries.contains_key(&entry.key) && self.entries.len() >= self.max_entries {
            self.evict_earliest_expiry();
        }

        let previous = self.entries.insert(entry.key.clone(), Arc::new(entry));
        self.metrics.set_total_entries(self.entries.len());
        previous
    }

    // == Invalidate ==
    /// Removes an entry by key.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.metrics.set_total_entries(self.entries.len());
            Ok(())
        } else {
            Err(CacheError::NotFound(key.to_string()))
        }
    }

    /// Removes every entry whose key matches `pattern`.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_matching(&self, pattern: &PathPattern) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.matches(key));
        let removed = before.saturating_sub(self.entries.len());
        self.metrics.set_total_entries(self.entries.len());
        removed
    }

    // == Purge ==
    /// Removes entries that have been stale for longer than `stale_max_age`.
    ///
    /// Returns the number of entries removed.
    pub fn purge_beyond(&self, stale_max_age: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stale_elapsed(now) <= stale_max_age);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.metrics.add(Metric::Eviction, removed as u64);
        }
        self.metrics.set_total_entries(self.entries.len());
        removed
    }

    fn evict_earliest_expiry(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at())
            .map(|entry| entry.key().clone());

        if let Some(key) = victim {
            if self.entries.remove(&key).is_some() {
                debug!(key = %key, "Evicted entry to stay within capacity");
                self.metrics.record(Metric::Eviction);
            }
        }
    }

    // == Keys ==
    /// Returns every cached key.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    // == Length ==
    /// Returns the current number of entries in the cache.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // == Is Empty ==
    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
