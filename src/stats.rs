//! Cache Statistics Module
//!
//! Counters for coalescing, refresh, lock and watch activity. The counters are
//! recorded lock-free from every component and exported as a serializable
//! snapshot for an external monitoring sink.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Point-in-time view of every counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads answered from a fresh entry
    pub hits: u64,
    /// Reads that found no entry
    pub misses: u64,
    /// Reads answered with an expired entry inside the stale budget
    pub stale_served: u64,
    /// Reads that blocked on a synchronous fetch
    pub sync_fetches: u64,
    /// Probabilistic early recomputations
    pub early_refreshes: u64,
    /// Background refreshes spawned for stale entries or warming
    pub background_refreshes: u64,
    /// Loader invocations that actually reached the upstream
    pub upstream_fetches: u64,
    /// Loader invocations that failed
    pub upstream_errors: u64,
    /// Callers that joined an in-flight fetch instead of starting one
    pub coalesced_joins: u64,
    /// Entries removed for capacity or past their stale budget
    pub evictions: u64,
    /// Successful lock acquisitions
    pub lock_acquired: u64,
    /// Acquisition attempts that found the lock held
    pub lock_contended: u64,
    /// Blocking acquisitions that gave up
    pub lock_timeouts: u64,
    /// Releases attempted with a token that no longer owns the lock
    pub lock_release_conflicts: u64,
    /// TTL extensions performed by watchdogs
    pub watchdog_extensions: u64,
    /// Watches that had to wait for a change
    pub watches_registered: u64,
    /// Watches resolved by a committed change
    pub watches_notified: u64,
    /// Watches that ended without a change
    pub watch_timeouts: u64,
    /// Current number of cache entries
    pub total_entries: u64,
    /// Current number of pending watches
    pub watch_registry_size: u64,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Stale serves count as hits. Returns 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_served;
        let total = served + self.misses + self.sync_fetches;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }

    // == Coalescing Rate ==
    /// Fraction of fetch requests that piggybacked on an in-flight fetch.
    pub fn coalescing_rate(&self) -> f64 {
        let total = self.coalesced_joins + self.upstream_fetches;
        if total == 0 {
            0.0
        } else {
            self.coalesced_joins as f64 / total as f64
        }
    }
}

// == Metric ==
/// Identifies a single counter in [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Hit,
    Miss,
    StaleServed,
    SyncFetch,
    EarlyRefresh,
    BackgroundRefresh,
    UpstreamFetch,
    UpstreamError,
    CoalescedJoin,
    Eviction,
    LockAcquired,
    LockContended,
    LockTimeout,
    LockReleaseConflict,
    WatchdogExtension,
    WatchRegistered,
    WatchNotified,
    WatchTimeout,
}

// == Metrics ==
/// Shared, lock-free recorder behind [`CacheStats`].
#[derive(Debug, Default)]
pub struct Metrics {
    counters: [AtomicU64; 18],
    total_entries: AtomicU64,
    watch_registry_size: AtomicU64,
}

impl Metrics {
    // == Constructor ==
    /// Creates a recorder with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Record ==
    /// Increments one counter.
    pub fn record(&self, metric: Metric) {
        self.add(metric, 1);
    }

    /// Adds `n` to one counter.
    pub fn add(&self, metric: Metric, n: u64) {
        self.counters[metric as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Reads one counter.
    pub fn get(&self, metric: Metric) -> u64 {
        self.counters[metric as usize].load(Ordering::Relaxed)
    }

    // == Gauges ==
    /// Updates the total entries gauge.
    pub fn set_total_entries(&self, count: usize) {
        self.total_entries.store(count as u64, Ordering::Relaxed);
    }

    /// Updates the pending watches gauge.
    pub fn set_watch_registry_size(&self, count: usize) {
        self.watch_registry_size.store(count as u64, Ordering::Relaxed);
    }

    // == Snapshot ==
    /// Returns current values of every counter and gauge.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.get(Metric::Hit),
            misses: self.get(Metric::Miss),
            stale_served: self.get(Metric::StaleServed),
            sync_fetches: self.get(Metric::SyncFetch),
            early_refreshes: self.get(Metric::EarlyRefresh),
            background_refreshes: self.get(Metric::BackgroundRefresh),
            upstream_fetches: self.get(Metric::UpstreamFetch),
            upstream_errors: self.get(Metric::UpstreamError),
            coalesced_joins: self.get(Metric::CoalescedJoin),
            evictions: self.get(Metric::Eviction),
            lock_acquired: self.get(Metric::LockAcquired),
            lock_contended: self.get(Metric::LockContended),
            lock_timeouts: self.get(Metric::LockTimeout),
            lock_release_conflicts: self.get(Metric::LockReleaseConflict),
            watchdog_extensions: self.get(Metric::WatchdogExtension),
            watches_registered: self.get(Metric::WatchRegistered),
            watches_notified: self.get(Metric::WatchNotified),
            watch_timeouts: self.get(Metric::WatchTimeout),
            total_entries: self.total_entries.load(Ordering::Relaxed),
            watch_registry_size: self.watch_registry_size.load(Ordering::Relaxed),
        }
    }
}
