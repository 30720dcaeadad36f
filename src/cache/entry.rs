//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL and fetch-cost
//! metadata.

use std::time::Duration;

use tokio::time::Instant;

// == Cache Entry ==
/// Represents a single cache entry with value and refresh metadata.
///
/// Entries are immutable once built; the store swaps in a new `Arc` on every
/// refresh, so readers always hold a consistent snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cache key
    pub key: String,
    /// The stored value
    pub value: V,
    /// When the fetch that produced this value completed
    pub computed_at: Instant,
    /// Validity duration, already jittered
    pub ttl: Duration,
    /// How long the producing fetch took (delta in the early-expiration rule)
    pub fetch_cost: Duration,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a new entry computed at `computed_at`.
    ///
    /// # Arguments
    /// * `key` - The cache key
    /// * `value` - The value to store
    /// * `computed_at` - Fetch completion time
    /// * `ttl` - Validity duration
    /// * `fetch_cost` - Duration of the producing fetch
    pub fn new(
        key: impl Into<String>,
        value: V,
        computed_at: Instant,
        ttl: Duration,
        fetch_cost: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            computed_at,
            ttl,
            fetch_cost,
        }
    }

    // == Expiry ==
    /// Returns the instant at which the entry stops being fresh.
    pub fn expires_at(&self) -> Instant {
        self.computed_at + self.ttl
    }

    // == Is Expired ==
    /// Checks if the entry has expired at `now`.
    ///
    /// Boundary condition: an entry is expired once `now >= expires_at`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    // == Time To Live ==
    /// Returns the remaining freshness at `now`, zero once expired.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    /// Returns the remaining freshness as a fraction of the TTL.
    pub fn remaining_fraction(&self, now: Instant) -> f64 {
        if self.ttl.is_zero() {
            return 0.0;
        }
        self.remaining_at(now).as_secs_f64() / self.ttl.as_secs_f64()
    }

    // == Staleness ==
    /// Returns when the entry became stale, or None while it is fresh.
    pub fn stale_since(&self, now: Instant) -> Option<Instant> {
        self.is_expired_at(now).then(|| self.expires_at())
    }

    /// Returns how long the entry has been stale, zero while fresh.
    pub fn stale_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.expires_at())
    }
}
