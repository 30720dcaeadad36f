//! Refresh Engine
//!
//! The read path. Looks up the entry, asks the key's strategy what to do,
//! and routes every upstream call through the coalescer (and optionally a
//! distributed lock) so each key is fetched at most once at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{jitter, BackoffPolicy};
use crate::cache::{validate_key, CacheEntry, CacheStore};
use crate::coalesce::Coalescer;
use crate::error::{CacheError, Result};
use crate::lock::{lock_key, LockManager, LockPurpose};
use crate::refresh::strategy::{draw, Decision, RefreshStrategy, SyncReason};
use crate::stats::{Metric, Metrics};
use crate::watch::{PathPattern, WatchService};

// == Upstream ==
/// The slow or unreliable source the cache sits in front of.
#[async_trait]
pub trait Upstream<V>: Send + Sync + 'static {
    async fn fetch(&self, key: &str) -> anyhow::Result<V>;
}

// == Fetch Coordination ==
/// Whether upstream calls are additionally serialized across processes.
#[derive(Debug, Clone)]
pub enum FetchCoordination {
    /// In-process coalescing only.
    Local,
    /// Coalesce locally, then take `lock:{key}` before calling the upstream.
    Distributed {
        locks: LockManager,
        purpose: LockPurpose,
    },
}

// == Refresh Config ==
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Nominal TTL of a freshly fetched entry
    pub base_ttl: Duration,
    /// Per-entry TTL jitter fraction
    pub ttl_jitter: f64,
    /// Strategy for keys without an explicit one
    pub default_strategy: RefreshStrategy,
    /// How long past expiry an entry is kept before cleanup drops it
    pub stale_max_age: Duration,
    /// Remaining-TTL fraction below which the warmer refreshes a hot key
    pub warm_threshold: f64,
    /// Number of recently read keys the warmer tracks
    pub max_hot_keys: usize,
    /// Retry schedule for failed warm refreshes
    pub warm_retry: BackoffPolicy,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(300),
            ttl_jitter: 0.1,
            default_strategy: RefreshStrategy::Scheduled {
                stale_max_age: Duration::from_secs(30),
            },
            stale_max_age: Duration::from_secs(30),
            warm_threshold: 0.2,
            max_hot_keys: 1024,
            warm_retry: BackoffPolicy::default().with_max_attempts(3),
        }
    }
}

// == Refresh Engine ==
/// Read-through cache front end. Cloning is cheap and shares all state.
pub struct RefreshEngine<V> {
    store: Arc<CacheStore<V>>,
    coalescer: Coalescer<V>,
    upstream: Arc<dyn Upstream<V>>,
    strategies: Arc<DashMap<String, RefreshStrategy>>,
    /// Keys with a background refresh or warm in progress
    refreshing: Arc<DashSet<String>>,
    /// Last read of each recently read key
    hot_keys: Arc<DashMap<String, Instant>>,
    /// Bumped whenever a key's cached value is known to be outdated; a fetch
    /// that started under an older generation is not stored.
    generations: Arc<DashMap<String, u64>>,
    epoch: Arc<AtomicU64>,
    coordination: FetchCoordination,
    watch: Option<WatchService>,
    config: RefreshConfig,
    metrics: Arc<Metrics>,
}

impl<V> Clone for RefreshEngine<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            coalescer: self.coalescer.clone(),
            upstream: Arc::clone(&self.upstream),
            strategies: Arc::clone(&self.strategies),
            refreshing: Arc::clone(&self.refreshing),
            hot_keys: Arc::clone(&self.hot_keys),
            generations: Arc::clone(&self.generations),
            epoch: Arc::clone(&self.epoch),
            coordination: self.coordination.clone(),
            watch: self.watch.clone(),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<V> std::fmt::Debug for RefreshEngine<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshEngine")
            .field("entries", &self.store.len())
            .field("coordination", &self.coordination)
            .field("config", &self.config)
            .finish()
    }
}

impl<V> RefreshEngine<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates an engine with local-only coordination and no change
    /// publication.
    ///
    /// # Arguments
    /// * `store` - Entry storage
    /// * `upstream` - Source of values on miss and refresh
    /// * `config` - TTL, strategy and warming settings
    /// * `metrics` - Shared counters
    pub fn new(
        store: Arc<CacheStore<V>>,
        upstream: Arc<dyn Upstream<V>>,
        config: RefreshConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            coalescer: Coalescer::new(Arc::clone(&metrics)),
            upstream,
            strategies: Arc::new(DashMap::new()),
            refreshing: Arc::new(DashSet::new()),
            hot_keys: Arc::new(DashMap::new()),
            generations: Arc::new(DashMap::new()),
            epoch: Arc::new(AtomicU64::new(0)),
            coordination: FetchCoordination::Local,
            watch: None,
            config,
            metrics,
        }
    }

    /// Serializes upstream calls across processes as well.
    pub fn with_coordination(mut self, coordination: FetchCoordination) -> Self {
        self.coordination = coordination;
        self
    }

    /// Publishes keys whose fetched value changed to `watch`.
    pub fn with_watch(mut self, watch: WatchService) -> Self {
        self.watch = Some(watch);
        self
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn coalescer(&self) -> &Coalescer<V> {
        &self.coalescer
    }

    // == Strategy ==
    /// Selects the strategy used for `key` from now on.
    pub fn configure_strategy(&self, key: &str, strategy: RefreshStrategy) {
        debug!(key, strategy = strategy.name(), "Configured refresh strategy");
        self.strategies.insert(key.to_string(), strategy);
    }

    /// Strategy in effect for `key`.
    pub fn strategy_for(&self, key: &str) -> RefreshStrategy {
        self.strategies
            .get(key)
            .map(|strategy| *strategy)
            .unwrap_or(self.config.default_strategy)
    }

    // == Get ==
    /// Reads `key` through the cache.
    ///
    /// # Errors
    /// `InvalidRequest` for malformed keys. Upstream failures surface only
    /// when the read had to wait for the fetch; a failed early refresh falls
    /// back to the still-valid cached value.
    pub async fn get(&self, key: &str) -> Result<V> {
        validate_key(key)?;
        self.track_hot(key);

        let entry = self.store.get(key);
        let decision = self
            .strategy_for(key)
            .decide(entry.as_deref(), Instant::now(), draw());

        match (decision, entry) {
            (Decision::Fresh, Some(entry)) => {
                self.metrics.record(Metric::Hit);
                Ok(entry.value.clone())
            }
            (Decision::RefreshEarly, Some(entry)) => {
                self.metrics.record(Metric::Hit);
                self.metrics.record(Metric::EarlyRefresh);
                debug!(key, remaining = ?entry.remaining_at(Instant::now()), "Refreshing early");
                match self.fetch_and_store(key).await {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        warn!(key, error = %err, "Early refresh failed, serving cached value");
                        Ok(entry.value.clone())
                    }
                }
            }
            (Decision::ServeStale, Some(entry)) => {
                self.metrics.record(Metric::StaleServed);
                debug!(key, stale_for = ?entry.stale_elapsed(Instant::now()), "Serving stale value");
                self.spawn_background_refresh(key);
                Ok(entry.value.clone())
            }
            (Decision::FetchSync(reason), _) => self.fetch_sync(key, reason).await,
            (_, None) => self.fetch_sync(key, SyncReason::Missing).await,
        }
    }

    async fn fetch_sync(&self, key: &str, reason: SyncReason) -> Result<V> {
        match reason {
            SyncReason::Missing => self.metrics.record(Metric::Miss),
            SyncReason::Expired | SyncReason::StaleBudgetExceeded => {
                self.metrics.record(Metric::SyncFetch)
            }
        }
        debug!(key, ?reason, "Fetching synchronously");
        self.fetch_and_store(key).await
    }

    // == Refresh ==
    /// Fetches `key` from the upstream now, joining any fetch in flight.
    pub async fn refresh(&self, key: &str) -> Result<V> {
        validate_key(key)?;
        self.fetch_and_store(key).await
    }

    /// Refetches `key` after its source is known to have changed.
    ///
    /// A fetch already in flight may have read the source before the change,
    /// so it is superseded rather than joined and its result is not stored.
    pub async fn refresh_changed(&self, key: &str) -> Result<V> {
        validate_key(key)?;
        self.bump_generation(key);
        let engine = self.clone();
        let owned = key.to_string();
        self.coalescer
            .fetch_newer(key, move || engine.loader(owned))
            .await
    }

    /// Starts a background refresh unless one is already running for `key`.
    ///
    /// Returns true if a refresh was started.
    pub fn spawn_background_refresh(&self, key: &str) -> bool {
        if !self.claim_refresh(key) {
            debug!(key, "Background refresh already running");
            return false;
        }
        self.metrics.record(Metric::BackgroundRefresh);

        let engine = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let result = engine.fetch_and_store(&key).await;
            engine.release_refresh(&key);
            if let Err(err) = result {
                warn!(key = %key, error = %err, "Background refresh failed, keeping stale value");
            }
        });
        true
    }

    fn claim_refresh(&self, key: &str) -> bool {
        self.refreshing.insert(key.to_string())
    }

    fn release_refresh(&self, key: &str) {
        self.refreshing.remove(key);
    }

    /// True while a background refresh or warm of `key` is running.
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.refreshing.contains(key)
    }

    async fn fetch_and_store(&self, key: &str) -> Result<V> {
        let engine = self.clone();
        let owned = key.to_string();
        self.coalescer
            .fetch(key, move || engine.loader(owned))
            .await
    }

    /// Pins the key's current generation, then returns the fetch to spawn.
    fn loader(self, key: String) -> impl std::future::Future<Output = Result<V>> + Send + 'static {
        let generation = self.generation(&key);
        async move { self.load(&key, generation).await }
    }

    // == Generations ==
    // Drawn from one counter so a key that was forgotten and seen again never
    // reuses a generation an old fetch may still hold.
    fn next_generation(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn generation(&self, key: &str) -> u64 {
        *self
            .generations
            .entry(key.to_string())
            .or_insert_with(|| self.next_generation())
    }

    fn bump_generation(&self, key: &str) {
        let next = self.next_generation();
        self.generations.insert(key.to_string(), next);
    }

    /// Runs inside the coalescer's fetch task.
    async fn load(&self, key: &str, generation: u64) -> Result<V> {
        let (value, fetch_cost) = match &self.coordination {
            FetchCoordination::Local => self.call_upstream(key).await?,
            FetchCoordination::Distributed { locks, purpose } => {
                locks
                    .with_lock(&lock_key(key), *purpose, || self.call_upstream(key))
                    .await?
            }
        };
        self.store_value(key, value.clone(), fetch_cost, generation);
        Ok(value)
    }

    async fn call_upstream(&self, key: &str) -> Result<(V, Duration)> {
        let started = Instant::now();
        let value = self
            .upstream
            .fetch(key)
            .await
            .map_err(|err| CacheError::upstream(key, &err))?;
        Ok((value, started.elapsed()))
    }

    fn store_value(&self, key: &str, value: V, fetch_cost: Duration, generation: u64) {
        // The generation guard is held across the insert so an invalidation
        // either lands before the check or removes what was inserted.
        let current = self
            .generations
            .entry(key.to_string())
            .or_insert_with(|| self.next_generation());
        if *current != generation {
            debug!(key, fetched = generation, current = *current, "Dropped outdated fetch result");
            return;
        }
        // A first load is not a change; only a differing refresh is.
        let changed = self
            .store
            .get(key)
            .is_some_and(|cached| cached.value != value);
        let ttl = jitter(self.config.base_ttl, self.config.ttl_jitter);
        self.store
            .insert(CacheEntry::new(key, value, Instant::now(), ttl, fetch_cost));
        drop(current);
        debug!(key, ?ttl, ?fetch_cost, changed, "Stored fetched value");

        if changed {
            if let Some(watch) = &self.watch {
                watch.commit([key]);
            }
        }
    }

    // == Invalidate ==
    /// Drops the cached entry for `key`. A fetch already in flight for `key`
    /// still answers its callers but no longer stores its result.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.bump_generation(key);
        self.store.invalidate(key)
    }

    /// Drops every cached entry whose key matches `pattern`.
    pub fn invalidate_matching(&self, pattern: &str) -> Result<usize> {
        let pattern = PathPattern::compile(pattern)?;
        self.generations
            .iter_mut()
            .filter(|generation| pattern.matches(generation.key()))
            .for_each(|mut generation| *generation = self.next_generation());
        let removed = self.store.invalidate_matching(&pattern);
        debug!(pattern = pattern.as_str(), removed, "Invalidated matching entries");
        Ok(removed)
    }

    // == Peek ==
    /// The cached entry for `key` without touching strategies or counters.
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        self.store.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    // == Cleanup ==
    /// Removes entries stale for longer than the configured stale budget.
    pub fn purge_expired(&self) -> usize {
        let purged = self.store.purge_beyond(self.config.stale_max_age, Instant::now());
        // Nothing outside the map remembers the generation of a key that is
        // neither cached nor being fetched.
        self.generations.retain(|key, _| {
            self.store.get(key).is_some() || self.coalescer.joiner_count(key).is_some()
        });
        purged
    }

    // == Hot Keys ==
    fn track_hot(&self, key: &str) {
        self.hot_keys.insert(key.to_string(), Instant::now());
    }

    /// Recently read keys, most recent first, at most `max_hot_keys`.
    pub fn hot_keys(&self) -> Vec<String> {
        self.hot_keys_by_recency()
            .into_iter()
            .take(self.config.max_hot_keys)
            .collect()
    }

    fn hot_keys_by_recency(&self) -> Vec<String> {
        let mut seen: Vec<(String, Instant)> = self
            .hot_keys
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        seen.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        seen.into_iter().map(|(key, _)| key).collect()
    }

    /// Forgets all but the `max_hot_keys` most recently read keys.
    ///
    /// Returns the number of keys forgotten.
    pub fn trim_hot_keys(&self) -> usize {
        let mut keys = self.hot_keys_by_recency();
        if keys.len() <= self.config.max_hot_keys {
            return 0;
        }
        let stale = keys.split_off(self.config.max_hot_keys);
        for key in &stale {
            self.hot_keys.remove(key);
        }
        stale.len()
    }

    // == Warm ==
    /// Refreshes every cached hot key whose remaining TTL fraction is below
    /// the warm threshold.
    ///
    /// Failed refreshes are retried with backoff. Returns the number of keys
    /// refreshed.
    pub async fn warm_once(&self) -> usize {
        let trimmed = self.trim_hot_keys();
        if trimmed > 0 {
            debug!(trimmed, "Forgot least recently read keys");
        }
        let now = Instant::now();
        let due: Vec<String> = self
            .hot_keys()
            .into_iter()
            .filter(|key| {
                self.store
                    .get(key)
                    .is_some_and(|entry| entry.remaining_fraction(now) < self.config.warm_threshold)
            })
            .collect();

        if due.is_empty() {
            return 0;
        }

        let outcomes = join_all(due.iter().map(|key| self.warm_key(key))).await;
        let warmed = outcomes.into_iter().filter(|warmed| *warmed).count();
        info!(due = due.len(), warmed, "Warm pass finished");
        warmed
    }

    async fn warm_key(&self, key: &str) -> bool {
        if !self.claim_refresh(key) {
            return false;
        }
        self.metrics.record(Metric::BackgroundRefresh);

        let mut delays = self.config.warm_retry.iter();
        let warmed = loop {
            match self.fetch_and_store(key).await {
                Ok(_) => break true,
                Err(err) => match delays.next() {
                    Some(delay) => {
                        debug!(key, error = %err, ?delay, "Warm refresh failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(key, error = %err, "Warm refresh gave up");
                        break false;
                    }
                },
            }
        };

        self.release_refresh(key);
        warmed
    }
}
