//! Cache Layer
//!
//! Wires the store, coalescer, refresh engine, lock manager and watch service
//! into one handle built from a [`Config`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::error::Result;
use crate::lock::{LockManager, LockPurpose, LockStore, MemoryLockStore};
use crate::refresh::{FetchCoordination, RefreshEngine, RefreshStrategy, Upstream};
use crate::stats::{CacheStats, Metrics};
use crate::tasks::{spawn_cleanup_task, spawn_warmer_task, spawn_watch_subscriber};
use crate::watch::{ChangeFeed, WatchService};

// == Cache Layer ==
/// Coordinated read-through cache. Cloning shares all state.
#[derive(Debug)]
pub struct CacheLayer<V> {
    engine: RefreshEngine<V>,
    locks: LockManager,
    watch: WatchService,
    metrics: Arc<Metrics>,
    config: Config,
}

impl<V> Clone for CacheLayer<V> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            locks: self.locks.clone(),
            watch: self.watch.clone(),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
        }
    }
}

impl<V> CacheLayer<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates a layer whose locks live in this process.
    pub fn from_config(config: &Config, upstream: Arc<dyn Upstream<V>>) -> Self {
        Self::with_lock_store(config, upstream, Arc::new(MemoryLockStore::new()))
    }

    /// Creates a layer whose locks live in `lock_store`, typically shared
    /// with other processes.
    ///
    /// # Arguments
    /// * `config` - Settings for every component
    /// * `upstream` - Source of values
    /// * `lock_store` - Backing store for distributed locks
    pub fn with_lock_store(
        config: &Config,
        upstream: Arc<dyn Upstream<V>>,
        lock_store: Arc<dyn LockStore>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(CacheStore::new(config.max_entries, Arc::clone(&metrics)));
        let locks = LockManager::new(lock_store, config.lock_config(), Arc::clone(&metrics));
        let watch = WatchService::new(config.watch_config(), Arc::clone(&metrics));

        let coordination = if config.lock_fetches {
            FetchCoordination::Distributed {
                locks: locks.clone(),
                purpose: LockPurpose::Efficiency,
            }
        } else {
            FetchCoordination::Local
        };

        let engine = RefreshEngine::new(store, upstream, config.refresh_config(), Arc::clone(&metrics))
            .with_coordination(coordination)
            .with_watch(watch.clone());

        info!(
            max_entries = config.max_entries,
            base_ttl = ?config.base_ttl,
            strategy = %config.default_strategy,
            lock_fetches = config.lock_fetches,
            "Cache layer initialized"
        );

        Self {
            engine,
            locks,
            watch,
            metrics,
            config: config.clone(),
        }
    }

    // == Reads ==
    pub async fn get(&self, key: &str) -> Result<V> {
        self.engine.get(key).await
    }

    pub async fn refresh(&self, key: &str) -> Result<V> {
        self.engine.refresh(key).await
    }

    pub fn configure_strategy(&self, key: &str, strategy: RefreshStrategy) {
        self.engine.configure_strategy(key, strategy);
    }

    // == Invalidate ==
    /// Drops `key` locally and publishes the change so watchers refresh it.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.engine.invalidate(key)?;
        self.watch.commit([key]);
        Ok(())
    }

    // == Components ==
    pub fn engine(&self) -> &RefreshEngine<V> {
        &self.engine
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn watch(&self) -> &WatchService {
        &self.watch
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // == Stats ==
    /// Snapshot of every counter with current gauges.
    pub fn stats(&self) -> CacheStats {
        self.metrics.set_total_entries(self.engine.len());
        self.metrics.set_watch_registry_size(self.watch.registry_size());
        self.metrics.snapshot()
    }

    // == Background Tasks ==
    /// Starts the cleanup and warmer tasks.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::default();
        tasks.track(spawn_cleanup_task(self.engine.clone(), self.config.cleanup_interval));
        tasks.track(spawn_warmer_task(self.engine.clone(), self.config.warm_interval));
        info!(
            cleanup_interval = ?self.config.cleanup_interval,
            warm_interval = ?self.config.warm_interval,
            "Background tasks started"
        );
        tasks
    }

    /// Follows `pattern` on `feed` and refreshes cached keys it reports.
    pub fn spawn_subscriber(&self, feed: Arc<dyn ChangeFeed>, pattern: &str) -> JoinHandle<()> {
        spawn_watch_subscriber(
            feed,
            self.engine.clone(),
            pattern.to_string(),
            self.config.watch_timeout,
            self.config.backoff_policy(),
        )
    }
}

// == Background Tasks ==
/// Handles of spawned background tasks. Dropping it aborts them.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Aborts every task and waits for them to finish.
    pub async fn shutdown(mut self) {
        let handles = std::mem::take(&mut self.handles);
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("Background tasks stopped");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
