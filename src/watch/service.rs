//! Watch Service
//!
//! Long-poll change notification. Subscribers hand in the last revision they
//! have seen and a path pattern; they are resolved with the first later
//! revision that touches a matching path, or time out.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backoff::jitter;
use crate::error::{CacheError, Result};
use crate::models::{WatchRequest, WatchResponse};
use crate::stats::{Metric, Metrics};
use crate::watch::registry::{WatchEntry, WatchRegistry};
use crate::watch::{ChangeFeed, ChangeRecord, PatternCache, Revision, RevisionLog, Subscription};

// == Watch Config ==
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Timeout used when the subscriber does not give one
    pub default_timeout: Duration,
    /// Fraction by which every timeout is jittered
    pub timeout_jitter: f64,
    /// Maximum number of distinct patterns with pending watches
    pub max_patterns: usize,
    /// Number of compiled patterns kept around
    pub pattern_cache_size: usize,
    /// Number of change records retained for catch-up
    pub retention: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            timeout_jitter: 0.2,
            max_patterns: 1024,
            pattern_cache_size: 256,
            retention: 4096,
        }
    }
}

// == Shared State ==
#[derive(Debug)]
pub(crate) struct Shared {
    registry: Mutex<WatchRegistry>,
    log: RwLock<RevisionLog>,
    patterns: PatternCache,
    config: WatchConfig,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, WatchRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, pattern: &str, id: u64) -> Option<WatchEntry> {
        let mut registry = self.registry();
        let entry = registry.remove(pattern, id);
        self.metrics.set_watch_registry_size(registry.len());
        entry
    }

    pub(crate) fn cancel(&self, pattern: &str, id: u64) -> bool {
        match self.remove(pattern, id) {
            Some(entry) => {
                debug!(pattern, id, "Watch cancelled");
                entry.resolve(Err(CacheError::WatchCancelled));
                true
            }
            None => false,
        }
    }

    fn expire(&self, pattern: &str, id: u64, after: Duration) {
        if let Some(entry) = self.remove(pattern, id) {
            self.metrics.record(Metric::WatchTimeout);
            debug!(
                pattern,
                id,
                waited = ?entry.registered_at.elapsed(),
                overdue = ?Instant::now().saturating_duration_since(entry.deadline),
                "Watch timed out"
            );
            entry.resolve(Err(CacheError::WatchTimeout { after }));
        }
    }
}

async fn expire_at(shared: Weak<Shared>, pattern: String, id: u64, deadline: Instant, after: Duration) {
    tokio::time::sleep_until(deadline).await;
    if let Some(shared) = shared.upgrade() {
        shared.expire(&pattern, id, after);
    }
}

// == Watch Service ==
/// Revision log plus the registry of pending watches.
#[derive(Debug, Clone)]
pub struct WatchService {
    shared: Arc<Shared>,
}

impl WatchService {
    // == Constructor ==
    pub fn new(config: WatchConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(WatchRegistry::new(config.max_patterns)),
                log: RwLock::new(RevisionLog::with_capacity(config.retention)),
                patterns: PatternCache::new(config.pattern_cache_size),
                config,
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.shared.config
    }

    // == Revisions ==
    /// Latest committed revision.
    pub fn head(&self) -> Revision {
        self.shared
            .log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .head()
    }

    /// Looks up the change committed as `revision`.
    pub fn change(&self, revision: Revision) -> Option<Arc<ChangeRecord>> {
        self.shared
            .log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(revision)
    }

    /// Changes in `(after, upto]`, or None if the log no longer holds them all.
    pub fn changes_between(&self, after: Revision, upto: Revision) -> Option<Vec<Arc<ChangeRecord>>> {
        self.shared
            .log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .between(after, upto)
    }

    // == Commit ==
    /// Records a change touching `paths` and wakes every matching watch.
    ///
    /// Watches are collected under the registry mutex and resolved after it
    /// is released, so a subscriber reacting to its result may immediately
    /// subscribe again.
    pub fn commit<I, S>(&self, paths: I) -> Revision
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        let record = self
            .shared
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .append(paths);

        let notified = {
            let mut registry = self.shared.registry();
            let taken = registry.take_matching(&record.paths, record.revision);
            self.shared.metrics.set_watch_registry_size(registry.len());
            taken
        };

        self.shared
            .metrics
            .add(Metric::WatchNotified, notified.len() as u64);
        debug!(
            revision = %record.revision,
            paths = ?record.paths,
            notified = notified.len(),
            "Committed change"
        );
        for entry in notified {
            entry.resolve(Ok(record.revision));
        }
        record.revision
    }

    // == Subscribe ==
    /// Registers interest in changes to `pattern` after `last_known`.
    ///
    /// If a matching change is already committed the subscription resolves
    /// immediately with the newest such revision. So does a cursor that has
    /// fallen out of the retained log, with the head revision. Otherwise the
    /// watch waits until notified or until its jittered timeout passes.
    ///
    /// # Arguments
    /// * `last_known` - Newest revision the subscriber has already seen
    /// * `pattern` - Comma-separated path globs
    /// * `timeout` - Wait budget, the configured default when None
    pub fn subscribe(
        &self,
        last_known: Revision,
        pattern: &str,
        timeout: Option<Duration>,
    ) -> Result<Subscription> {
        let compiled = self.shared.patterns.get_or_compile(pattern)?;
        let timeout = jitter(
            timeout.unwrap_or(self.shared.config.default_timeout),
            self.shared.config.timeout_jitter,
        );
        let (tx, rx) = oneshot::channel();

        // The log is checked while holding the registry mutex: a commit
        // either lands before the check or notifies after the registration.
        let (id, deadline) = {
            let mut registry = self.shared.registry();
            let immediate = {
                let log = self.shared.log.read().unwrap_or_else(PoisonError::into_inner);
                if !log.covers(last_known) && log.head() > last_known {
                    Some(log.head())
                } else {
                    log.latest_matching(last_known, |record| compiled.matches_any(&record.paths))
                }
            };
            if let Some(revision) = immediate {
                debug!(pattern, %last_known, %revision, "Watch resolved immediately");
                return Ok(Subscription::ready(pattern, revision));
            }

            let now = Instant::now();
            let id = registry.next_id();
            let deadline = now + timeout;
            registry.register(
                Arc::clone(&compiled),
                WatchEntry {
                    id,
                    last_known,
                    registered_at: now,
                    deadline,
                    tx,
                    timer: None,
                },
            )?;
            self.shared.metrics.record(Metric::WatchRegistered);
            self.shared.metrics.set_watch_registry_size(registry.len());
            (id, deadline)
        };

        let timer = tokio::spawn(expire_at(
            Arc::downgrade(&self.shared),
            pattern.to_string(),
            id,
            deadline,
            timeout,
        ));
        if !self
            .shared
            .registry()
            .attach_timer(pattern, id, timer.abort_handle())
        {
            timer.abort();
        }

        debug!(pattern, %last_known, id, ?timeout, "Watch registered");
        Ok(Subscription::pending(
            id,
            pattern,
            rx,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Subscribes and waits for the outcome.
    pub async fn watch(
        &self,
        last_known: Revision,
        pattern: &str,
        timeout: Option<Duration>,
    ) -> Result<Revision> {
        self.subscribe(last_known, pattern, timeout)?.await
    }

    // == Long Poll ==
    /// Serves one long-poll request.
    ///
    /// A timeout is answered with `NotModified` rather than an error.
    pub async fn long_poll(&self, request: &WatchRequest) -> Result<WatchResponse> {
        request.validate()?;
        let timeout = request.timeout_ms.map(Duration::from_millis);

        match self
            .watch(request.last_known_revision, &request.pattern, timeout)
            .await
        {
            Ok(revision) => {
                let pattern = self.shared.patterns.get_or_compile(&request.pattern)?;
                let paths = self
                    .changes_between(request.last_known_revision, revision)
                    .unwrap_or_default()
                    .iter()
                    .flat_map(|record| record.paths.iter())
                    .filter(|path| pattern.matches(path))
                    .cloned()
                    .collect();
                Ok(WatchResponse::Changed { revision, paths })
            }
            Err(err) if err.is_watch_timeout() => Ok(WatchResponse::NotModified {
                revision: self.head(),
            }),
            Err(err) => Err(err),
        }
    }

    // == Inspection ==
    /// Number of pending watches.
    pub fn registry_size(&self) -> usize {
        self.shared.registry().len()
    }

    /// Number of distinct patterns with pending watches.
    pub fn pattern_count(&self) -> usize {
        self.shared.registry().pattern_count()
    }

    // == Close ==
    /// Cancels every pending watch.
    pub fn close(&self) {
        let drained = {
            let mut registry = self.shared.registry();
            let drained = registry.drain();
            self.shared.metrics.set_watch_registry_size(0);
            drained
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "Cancelling pending watches");
        }
        for entry in drained {
            entry.resolve(Err(CacheError::WatchCancelled));
        }
    }
}

#[async_trait]
impl ChangeFeed for WatchService {
    async fn watch(&self, last_known: Revision, pattern: &str, timeout: Duration) -> Result<Revision> {
        WatchService::watch(self, last_known, pattern, Some(timeout)).await
    }

    async fn changes_between(
        &self,
        after: Revision,
        upto: Revision,
    ) -> Result<Option<Vec<Arc<ChangeRecord>>>> {
        Ok(WatchService::changes_between(self, after, upto))
    }
}
