//! Lock Manager
//!
//! Owner-token locks on top of a [`LockStore`]: non-blocking acquire,
//! ownership-checked release, blocking acquire by polling or by queueing for
//! a handoff, and a scoped `with_lock` helper.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::{CacheError, Result};
use crate::lock::{queue_key, LockConfig, LockPurpose, LockStore, LockToken, WaitStrategy, Watchdog};
use crate::stats::{Metric, Metrics};

// == Lock Manager ==
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").field("config", &self.config).finish()
    }
}

impl LockManager {
    // == Constructor ==
    /// Creates a manager over `store`.
    ///
    /// # Arguments
    /// * `store` - Shared store holding lock values and wait queues
    /// * `config` - TTL, wait budget and wait strategy
    /// * `metrics` - Counters for acquisitions, contention and timeouts
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig, metrics: Arc<Metrics>) -> Self {
        Self { store, config, metrics }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    // == Try Acquire ==
    /// Makes one attempt to take `lock_key` for `ttl`.
    ///
    /// Returns None if the lock is held by someone else.
    pub async fn try_acquire(&self, lock_key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let owner = Uuid::new_v4().to_string();
        let stored = match self.config.strategy {
            // Queued waiters are served before newcomers.
            WaitStrategy::Signal => {
                self.store
                    .set_if_free(lock_key, &owner, ttl, &queue_key(lock_key))
                    .await?
            }
            WaitStrategy::Polling(_) => self.store.set_if_absent(lock_key, &owner, ttl).await?,
        };
        if !stored {
            self.metrics.record(Metric::LockContended);
            return Ok(None);
        }
        Ok(Some(self.acquired(lock_key, owner, ttl)))
    }

    fn acquired(&self, lock_key: &str, owner: String, ttl: Duration) -> LockToken {
        self.metrics.record(Metric::LockAcquired);
        debug!(lock = %lock_key, owner = %owner, "Lock acquired");
        LockToken {
            lock_key: lock_key.to_string(),
            owner,
            ttl,
            acquired_at: Instant::now(),
        }
    }

    // == Release ==
    /// Releases the lock if `token` still owns it.
    ///
    /// Returns false when the lock had expired and may now belong to someone
    /// else; the other owner's lock is left untouched. Under the signal
    /// strategy a successful release hands the lock straight to the oldest
    /// waiter.
    pub async fn release(&self, token: &LockToken) -> Result<bool> {
        let released = match self.config.strategy {
            WaitStrategy::Signal => {
                let queue = queue_key(&token.lock_key);
                self.store
                    .release_and_handoff(&token.lock_key, &token.owner, &queue)
                    .await?
            }
            WaitStrategy::Polling(_) => {
                self.store.compare_and_delete(&token.lock_key, &token.owner).await?
            }
        };

        if released {
            debug!(
                lock = %token.lock_key,
                held_ms = token.acquired_at.elapsed().as_millis() as u64,
                "Lock released"
            );
        } else {
            self.metrics.record(Metric::LockReleaseConflict);
            warn!(
                lock = %token.lock_key,
                owner = %token.owner,
                "Lock expired before release; it may now be held by another owner"
            );
        }
        Ok(released)
    }

    // == Acquire Blocking ==
    /// Waits up to `max_wait` for `lock_key`.
    ///
    /// # Errors
    /// `LockTimeout` when the wait budget (or the polling attempt limit) runs
    /// out, store errors as they occur.
    pub async fn acquire_blocking(
        &self,
        lock_key: &str,
        ttl: Duration,
        max_wait: Duration,
        purpose: LockPurpose,
    ) -> Result<LockToken> {
        let started = Instant::now();
        let deadline = started + max_wait;

        let token = match self.config.strategy {
            WaitStrategy::Polling(policy) => self.poll_until(lock_key, ttl, deadline, policy).await?,
            WaitStrategy::Signal => self.wait_for_handoff(lock_key, ttl, deadline).await?,
        };

        match token {
            Some(token) => Ok(token),
            None => {
                let waited = started.elapsed();
                self.metrics.record(Metric::LockTimeout);
                warn!(lock = %lock_key, %purpose, waited_ms = waited.as_millis() as u64, "Lock wait timed out");
                Err(CacheError::LockTimeout {
                    key: lock_key.to_string(),
                    purpose,
                    waited,
                })
            }
        }
    }

    async fn poll_until(
        &self,
        lock_key: &str,
        ttl: Duration,
        deadline: Instant,
        policy: BackoffPolicy,
    ) -> Result<Option<LockToken>> {
        let mut delays = policy.iter();
        loop {
            if let Some(token) = self.try_acquire(lock_key, ttl).await? {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let Some(delay) = delays.next() else {
                return Ok(None);
            };
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }

    async fn wait_for_handoff(
        &self,
        lock_key: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<Option<LockToken>> {
        if let Some(token) = self.try_acquire(lock_key, ttl).await? {
            return Ok(Some(token));
        }
        let owner = Uuid::new_v4().to_string();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let handed_over = self
            .store
            .acquire_or_wait(lock_key, &owner, ttl, &queue_key(lock_key), remaining)
            .await?;
        Ok(handed_over.then(|| self.acquired(lock_key, owner, ttl)))
    }

    // == Watchdog ==
    /// Starts extending `token`'s lock every `ttl / 3` until the returned
    /// handle is dropped.
    pub fn spawn_watchdog(&self, token: &LockToken) -> Watchdog {
        Watchdog::spawn(self.store.clone(), token, self.metrics.clone())
    }

    // == With Lock ==
    /// Runs `work` while holding `lock_key`, then releases it.
    ///
    /// If the lock can't be taken, efficiency callers run `work` without it
    /// and correctness callers get the error. A failed release is logged and
    /// left to the lock's TTL.
    pub async fn with_lock<F, Fut, T>(&self, lock_key: &str, purpose: LockPurpose, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let acquired = self
            .acquire_blocking(lock_key, self.config.ttl, self.config.max_wait, purpose)
            .await;

        let token = match acquired {
            Ok(token) => token,
            Err(err) if purpose == LockPurpose::Efficiency => {
                info!(lock = %lock_key, error = %err, "Proceeding without efficiency lock");
                return work().await;
            }
            Err(err) => return Err(err),
        };

        let watchdog = self.config.watchdog.then(|| self.spawn_watchdog(&token));
        let result = work().await;
        drop(watchdog);

        if let Err(err) = self.release(&token).await {
            warn!(lock = %lock_key, error = %err, "Lock release failed; waiting for expiry");
        }
        result
    }
}
