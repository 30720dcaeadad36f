//! Request Coalescer Module
//!
//! Singleflight for cache misses: concurrent fetches for the same key share
//! one upstream invocation and observe the same result or the same error.
//!
//! The loader future is spawned onto the runtime instead of being polled by
//! the first caller, so any caller (the first one included) can time out or be
//! cancelled without affecting the callers still waiting on the result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::stats::{Metric, Metrics};

type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

// == In-Flight Request ==
/// One running fetch and the callers attached to it.
struct InFlightRequest<V> {
    id: u64,
    result: SharedResult<V>,
    joiners: Arc<AtomicUsize>,
}

/// Removes the in-flight entry when the fetch task ends, even by panic.
struct InFlightGuard<V> {
    in_flight: Arc<DashMap<String, InFlightRequest<V>>>,
    key: String,
    id: u64,
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        self.in_flight.remove_if(&self.key, |_, request| request.id == self.id);
    }
}

// == Coalescer ==
/// De-duplicates concurrent fetches keyed by cache key.
pub struct Coalescer<V> {
    in_flight: Arc<DashMap<String, InFlightRequest<V>>>,
    next_id: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
}

impl<V> Clone for Coalescer<V> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
            next_id: Arc::clone(&self.next_id),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<V> std::fmt::Debug for Coalescer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl<V> Coalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    // == Fetch ==
    /// Runs `loader` once per overlapping demand window for `key`.
    ///
    /// The first caller registers the fetch and spawns the loader's future;
    /// every caller arriving before it completes awaits the same result. On
    /// completion the entry is removed before the result is published, so a
    /// caller arriving afterwards starts a new fetch.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn fetch<F, Fut>(&self, key: &str, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.start_or_join(key, loader, true).await
    }

    /// Starts a new fetch for `key` even if one is already running.
    ///
    /// Callers already waiting on the older fetch keep its result; callers
    /// arriving afterwards join this one.
    pub async fn fetch_newer<F, Fut>(&self, key: &str, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.start_or_join(key, loader, false).await
    }

    async fn start_or_join<F, Fut>(&self, key: &str, loader: F, join: bool) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (result, leader) = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(occupied) if join => {
                let request = occupied.get();
                let joiners = request.joiners.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.record(Metric::CoalescedJoin);
                debug!(key, joiners, "Joined in-flight fetch");
                (request.result.clone(), None)
            }
            Entry::Occupied(mut occupied) => {
                debug!(key, "Superseding in-flight fetch");
                let (request, tx) = self.new_request(key);
                let result = request.result.clone();
                let id = request.id;
                occupied.insert(request);
                (result, Some((id, tx)))
            }
            Entry::Vacant(vacant) => {
                let (request, tx) = self.new_request(key);
                let result = request.result.clone();
                let id = request.id;
                vacant.insert(request);
                (result, Some((id, tx)))
            }
        };

        if let Some((id, tx)) = leader {
            self.spawn_fetch(key, id, tx, loader());
        }

        result.await
    }

    fn new_request(&self, key: &str) -> (InFlightRequest<V>, oneshot::Sender<Result<V>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel::<Result<V>>();
        let abandoned = key.to_string();
        let result = rx
            .map(move |received| received.unwrap_or(Err(CacheError::FetchAbandoned(abandoned))))
            .boxed()
            .shared();
        let request = InFlightRequest {
            id,
            result,
            joiners: Arc::new(AtomicUsize::new(1)),
        };
        (request, tx)
    }

    fn spawn_fetch<Fut>(&self, key: &str, id: u64, tx: oneshot::Sender<Result<V>>, fut: Fut)
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.to_string(),
            id,
        };
        let metrics = Arc::clone(&self.metrics);
        metrics.record(Metric::UpstreamFetch);
        debug!(key, "Starting coalesced fetch");

        tokio::spawn(async move {
            let result = fut.await;
            let key = guard.key.clone();
            drop(guard);

            if let Err(err) = &result {
                metrics.record(Metric::UpstreamError);
                warn!(key = %key, error = %err, "Coalesced fetch failed");
            }
            // Nobody listening is fine: every caller may have given up.
            let _ = tx.send(result);
        });
    }

    // == Inspection ==
    /// Number of fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of callers attached to the running fetch for `key`.
    pub fn joiner_count(&self, key: &str) -> Option<usize> {
        self.in_flight
            .get(key)
            .map(|request| request.joiners.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn coalescer() -> Coalescer<String> {
        Coalescer::new(Arc::new(Metrics::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let coalescer = coalescer();
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let coalescer = coalescer.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coalescer
                    .fetch("cfg:db", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok("v1".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "v1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_fans_out_identically() {
        let coalescer = coalescer();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coalescer = coalescer.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .fetch("cfg:db", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(CacheError::UpstreamFetch {
                            key: "cfg:db".to_string(),
                            message: "down".to_string(),
                        })
                    })
                    .await
            }));
        }

        let mut errors = Vec::new();
        for handle in handles {
            errors.push(handle.await.unwrap().unwrap_err());
        }
        assert!(errors.windows(2).all(|pair| pair[0] == pair[1]));
        assert!(matches!(errors[0], CacheError::UpstreamFetch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_count_tracks_attached_callers() {
        let coalescer = coalescer();

        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .fetch("k", || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok("v".to_string())
                    })
                    .await
            })
        };
        let joiner = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.fetch("k", || async { Ok("other".to_string()) }).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coalescer.joiner_count("k"), Some(2));

        assert_eq!(leader.await.unwrap().unwrap(), "v");
        assert_eq!(joiner.await.unwrap().unwrap(), "v");
        assert_eq!(coalescer.joiner_count("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_does_not_disturb_joiners() {
        let coalescer = coalescer();

        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .fetch("k", || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok("v".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let joiner = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.fetch("k", || async { Ok("late".to_string()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        assert_eq!(joiner.await.unwrap().unwrap(), "v");
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_fetch_supersedes_running_one() {
        let coalescer = coalescer();

        let older = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .fetch("k", || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok("old".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let newer = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .fetch_newer("k", || async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Ok("new".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let late = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.fetch("k", || async { Ok("late".to_string()) }).await })
        };

        assert_eq!(older.await.unwrap().unwrap(), "old");
        // The older fetch finishing must not remove the newer entry.
        assert_eq!(coalescer.in_flight(), 1);
        assert_eq!(newer.await.unwrap().unwrap(), "new");
        assert_eq!(late.await.unwrap().unwrap(), "new");
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_fetches_invoke_loader_again() {
        let coalescer = coalescer();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            coalescer
                .fetch("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("v".to_string())
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_loader_reports_abandoned_and_cleans_up() {
        let coalescer = coalescer();

        let result = coalescer
            .fetch("k", || async {
                if true {
                    panic!("loader exploded");
                }
                Ok("unreachable".to_string())
            })
            .await;

        assert_eq!(result, Err(CacheError::FetchAbandoned("k".to_string())));
        assert_eq!(coalescer.in_flight(), 0);
    }
}
