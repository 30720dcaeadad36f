//! Stale Entry Cleanup Task
//!
//! Background task that periodically removes entries whose stale budget has
//! run out.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::refresh::RefreshEngine;

/// Spawns a background task that periodically purges dead cache entries.
///
/// An entry is dead once it has been expired for longer than the engine's
/// stale budget; no strategy would serve it any more.
///
/// # Arguments
/// * `engine` - Engine whose store is purged
/// * `interval` - Time between cleanup runs
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during shutdown.
pub fn spawn_cleanup_task<V>(engine: RefreshEngine<V>, interval: Duration) -> JoinHandle<()>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!(?interval, "Starting cache cleanup task");

        loop {
            tokio::time::sleep(interval).await;

            let removed = engine.purge_expired();
            if removed > 0 {
                info!(removed, remaining = engine.len(), "Cleanup removed dead entries");
            } else {
                debug!("Cleanup found no dead entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::cache::CacheStore;
    use crate::refresh::{RefreshConfig, Upstream};
    use crate::stats::Metrics;

    struct Constant;

    #[async_trait]
    impl Upstream<String> for Constant {
        async fn fetch(&self, key: &str) -> anyhow::Result<String> {
            Ok(format!("value of {key}"))
        }
    }

    fn engine(ttl_secs: u64) -> RefreshEngine<String> {
        let metrics = Arc::new(Metrics::new());
        let config = RefreshConfig {
            base_ttl: Duration::from_secs(ttl_secs),
            ttl_jitter: 0.0,
            stale_max_age: Duration::from_secs(2),
            ..RefreshConfig::default()
        };
        RefreshEngine::new(
            Arc::new(CacheStore::new(100, metrics.clone())),
            Arc::new(Constant),
            config,
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_removes_dead_entries() {
        let engine = engine(1);
        engine.get("expire_soon").await.unwrap();

        let handle = spawn_cleanup_task(engine.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(4500)).await;

        assert!(engine.peek("expire_soon").is_none(), "Dead entry should have been cleaned up");
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_keeps_stale_entries_within_budget() {
        let engine = engine(1);
        engine.get("recently_stale").await.unwrap();

        let handle = spawn_cleanup_task(engine.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(engine.peek("recently_stale").is_some(), "Entry within stale budget should stay");
        handle.abort();
    }

    #[tokio::test]
    async fn test_cleanup_task_can_be_aborted() {
        let handle = spawn_cleanup_task(engine(60), Duration::from_secs(1));

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
