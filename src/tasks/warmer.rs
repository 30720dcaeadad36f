//! Hot Key Warmer Task
//!
//! Refreshes recently read keys shortly before they expire, independent of
//! request traffic, so popular keys rarely hit a synchronous fetch.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::refresh::RefreshEngine;

/// Spawns a task running `RefreshEngine::warm_once` every `interval`.
///
/// A pass that runs long delays the next one instead of bunching them up.
pub fn spawn_warmer_task<V>(engine: RefreshEngine<V>, interval: Duration) -> JoinHandle<()>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!(?interval, threshold = engine.config().warm_threshold, "Starting warmer task");

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let warmed = engine.warm_once().await;
            debug!(warmed, hot = engine.hot_keys().len(), "Warmer tick");
        }
    })
}
