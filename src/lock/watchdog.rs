//! Lock Watchdog
//!
//! Keeps a held lock alive while long work runs by resetting its expiry every
//! `ttl / 3`. Extension is owner-checked, so a watchdog never revives a lock
//! that expired and was taken by someone else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::lock::{LockStore, LockToken};
use crate::stats::{Metric, Metrics};

// == Watchdog ==
/// Handle to a running extension task. Dropping it stops the extensions.
#[derive(Debug)]
pub struct Watchdog {
    handle: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl Watchdog {
    pub(crate) fn spawn(store: Arc<dyn LockStore>, token: &LockToken, metrics: Arc<Metrics>) -> Self {
        let period = (token.ttl / 3).max(Duration::from_millis(1));
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        let lock_key = token.lock_key.clone();
        let owner = token.owner.clone();
        let ttl = token.ttl;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match store.compare_and_expire(&lock_key, &owner, ttl).await {
                    Ok(true) => {
                        metrics.record(Metric::WatchdogExtension);
                        debug!(lock = %lock_key, ttl_ms = ttl.as_millis() as u64, "Lock extended");
                    }
                    Ok(false) => {
                        flag.store(true, Ordering::SeqCst);
                        warn!(lock = %lock_key, "Watchdog lost lock ownership, stopping");
                        break;
                    }
                    Err(err) => {
                        // Keep trying; the lock survives until its TTL runs out.
                        warn!(lock = %lock_key, error = %err, "Lock extension failed");
                    }
                }
            }
        });

        Self { handle, lost }
    }

    /// True once an extension found the lock owned by someone else.
    pub fn lost_ownership(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stops extending the lock.
    pub fn stop(self) {}
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
