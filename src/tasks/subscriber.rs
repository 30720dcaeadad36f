//! Watch Subscriber Task
//!
//! Client side of the change feed. Long-polls for changes to a pattern and
//! refreshes the affected keys that are cached locally. Failed polls are
//! retried with the same backoff used for lock polling so an outage of the
//! feed does not turn into a reconnect storm.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::refresh::RefreshEngine;
use crate::watch::{ChangeFeed, PathPattern, Revision};

/// Spawns the subscriber loop for `pattern`.
///
/// # Arguments
/// * `feed` - Source of change notifications
/// * `engine` - Cache whose entries are refreshed on change
/// * `pattern` - Comma-separated path globs to follow
/// * `timeout` - Long-poll timeout per watch
/// * `backoff` - Delay schedule between polls after failures
///
/// The loop ends only if `pattern` does not compile.
pub fn spawn_watch_subscriber<V>(
    feed: Arc<dyn ChangeFeed>,
    engine: RefreshEngine<V>,
    pattern: String,
    timeout: Duration,
    backoff: BackoffPolicy,
) -> JoinHandle<()>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let compiled = match PathPattern::compile(&pattern) {
            Ok(compiled) => compiled,
            Err(err) => {
                warn!(pattern = %pattern, error = %err, "Watch subscriber not started");
                return;
            }
        };
        info!(pattern = %pattern, ?timeout, "Starting watch subscriber");

        let mut cursor = Revision::INIT;
        let mut delays = backoff.iter();

        loop {
            match feed.watch(cursor, &pattern, timeout).await {
                Ok(revision) => {
                    delays.reset();
                    apply_change(feed.as_ref(), &engine, &compiled, cursor, revision).await;
                    cursor = revision;
                }
                Err(err) if err.is_watch_timeout() => {
                    debug!(pattern = %pattern, %cursor, "No change before timeout");
                    tokio::time::sleep(backoff.delay(0)).await;
                }
                Err(err) => {
                    // A capped policy keeps waiting at its last delay.
                    let delay = delays
                        .next()
                        .unwrap_or_else(|| backoff.delay(delays.attempts()));
                    let failures = delays.attempts();
                    warn!(pattern = %pattern, error = %err, failures, ?delay, "Watch failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    })
}

/// Refreshes the cached keys touched between `cursor` and `revision`.
///
/// When the feed no longer has that range, every cached key matching the
/// pattern is invalidated instead so the next read fetches it.
async fn apply_change<V>(
    feed: &dyn ChangeFeed,
    engine: &RefreshEngine<V>,
    pattern: &PathPattern,
    cursor: Revision,
    revision: Revision,
) where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    let records = match feed.changes_between(cursor, revision).await {
        Ok(Some(records)) => records,
        Ok(None) => {
            invalidate_all(engine, pattern, revision);
            return;
        }
        Err(err) => {
            warn!(%revision, error = %err, "Could not read change records");
            invalidate_all(engine, pattern, revision);
            return;
        }
    };

    let changed: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.paths.iter())
        .filter(|path| pattern.matches(path))
        .map(String::as_str)
        .collect();

    for key in changed {
        if engine.peek(key).is_none() {
            continue;
        }
        match engine.refresh_changed(key).await {
            Ok(_) => debug!(key, %revision, "Refreshed after change"),
            Err(err) => {
                warn!(key, %revision, error = %err, "Refresh after change failed, invalidating");
                let _ = engine.invalidate(key);
            }
        }
    }
}

fn invalidate_all<V>(engine: &RefreshEngine<V>, pattern: &PathPattern, revision: Revision)
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    match engine.invalidate_matching(pattern.as_str()) {
        Ok(removed) => info!(%revision, removed, "Change history lost, invalidated matching keys"),
        Err(err) => warn!(%revision, error = %err, "Invalidation after lost history failed"),
    }
}
