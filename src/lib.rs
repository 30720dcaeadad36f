//! Stampede Guard - A coordinated read-through cache
//!
//! Protects a slow upstream from cache stampedes: concurrent misses share one
//! fetch, expiring entries are refreshed early or in the background, fetches
//! can be serialized across processes with owner-token locks, and a
//! revision-cursor watch service tells peers when to refresh.

pub mod backoff;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod layer;
pub mod lock;
pub mod logging;
pub mod models;
pub mod refresh;
pub mod stats;
pub mod tasks;
pub mod watch;

pub use backoff::BackoffPolicy;
pub use coalesce::Coalescer;
pub use config::Config;
pub use error::{CacheError, Result};
pub use layer::{BackgroundTasks, CacheLayer};
pub use lock::{LockManager, LockPurpose, LockToken, MemoryLockStore};
pub use refresh::{RefreshEngine, RefreshStrategy, Upstream};
pub use stats::{CacheStats, Metrics};
pub use watch::{Revision, Subscription, WatchService};
