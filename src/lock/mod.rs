//! Lock Module
//!
//! Cross-process mutual exclusion for upstream fetches, built on a shared
//! store offering set-if-absent with expiry, compare-and-delete and a FIFO
//! queue of waiting owners that a release hands the lock to.
//!
//! Every lock call site states a [`LockPurpose`]. Efficiency locks only
//! avoid duplicate work, so a caller that cannot get one may go ahead
//! without it. Correctness locks protect data integrity and must fail
//! instead.

mod manager;
mod memory;
mod store;
mod watchdog;

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::backoff::BackoffPolicy;

pub use manager::LockManager;
pub use memory::MemoryLockStore;
pub use store::LockStore;
pub use watchdog::Watchdog;

// == Lock Purpose ==
/// Why a caller takes a lock, which decides what happens when it can't.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockPurpose {
    /// Duplicate-work avoidance; on timeout the work runs unlocked.
    Efficiency,
    /// Data integrity; on timeout the operation fails.
    Correctness,
}

impl fmt::Display for LockPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockPurpose::Efficiency => write!(f, "efficiency"),
            LockPurpose::Correctness => write!(f, "correctness"),
        }
    }
}

// == Wait Strategy ==
/// How `acquire_blocking` waits for a held lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitStrategy {
    /// Sleep with backoff between attempts.
    Polling(BackoffPolicy),
    /// Queue on the lock; a release hands ownership to the oldest waiter.
    Signal,
}

// == Lock Config ==
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lock expiry, renewed every `ttl / 3` while a watchdog runs
    pub ttl: Duration,
    /// Longest `with_lock` waits for the lock
    pub max_wait: Duration,
    pub strategy: WaitStrategy,
    /// Whether `with_lock` keeps the lock alive while the work runs
    pub watchdog: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            max_wait: Duration::from_secs(5),
            strategy: WaitStrategy::Polling(BackoffPolicy::default()),
            watchdog: true,
        }
    }
}

// == Lock Token ==
/// Proof of ownership returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    /// Store key of the lock
    pub lock_key: String,
    /// Unique value stored under `lock_key` while this token owns it
    pub owner: String,
    pub ttl: Duration,
    pub acquired_at: Instant,
}

// == Key Derivation ==
/// Lock key guarding fetches of `cache_key`.
pub fn lock_key(cache_key: &str) -> String {
    format!("lock:{cache_key}")
}

/// Wait queue paired with `lock_key`.
pub fn queue_key(lock_key: &str) -> String {
    format!("{lock_key}:queue")
}
