//! Lock Store Trait
//!
//! The primitives the lock manager needs from a shared store. Each method
//! must be a single atomic operation on the store side; a Redis
//! implementation maps them to `SET NX PX` and small Lua scripts over the
//! lock key and a list of queued owner tokens, with waiters blocking on a
//! per-owner grant list via `BLPOP`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Stores `value` under `key` with expiry `ttl` unless `key` holds a live
    /// value. Returns true if stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Like `set_if_absent`, but a free `key` goes to the oldest owner
    /// queued on `queue` first. Returns true only if `value` was stored.
    async fn set_if_free(&self, key: &str, value: &str, ttl: Duration, queue: &str) -> Result<bool>;

    /// Deletes `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Resets the expiry of `key` to `ttl` only if it currently holds
    /// `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// If `key` holds `expected`, hands it to the oldest owner queued on
    /// `queue` (with that owner's TTL) and wakes it, or deletes `key` when
    /// nobody is queued. Ownership never passes through an empty key.
    async fn release_and_handoff(&self, key: &str, expected: &str, queue: &str) -> Result<bool>;

    /// Takes `key` for `owner` if it is free and nobody is queued ahead;
    /// otherwise queues `owner` on `queue` and waits up to `timeout` for a
    /// handoff. A waiter keeps its place until it is served, times out or is
    /// dropped. Returns true once `key` holds `owner`.
    async fn acquire_or_wait(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        queue: &str,
        timeout: Duration,
    ) -> Result<bool>;

    /// Current live value of `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;
}
