//! In-Memory Lock Store
//!
//! A single-process [`LockStore`] with the same semantics a shared store
//! provides: expiring values, atomic compare operations and a FIFO queue of
//! owners waiting for a handoff. Used by tests and by deployments where every
//! cache instance lives in one process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Result;
use crate::lock::LockStore;

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// An owner queued for a lock. A closed `wake` means the waiter is gone.
#[derive(Debug)]
struct Waiter {
    owner: String,
    ttl: Duration,
    wake: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct StoreState {
    values: HashMap<String, StoredValue>,
    /// Waiters per queue, oldest first
    queues: HashMap<String, VecDeque<Waiter>>,
}

impl StoreState {
    /// The live value under `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut StoredValue> {
        if self.values.get(key).is_some_and(|stored| stored.expires_at <= now) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn owned_by(&mut self, key: &str, expected: &str, now: Instant) -> bool {
        self.live(key, now).is_some_and(|stored| stored.value == expected)
    }

    fn store(&mut self, key: &str, value: &str, ttl: Duration, now: Instant) {
        self.values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
    }

    /// Gives the free `key` to the oldest waiter still listening on `queue`.
    ///
    /// Returns true if someone got it.
    fn hand_to_next(&mut self, key: &str, queue: &str, now: Instant) -> bool {
        let Some(waiters) = self.queues.get_mut(queue) else {
            return false;
        };
        let mut granted = None;
        while let Some(waiter) = waiters.pop_front() {
            if waiter.wake.send(()).is_ok() {
                granted = Some((waiter.owner, waiter.ttl));
                break;
            }
        }
        if waiters.is_empty() {
            self.queues.remove(queue);
        }

        match granted {
            Some((owner, ttl)) => {
                self.store(key, &owner, ttl, now);
                true
            }
            None => false,
        }
    }

    /// Queues `owner`, or refreshes its wake channel if it is already queued.
    fn enqueue(&mut self, queue: &str, owner: &str, ttl: Duration, wake: oneshot::Sender<()>) {
        let waiters = self.queues.entry(queue.to_string()).or_default();
        waiters.retain(|waiter| waiter.owner == owner || !waiter.wake.is_closed());
        match waiters.iter_mut().find(|waiter| waiter.owner == owner) {
            Some(waiter) => waiter.wake = wake,
            None => waiters.push_back(Waiter {
                owner: owner.to_string(),
                ttl,
                wake,
            }),
        }
    }

    fn leave(&mut self, queue: &str, owner: &str) {
        if let Some(waiters) = self.queues.get_mut(queue) {
            waiters.retain(|waiter| waiter.owner != owner && !waiter.wake.is_closed());
            if waiters.is_empty() {
                self.queues.remove(queue);
            }
        }
    }
}

// == Memory Lock Store ==
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    state: Mutex<StoreState>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of owners currently waiting on `queue`.
    pub fn waiting(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |waiters| {
            waiters.iter().filter(|waiter| !waiter.wake.is_closed()).count()
        })
    }

    /// Number of queues holding at least one entry.
    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state();
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.store(key, value, ttl, now);
        Ok(true)
    }

    async fn set_if_free(&self, key: &str, value: &str, ttl: Duration, queue: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state();
        if state.live(key, now).is_some() || state.hand_to_next(key, queue, now) {
            return Ok(false);
        }
        state.store(key, value, ttl, now);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.state();
        if !state.owned_by(key, expected, Instant::now()) {
            return Ok(false);
        }
        state.values.remove(key);
        Ok(true)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state();
        match state.live(key, now) {
            Some(stored) if stored.value == expected => {
                stored.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_and_handoff(&self, key: &str, expected: &str, queue: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state();
        if !state.owned_by(key, expected, now) {
            return Ok(false);
        }
        state.values.remove(key);
        state.hand_to_next(key, queue, now);
        Ok(true)
    }

    async fn acquire_or_wait(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        queue: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        // Kept alive between rounds so the queued entry never looks abandoned.
        let mut wake: Option<oneshot::Receiver<()>> = None;

        loop {
            let wake_at = {
                let now = Instant::now();
                let mut state = self.state();
                if state.live(key, now).is_none() {
                    // A holder that expired without releasing: serve the queue.
                    state.hand_to_next(key, queue, now);
                    if state.live(key, now).is_none() {
                        state.leave(queue, owner);
                        state.store(key, owner, ttl, now);
                        return Ok(true);
                    }
                }
                if state.owned_by(key, owner, now) {
                    state.leave(queue, owner);
                    return Ok(true);
                }
                if now >= deadline {
                    state.leave(queue, owner);
                    return Ok(false);
                }

                let (tx, rx) = oneshot::channel();
                state.enqueue(queue, owner, ttl, tx);
                // The previous receiver is dropped only now, after the swap.
                drop(wake.replace(rx));
                // Wake when the holder's lease runs out to catch a dead holder.
                state
                    .live(key, now)
                    .map_or(deadline, |stored| stored.expires_at.min(deadline))
            };

            if let Some(rx) = wake.as_mut() {
                let _ = tokio::time::timeout_at(wake_at, rx).await;
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self.state().live(key, now).map(|stored| stored.value.clone()))
    }
}
