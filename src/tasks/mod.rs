//! Background Tasks Module
//!
//! Long-running tasks spawned next to the cache.
//!
//! # Tasks
//! - Cleanup: drops entries stale beyond the stale budget
//! - Warmer: refreshes hot keys before they expire
//! - Watch subscriber: refreshes keys when a change feed reports them

mod cleanup;
mod subscriber;
mod warmer;

pub use cleanup::spawn_cleanup_task;
pub use subscriber::spawn_watch_subscriber;
pub use warmer::spawn_warmer_task;
