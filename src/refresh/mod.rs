//! Refresh Module
//!
//! Per-key refresh strategies and the engine that applies them on reads.

mod engine;
mod strategy;

pub use engine::{FetchCoordination, RefreshConfig, RefreshEngine, Upstream};
pub use strategy::{draw, should_refresh_early, Decision, RefreshStrategy, SyncReason};
