//! Configuration Module
//!
//! Handles loading cache, lock and watch settings from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::lock::{LockConfig, WaitStrategy};
use crate::refresh::{RefreshConfig, RefreshStrategy};
use crate::watch::WatchConfig;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum number of entries the cache can hold
    pub max_entries: usize,
    /// Nominal TTL of fetched entries
    pub base_ttl: Duration,
    /// Fraction by which each entry's TTL is jittered
    pub ttl_jitter: f64,
    /// How long an expired entry may still be served (scheduled strategy)
    pub stale_max_age: Duration,
    /// Early-expiration aggressiveness (probabilistic strategy)
    pub refresh_beta: f64,
    /// Strategy name for keys without an explicit one
    pub default_strategy: String,
    /// Background cleanup interval
    pub cleanup_interval: Duration,
    /// Background warmer interval
    pub warm_interval: Duration,
    /// Remaining-TTL fraction that makes a hot key due for warming
    pub warm_threshold: f64,
    /// Number of hot keys tracked for warming
    pub max_hot_keys: usize,
    /// Whether upstream fetches also take a distributed lock
    pub lock_fetches: bool,
    /// Lock expiry
    pub lock_ttl: Duration,
    /// Longest wait for a held lock
    pub lock_max_wait: Duration,
    /// Polling attempts before a lock wait gives up
    pub lock_max_attempts: u32,
    /// `polling` or `signal`
    pub lock_wait_strategy: String,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    pub backoff_multiplier: f64,
    pub backoff_jitter: f64,
    /// Default long-poll timeout
    pub watch_timeout: Duration,
    pub watch_timeout_jitter: f64,
    /// Maximum number of distinct patterns with pending watches
    pub max_watch_patterns: usize,
    /// Number of compiled patterns kept
    pub pattern_cache_size: usize,
    /// Number of change records kept for catch-up
    pub revision_retention: usize,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_ENTRIES` - Maximum cache entries (default: 10000)
    /// - `BASE_TTL` - Entry TTL in seconds (default: 300)
    /// - `TTL_JITTER` - TTL jitter fraction (default: 0.1)
    /// - `STALE_MAX_AGE` - Stale budget in seconds (default: 30)
    /// - `REFRESH_BETA` - Early-expiration beta (default: 1.0)
    /// - `REFRESH_STRATEGY` - `strict`, `probabilistic` or `scheduled` (default: scheduled)
    /// - `CLEANUP_INTERVAL` - Cleanup frequency in seconds (default: 1)
    /// - `WARM_INTERVAL` - Warmer frequency in seconds (default: 5)
    /// - `WARM_THRESHOLD` - Remaining-TTL fraction for warming (default: 0.2)
    /// - `MAX_HOT_KEYS` - Tracked hot keys (default: 1024)
    /// - `LOCK_FETCHES` - Take a distributed lock around fetches (default: false)
    /// - `LOCK_TTL_MS` - Lock expiry (default: 10000)
    /// - `LOCK_MAX_WAIT_MS` - Lock wait budget (default: 5000)
    /// - `LOCK_MAX_ATTEMPTS` - Lock polling attempts (default: 10)
    /// - `LOCK_WAIT_STRATEGY` - `polling` or `signal` (default: polling)
    /// - `BACKOFF_INITIAL_MS` - First backoff delay (default: 50)
    /// - `BACKOFF_CAP_MS` - Backoff ceiling (default: 1000)
    /// - `BACKOFF_MULTIPLIER` - Backoff growth factor (default: 2.0)
    /// - `BACKOFF_JITTER` - Backoff jitter fraction (default: 0.2)
    /// - `WATCH_TIMEOUT` - Long-poll timeout in seconds (default: 60)
    /// - `WATCH_TIMEOUT_JITTER` - Timeout jitter fraction (default: 0.2)
    /// - `MAX_WATCH_PATTERNS` - Watched pattern limit (default: 1024)
    /// - `PATTERN_CACHE_SIZE` - Compiled pattern cache size (default: 256)
    /// - `REVISION_RETENTION` - Retained change records (default: 4096)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a Config from an arbitrary variable source, falling back to the
    /// default for every variable that is missing or does not parse.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let num = |name: &str, default| parse_or(&lookup, name, default);
        let secs = |name: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, name, default.as_secs()))
        };
        let millis = |name: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, name, default.as_millis() as u64))
        };

        Self {
            max_entries: num("MAX_ENTRIES", defaults.max_entries),
            base_ttl: secs("BASE_TTL", defaults.base_ttl),
            ttl_jitter: parse_or(&lookup, "TTL_JITTER", defaults.ttl_jitter),
            stale_max_age: secs("STALE_MAX_AGE", defaults.stale_max_age),
            refresh_beta: parse_or(&lookup, "REFRESH_BETA", defaults.refresh_beta),
            default_strategy: lookup("REFRESH_STRATEGY").unwrap_or(defaults.default_strategy),
            cleanup_interval: secs("CLEANUP_INTERVAL", defaults.cleanup_interval),
            warm_interval: secs("WARM_INTERVAL", defaults.warm_interval),
            warm_threshold: parse_or(&lookup, "WARM_THRESHOLD", defaults.warm_threshold),
            max_hot_keys: num("MAX_HOT_KEYS", defaults.max_hot_keys),
            lock_fetches: parse_or(&lookup, "LOCK_FETCHES", defaults.lock_fetches),
            lock_ttl: millis("LOCK_TTL_MS", defaults.lock_ttl),
            lock_max_wait: millis("LOCK_MAX_WAIT_MS", defaults.lock_max_wait),
            lock_max_attempts: parse_or(&lookup, "LOCK_MAX_ATTEMPTS", defaults.lock_max_attempts),
            lock_wait_strategy: lookup("LOCK_WAIT_STRATEGY").unwrap_or(defaults.lock_wait_strategy),
            backoff_initial: millis("BACKOFF_INITIAL_MS", defaults.backoff_initial),
            backoff_cap: millis("BACKOFF_CAP_MS", defaults.backoff_cap),
            backoff_multiplier: parse_or(&lookup, "BACKOFF_MULTIPLIER", defaults.backoff_multiplier),
            backoff_jitter: parse_or(&lookup, "BACKOFF_JITTER", defaults.backoff_jitter),
            watch_timeout: secs("WATCH_TIMEOUT", defaults.watch_timeout),
            watch_timeout_jitter: parse_or(&lookup, "WATCH_TIMEOUT_JITTER", defaults.watch_timeout_jitter),
            max_watch_patterns: num("MAX_WATCH_PATTERNS", defaults.max_watch_patterns),
            pattern_cache_size: num("PATTERN_CACHE_SIZE", defaults.pattern_cache_size),
            revision_retention: num("REVISION_RETENTION", defaults.revision_retention),
        }
    }

    // == Component Configs ==
    /// Backoff shared by lock polling, watch re-subscription and warming.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_initial, self.backoff_multiplier, self.backoff_cap)
            .with_jitter(self.backoff_jitter)
            .with_max_attempts(self.lock_max_attempts)
    }

    /// Strategy applied to keys without an explicit one.
    ///
    /// An unknown name falls back to `scheduled`.
    pub fn refresh_strategy(&self) -> RefreshStrategy {
        RefreshStrategy::from_name(&self.default_strategy, self.refresh_beta, self.stale_max_age)
            .unwrap_or_else(|| {
                warn!(strategy = %self.default_strategy, "Unknown refresh strategy, using scheduled");
                RefreshStrategy::Scheduled {
                    stale_max_age: self.stale_max_age,
                }
            })
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            base_ttl: self.base_ttl,
            ttl_jitter: self.ttl_jitter,
            default_strategy: self.refresh_strategy(),
            stale_max_age: self.stale_max_age,
            warm_threshold: self.warm_threshold,
            max_hot_keys: self.max_hot_keys,
            warm_retry: self.backoff_policy().with_max_attempts(3),
        }
    }

    pub fn lock_config(&self) -> LockConfig {
        let strategy = match self.lock_wait_strategy.trim().to_ascii_lowercase().as_str() {
            "signal" => WaitStrategy::Signal,
            "polling" => WaitStrategy::Polling(self.backoff_policy()),
            other => {
                warn!(strategy = other, "Unknown lock wait strategy, using polling");
                WaitStrategy::Polling(self.backoff_policy())
            }
        };
        LockConfig {
            ttl: self.lock_ttl,
            max_wait: self.lock_max_wait,
            strategy,
            watchdog: true,
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            default_timeout: self.watch_timeout,
            timeout_jitter: self.watch_timeout_jitter,
            max_patterns: self.max_watch_patterns,
            pattern_cache_size: self.pattern_cache_size,
            retention: self.revision_retention,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            base_ttl: Duration::from_secs(300),
            ttl_jitter: 0.1,
            stale_max_age: Duration::from_secs(30),
            refresh_beta: 1.0,
            default_strategy: "scheduled".to_string(),
            cleanup_interval: Duration::from_secs(1),
            warm_interval: Duration::from_secs(5),
            warm_threshold: 0.2,
            max_hot_keys: 1024,
            lock_fetches: false,
            lock_ttl: Duration::from_millis(10_000),
            lock_max_wait: Duration::from_millis(5_000),
            lock_max_attempts: 10,
            lock_wait_strategy: "polling".to_string(),
            backoff_initial: Duration::from_millis(50),
            backoff_cap: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
            backoff_jitter: 0.2,
            watch_timeout: Duration::from_secs(60),
            watch_timeout_jitter: 0.2,
            max_watch_patterns: 1024,
            pattern_cache_size: 256,
            revision_retention: 4096,
        }
    }
}
