//! Error types for the coordinated cache
//!
//! Provides unified error handling using thiserror.

use std::time::Duration;

use thiserror::Error;

use crate::lock::LockPurpose;

// == Cache Error Enum ==
/// Unified error type for the coordinated cache.
///
/// The type is `Clone` so that one upstream failure can be handed to every
/// caller that joined the same coalesced fetch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream data source failed
    #[error("Upstream fetch failed for '{key}': {message}")]
    UpstreamFetch { key: String, message: String },

    /// The task running a coalesced fetch ended without producing a result
    #[error("In-flight fetch for '{0}' was abandoned")]
    FetchAbandoned(String),

    /// A blocking lock acquisition gave up
    #[error("Timed out after {waited:?} acquiring {purpose} lock '{key}'")]
    LockTimeout {
        key: String,
        purpose: LockPurpose,
        waited: Duration,
    },

    /// No matching change arrived before the watch deadline
    #[error("No change observed within {after:?}")]
    WatchTimeout { after: Duration },

    /// The watch was cancelled by its owner or the service shut down
    #[error("Watch cancelled")]
    WatchCancelled,

    /// The watch registry holds the maximum number of distinct patterns
    #[error("Watch registry full: at most {limit} distinct patterns")]
    RegistryFull { limit: usize },

    /// A watch path pattern could not be compiled
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Wraps an upstream failure, keeping the whole context chain.
    pub fn upstream(key: &str, err: &anyhow::Error) -> Self {
        CacheError::UpstreamFetch {
            key: key.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// Returns true for the "no change observed" terminal state of a watch.
    pub fn is_watch_timeout(&self) -> bool {
        matches!(self, CacheError::WatchTimeout { .. })
    }
}

// == Result Type Alias ==
/// Convenience Result type for the coordinated cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("loading cfg:db");
        let cache_err = CacheError::upstream("cfg:db", &err);

        assert_eq!(
            cache_err,
            CacheError::UpstreamFetch {
                key: "cfg:db".to_string(),
                message: "loading cfg:db: connection refused".to_string(),
            }
        );
    }

    #[test]
    fn test_watch_timeout_is_not_a_failure_variant() {
        let timeout = CacheError::WatchTimeout {
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_watch_timeout());
        assert!(!CacheError::WatchCancelled.is_watch_timeout());
    }

    #[test]
    fn test_lock_timeout_message_names_purpose() {
        let err = CacheError::LockTimeout {
            key: "lock:a".to_string(),
            purpose: LockPurpose::Correctness,
            waited: Duration::from_millis(500),
        };
        assert!(err.to_string().contains("correctness"));
    }
}
