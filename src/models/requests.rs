//! Request DTOs for the watch long-poll
//!
//! Defines the structure of incoming long-poll request bodies.

use serde::Deserialize;

use crate::error::{CacheError, Result};
use crate::watch::Revision;

/// Longest wait a client may ask for in one long-poll
pub const MAX_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Request body for one long-poll round
///
/// # Fields
/// - `last_known_revision`: Newest revision the client has applied
/// - `pattern`: Comma-separated path globs to watch
/// - `timeout_ms`: Optional wait budget in milliseconds (server default if not specified)
#[derive(Debug, Clone, Deserialize)]
pub struct WatchRequest {
    /// Revision cursor
    #[serde(default)]
    pub last_known_revision: Revision,
    /// Path pattern
    pub pattern: String,
    /// Optional timeout hint in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WatchRequest {
    /// Validates the request data
    pub fn validate(&self) -> Result<()> {
        if self.pattern.trim().is_empty() {
            return Err(CacheError::InvalidRequest(
                "Pattern cannot be empty".to_string(),
            ));
        }
        match self.timeout_ms {
            Some(0) => Err(CacheError::InvalidRequest(
                "Timeout must be positive".to_string(),
            )),
            Some(ms) if ms > MAX_TIMEOUT_MS => Err(CacheError::InvalidRequest(format!(
                "Timeout exceeds maximum of {} ms",
                MAX_TIMEOUT_MS
            ))),
            _ => Ok(()),
        }
    }
}
