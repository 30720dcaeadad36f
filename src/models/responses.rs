//! Response DTOs for the watch long-poll
//!
//! Defines the structure of outgoing long-poll response bodies.

use serde::Serialize;

use crate::watch::Revision;

/// Response body for one long-poll round
///
/// Serialized with a `status` tag:
/// - `{"status":"not_modified","revision":7}` when the wait timed out
/// - `{"status":"changed","revision":8,"paths":["/config/db.json"]}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WatchResponse {
    /// No matching change before the timeout; `revision` is the current head
    NotModified { revision: Revision },
    /// A matching change was committed
    Changed {
        /// Revision the client should store as its new cursor
        revision: Revision,
        /// Matching paths changed since the client's cursor
        paths: Vec<String>,
    },
}

impl WatchResponse {
    /// Revision the client should continue from.
    pub fn revision(&self) -> Revision {
        match self {
            WatchResponse::NotModified { revision } => *revision,
            WatchResponse::Changed { revision, .. } => *revision,
        }
    }
}
