//! Watch Module
//!
//! Change notification with revision cursors. A subscriber blocks until a
//! change to a matching path is committed after the revision it last saw,
//! and uses that signal to refresh its local cache.

mod pattern;
mod registry;
mod revision;
mod service;
mod subscription;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use pattern::{PathPattern, PatternCache};
pub use revision::{ChangeRecord, Revision, RevisionLog};
pub use service::{WatchConfig, WatchService};
pub use subscription::Subscription;

use crate::error::Result;

// == Change Feed ==
/// Source of change notifications consumed by the watch subscriber task.
///
/// [`WatchService`] implements it in-process; a remote implementation would
/// speak the long-poll contract in [`crate::models`].
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Waits for a change to `pattern` after `last_known`.
    async fn watch(&self, last_known: Revision, pattern: &str, timeout: Duration) -> Result<Revision>;

    /// Change records in `(after, upto]`, None if no longer available.
    async fn changes_between(
        &self,
        after: Revision,
        upto: Revision,
    ) -> Result<Option<Vec<Arc<ChangeRecord>>>>;
}
