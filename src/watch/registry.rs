//! Watch Registry
//!
//! Pending watches grouped by pattern. The registry itself is plain data; the
//! service wraps it in a single mutex and resolves removed watches only after
//! releasing that mutex.
//!
//! Removal is the terminal transition of a watch: whichever of notify,
//! timeout or cancel removes the entry first owns its outcome.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{CacheError, Result};
use crate::watch::{PathPattern, Revision};

// == Watch Entry ==
/// One registered watch.
#[derive(Debug)]
pub(crate) struct WatchEntry {
    pub id: u64,
    pub last_known: Revision,
    pub registered_at: Instant,
    pub deadline: Instant,
    pub tx: oneshot::Sender<Result<Revision>>,
    pub timer: Option<AbortHandle>,
}

impl WatchEntry {
    /// Completes the watch and stops its timeout timer.
    pub fn resolve(self, outcome: Result<Revision>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The subscriber may already be gone.
        let _ = self.tx.send(outcome);
    }
}

#[derive(Debug)]
struct PatternWatches {
    pattern: Arc<PathPattern>,
    watches: Vec<WatchEntry>,
}

// == Watch Registry ==
#[derive(Debug)]
pub(crate) struct WatchRegistry {
    by_pattern: HashMap<String, PatternWatches>,
    max_patterns: usize,
    next_id: u64,
    len: usize,
}

impl WatchRegistry {
    pub fn new(max_patterns: usize) -> Self {
        Self {
            by_pattern: HashMap::new(),
            max_patterns: max_patterns.max(1),
            next_id: 0,
            len: 0,
        }
    }

    /// Allocates an id for a watch about to be registered.
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Adds a watch under its pattern.
    ///
    /// Fails with `RegistryFull` when the pattern is new and the registry
    /// already tracks `max_patterns` distinct patterns.
    pub fn register(&mut self, pattern: Arc<PathPattern>, entry: WatchEntry) -> Result<()> {
        let key = pattern.as_str().to_string();
        if !self.by_pattern.contains_key(&key) && self.by_pattern.len() >= self.max_patterns {
            return Err(CacheError::RegistryFull {
                limit: self.max_patterns,
            });
        }
        self.by_pattern
            .entry(key)
            .or_insert_with(|| PatternWatches {
                pattern,
                watches: Vec::new(),
            })
            .watches
            .push(entry);
        self.len += 1;
        Ok(())
    }

    /// Attaches the timeout timer to a still-registered watch.
    ///
    /// Returns false if the watch already left the registry.
    pub fn attach_timer(&mut self, pattern: &str, id: u64, timer: AbortHandle) -> bool {
        let entry = self
            .by_pattern
            .get_mut(pattern)
            .and_then(|group| group.watches.iter_mut().find(|w| w.id == id));
        match entry {
            Some(entry) => {
                entry.timer = Some(timer);
                true
            }
            None => false,
        }
    }

    /// Removes one watch.
    pub fn remove(&mut self, pattern: &str, id: u64) -> Option<WatchEntry> {
        let group = self.by_pattern.get_mut(pattern)?;
        let index = group.watches.iter().position(|w| w.id == id)?;
        let entry = group.watches.swap_remove(index);
        if group.watches.is_empty() {
            self.by_pattern.remove(pattern);
        }
        self.len -= 1;
        Some(entry)
    }

    /// Removes every watch whose pattern matches one of `paths` and whose
    /// cursor is older than `revision`.
    pub fn take_matching(&mut self, paths: &[String], revision: Revision) -> Vec<WatchEntry> {
        let mut taken = Vec::new();
        self.by_pattern.retain(|_, group| {
            if !group.pattern.matches_any(paths) {
                return true;
            }
            let (fire, keep): (Vec<_>, Vec<_>) = group
                .watches
                .drain(..)
                .partition(|w| w.last_known < revision);
            taken.extend(fire);
            group.watches = keep;
            !group.watches.is_empty()
        });
        self.len -= taken.len();
        taken
    }

    /// Removes every watch.
    pub fn drain(&mut self) -> Vec<WatchEntry> {
        self.len = 0;
        self.by_pattern
            .drain()
            .flat_map(|(_, group)| group.watches)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn pattern_count(&self) -> usize {
        self.by_pattern.len()
    }
}
