//! Revision Log
//!
//! Monotonic revision numbers and a fixed-capacity ring of committed change
//! records with O(1) lookup by revision.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// == Revision ==
/// Monotonically increasing change counter. `Revision(0)` means "nothing
/// committed yet"; the first commit is revision 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const INIT: Revision = Revision(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Revision {
        Revision(self.0.saturating_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// == Change Record ==
/// The paths touched by one committed revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub revision: Revision,
    pub paths: Vec<String>,
    pub committed_at: DateTime<Utc>,
}

// == Revision Log ==
/// Ring buffer of the most recent `capacity` change records.
///
/// Record `r` lives at `records[r - first]`, so lookups never scan.
#[derive(Debug)]
pub struct RevisionLog {
    records: VecDeque<Arc<ChangeRecord>>,
    capacity: usize,
    head: Revision,
}

impl RevisionLog {
    // == Constructor ==
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            head: Revision::INIT,
        }
    }

    // == Append ==
    /// Commits a new revision touching `paths` and returns its record.
    ///
    /// The head only moves after the record is stored, so a reader that sees
    /// revision N can always look it up (until it falls out of the window).
    pub fn append(&mut self, paths: Vec<String>) -> Arc<ChangeRecord> {
        let record = Arc::new(ChangeRecord {
            revision: self.head.next(),
            paths,
            committed_at: Utc::now(),
        });
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(Arc::clone(&record));
        self.head = record.revision;
        record
    }

    // == Accessors ==
    /// Latest committed revision.
    pub fn head(&self) -> Revision {
        self.head
    }

    /// Oldest revision still retained, None before the first commit.
    pub fn oldest(&self) -> Option<Revision> {
        self.records.front().map(|record| record.revision)
    }

    /// Looks up one revision.
    pub fn get(&self, revision: Revision) -> Option<Arc<ChangeRecord>> {
        let first = self.oldest()?;
        if revision < first || revision > self.head {
            return None;
        }
        let index = (revision.0 - first.0) as usize;
        self.records.get(index).cloned()
    }

    /// Returns true when every revision after `after` is still retained.
    pub fn covers(&self, after: Revision) -> bool {
        match self.oldest() {
            Some(first) => after >= Revision(first.0 - 1),
            None => true,
        }
    }

    /// Records with a revision in `(after, upto]`, oldest first.
    ///
    /// Returns None if part of that range has already been dropped.
    pub fn between(&self, after: Revision, upto: Revision) -> Option<Vec<Arc<ChangeRecord>>> {
        if !self.covers(after) {
            return None;
        }
        let upto = upto.min(self.head);
        let out = (after.0..upto.0)
            .filter_map(|value| self.get(Revision(value + 1)))
            .collect();
        Some(out)
    }

    /// Newest record after `after` for which `matches` holds.
    pub fn latest_matching<F>(&self, after: Revision, mut matches: F) -> Option<Revision>
    where
        F: FnMut(&ChangeRecord) -> bool,
    {
        self.records
            .iter()
            .rev()
            .take_while(|record| record.revision > after)
            .find(|record| matches(record))
            .map(|record| record.revision)
    }
}
