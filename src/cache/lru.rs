//! LRU Tracker Module
//!
//! Bounded Least Recently Used tracking for the compiled-pattern cache of
//! the watch service.

use std::collections::VecDeque;

// == LRU Tracker ==
/// Tracks access order and keeps at most `capacity` keys.
///
/// Keys are stored in a VecDeque where:
/// - Front = Most recently used
/// - Back = Least recently used
#[derive(Debug)]
pub struct LruTracker {
    /// Order of keys by access time
    order: VecDeque<String>,
    /// Maximum number of tracked keys
    capacity: usize,
}

impl LruTracker {
    // == Constructor ==
    /// Creates a new empty tracker holding at most `capacity` keys.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    // == Touch ==
    /// Marks a key as recently used (moves to front).
    ///
    /// Returns the key pushed out of the back when the tracker overflows.
    pub fn touch(&mut self, key: &str) -> Option<String> {
        if self.order.front().is_some_and(|k| k == key) {
            return None;
        }
        self.remove(key);
        self.order.push_front(key.to_string());
        if self.order.len() > self.capacity {
            self.order.pop_back()
        } else {
            None
        }
    }

    // == Remove ==
    /// Removes a key from the tracker.
    pub fn remove(&mut self, key: &str) {
        self.order.retain(|k| k != key);
    }

    // == Keys ==
    /// Returns tracked keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
