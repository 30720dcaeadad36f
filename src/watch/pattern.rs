//! Path Patterns
//!
//! Comma-separated glob alternatives matched against change paths, plus a
//! bounded LRU cache of compiled patterns.
//!
//! Each alternative that does not start with `/` is anchored anywhere by
//! prefixing `/**/`. `**` spans any number of path segments and `*` stays
//! within one segment. Paths without a leading `/` are matched as if they had
//! one, so plain cache keys work as paths too.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use glob::{MatchOptions, Pattern};

use crate::cache::LruTracker;
use crate::error::{CacheError, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

// == Path Pattern ==
/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    alternatives: Vec<Pattern>,
}

impl PathPattern {
    // == Compile ==
    /// Compiles a comma-separated list of globs.
    pub fn compile(source: &str) -> Result<Self> {
        let invalid = |reason: String| CacheError::InvalidPattern {
            pattern: source.to_string(),
            reason,
        };

        let alternatives = source
            .split(',')
            .map(str::trim)
            .filter(|alt| !alt.is_empty())
            .map(|alt| {
                let anchored = if alt.starts_with('/') {
                    alt.to_string()
                } else {
                    format!("/**/{alt}")
                };
                Pattern::new(&anchored).map_err(|err| invalid(err.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        if alternatives.is_empty() {
            return Err(invalid("pattern has no alternatives".to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    // == Match ==
    /// Returns true if any alternative matches `path`.
    pub fn matches(&self, path: &str) -> bool {
        if path.starts_with('/') {
            self.matches_normalized(path)
        } else {
            self.matches_normalized(&format!("/{path}"))
        }
    }

    /// Returns true if any of `paths` matches.
    pub fn matches_any<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        paths.iter().any(|path| self.matches(path.as_ref()))
    }

    fn matches_normalized(&self, path: &str) -> bool {
        self.alternatives
            .iter()
            .any(|alt| alt.matches_with(path, MATCH_OPTIONS))
    }

    /// The pattern as written by the subscriber.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

// == Pattern Cache ==
#[derive(Debug)]
struct CacheState {
    compiled: HashMap<String, Arc<PathPattern>>,
    recency: LruTracker,
}

/// Bounded LRU cache of compiled patterns.
#[derive(Debug)]
pub struct PatternCache {
    state: Mutex<CacheState>,
}

impl PatternCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                compiled: HashMap::new(),
                recency: LruTracker::with_capacity(capacity),
            }),
        }
    }

    /// Returns the compiled pattern, compiling and caching it on first use.
    pub fn get_or_compile(&self, source: &str) -> Result<Arc<PathPattern>> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pattern) = state.compiled.get(source).cloned() {
                state.recency.touch(source);
                return Ok(pattern);
            }
        }

        // Compile outside the lock; a concurrent compile of the same source
        // just overwrites with an equivalent value.
        let pattern = Arc::new(PathPattern::compile(source)?);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(evicted) = state.recency.touch(source) {
            state.compiled.remove(&evicted);
        }
        state
            .compiled
            .insert(source.to_string(), Arc::clone(&pattern));
        Ok(pattern)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .compiled
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursive_wildcard() {
        let pattern = PathPattern::compile("/config/**").unwrap();

        assert!(pattern.matches("/config/db.json"));
        assert!(pattern.matches("/config/a/b/c.json"));
        assert!(!pattern.matches("/flags/beta.json"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let pattern = PathPattern::compile("/config/*.json").unwrap();

        assert!(pattern.matches("/config/db.json"));
        assert!(!pattern.matches("/config/nested/db.json"));
    }

    #[test]
    fn test_comma_alternation() {
        let pattern = PathPattern::compile("/a.json, /b/**").unwrap();

        assert!(pattern.matches("/a.json"));
        assert!(pattern.matches("/b/c/d"));
        assert!(!pattern.matches("/c.json"));
    }

    #[test]
    fn test_unanchored_pattern_matches_anywhere() {
        let pattern = PathPattern::compile("*.json").unwrap();

        assert!(pattern.matches("/x.json"));
        assert!(pattern.matches("/deep/tree/x.json"));
        assert!(!pattern.matches("/deep/tree/x.yaml"));
    }

    #[test]
    fn test_plain_keys_match_as_paths() {
        let pattern = PathPattern::compile("cfg:*").unwrap();

        assert!(pattern.matches("cfg:db"));
        assert!(!pattern.matches("flags:beta"));
    }

    #[test]
    fn test_matches_any() {
        let pattern = PathPattern::compile("/a/**").unwrap();

        assert!(pattern.matches_any(&["/z", "/a/b"]));
        assert!(!pattern.matches_any(&["/z"]));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            PathPattern::compile(" , "),
            Err(CacheError::InvalidPattern { .. })
        ));
        assert!(matches!(
            PathPattern::compile("/a/[unclosed"),
            Err(CacheError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_pattern_cache_reuses_compiled() {
        let cache = PatternCache::new(4);

        let first = cache.get_or_compile("/a/**").unwrap();
        let second = cache.get_or_compile("/a/**").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_pattern_cache_is_bounded() {
        let cache = PatternCache::new(2);

        cache.get_or_compile("/a").unwrap();
        cache.get_or_compile("/b").unwrap();
        cache.get_or_compile("/c").unwrap();

        assert_eq!(cache.len(), 2);
    }
}
