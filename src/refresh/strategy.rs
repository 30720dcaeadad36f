//! Refresh Strategy
//!
//! Per-key policy deciding whether a read is served from cache, triggers an
//! early or background refresh, or must block on a synchronous fetch.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::cache::CacheEntry;

// == Refresh Strategy ==
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshStrategy {
    /// Fetch synchronously on miss or expiry; never serve stale.
    Strict,
    /// Recompute early with a probability that grows as expiry nears and
    /// with the cost of the last fetch (XFetch).
    Probabilistic { beta: f64 },
    /// Serve stale values for up to `stale_max_age` past expiry while one
    /// background refresh runs.
    Scheduled { stale_max_age: Duration },
}

// == Decision ==
/// Why a read has to wait for the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Missing,
    Expired,
    /// Stale for longer than the scheduled strategy tolerates
    StaleBudgetExceeded,
}

/// What a read should do with the entry it found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Fresh,
    RefreshEarly,
    ServeStale,
    FetchSync(SyncReason),
}

impl RefreshStrategy {
    /// Parses a strategy name as used in configuration.
    ///
    /// # Arguments
    /// * `name` - `strict`, `probabilistic` or `scheduled`, case-insensitive
    /// * `beta` - Early-expiration aggressiveness for `probabilistic`
    /// * `stale_max_age` - Stale budget for `scheduled`
    pub fn from_name(name: &str, beta: f64, stale_max_age: Duration) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(RefreshStrategy::Strict),
            "probabilistic" | "xfetch" => Some(RefreshStrategy::Probabilistic { beta }),
            "scheduled" | "swr" => Some(RefreshStrategy::Scheduled { stale_max_age }),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RefreshStrategy::Strict => "strict",
            RefreshStrategy::Probabilistic { .. } => "probabilistic",
            RefreshStrategy::Scheduled { .. } => "scheduled",
        }
    }

    // == Decide ==
    /// Classifies a read of `entry` at `now`.
    ///
    /// `draw` is a uniform sample in `(0, 1]`, only consulted by the
    /// probabilistic strategy.
    pub fn decide<V>(&self, entry: Option<&CacheEntry<V>>, now: Instant, draw: f64) -> Decision {
        let Some(entry) = entry else {
            return Decision::FetchSync(SyncReason::Missing);
        };
        let expired = entry.is_expired_at(now);

        match *self {
            RefreshStrategy::Strict if expired => Decision::FetchSync(SyncReason::Expired),
            RefreshStrategy::Strict => Decision::Fresh,
            RefreshStrategy::Probabilistic { .. } if expired => {
                Decision::FetchSync(SyncReason::Expired)
            }
            RefreshStrategy::Probabilistic { beta } => {
                if should_refresh_early(entry.remaining_at(now), entry.fetch_cost, beta, draw) {
                    Decision::RefreshEarly
                } else {
                    Decision::Fresh
                }
            }
            RefreshStrategy::Scheduled { .. } if !expired => Decision::Fresh,
            RefreshStrategy::Scheduled { stale_max_age } => {
                if entry.stale_elapsed(now) > stale_max_age {
                    Decision::FetchSync(SyncReason::StaleBudgetExceeded)
                } else {
                    Decision::ServeStale
                }
            }
        }
    }
}

// == Early Expiration ==
/// XFetch rule: refresh when `-delta * beta * ln(draw) >= gap`.
///
/// `ln(draw)` is negative for `draw` in `(0, 1)`, so the left side is a
/// positive, exponentially distributed lead time scaled by the fetch cost.
/// A zero fetch cost never refreshes early.
pub fn should_refresh_early(gap: Duration, delta: Duration, beta: f64, draw: f64) -> bool {
    let draw = draw.clamp(f64::MIN_POSITIVE, 1.0);
    let lead = -delta.as_secs_f64() * beta * draw.ln();
    lead >= gap.as_secs_f64()
}

/// Uniform sample in `(0, 1]`.
pub fn draw() -> f64 {
    1.0 - rand::rng().random::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(now: Instant, ttl_secs: u64, cost_ms: u64) -> CacheEntry<&'static str> {
        CacheEntry::new(
            "cfg:db",
            "v1",
            now,
            Duration::from_secs(ttl_secs),
            Duration::from_millis(cost_ms),
        )
    }

    #[test]
    fn test_missing_entry_always_fetches() {
        let now = Instant::now();
        for strategy in [
            RefreshStrategy::Strict,
            RefreshStrategy::Probabilistic { beta: 1.0 },
            RefreshStrategy::Scheduled { stale_max_age: Duration::from_secs(30) },
        ] {
            assert_eq!(
                strategy.decide::<&str>(None, now, 0.5),
                Decision::FetchSync(SyncReason::Missing)
            );
        }
    }

    #[test]
    fn test_strict_never_serves_stale() {
        let start = Instant::now();
        let entry = entry(start, 60, 100);

        assert_eq!(RefreshStrategy::Strict.decide(Some(&entry), start, 0.5), Decision::Fresh);
        assert_eq!(
            RefreshStrategy::Strict.decide(Some(&entry), start + Duration::from_secs(60), 0.5),
            Decision::FetchSync(SyncReason::Expired)
        );
    }

    #[test]
    fn test_scheduled_stale_bound() {
        let start = Instant::now();
        let entry = entry(start, 60, 100);
        let strategy = RefreshStrategy::Scheduled { stale_max_age: Duration::from_secs(30) };

        assert_eq!(
            strategy.decide(Some(&entry), start + Duration::from_secs(70), 0.5),
            Decision::ServeStale
        );
        assert_eq!(
            strategy.decide(Some(&entry), start + Duration::from_secs(90), 0.5),
            Decision::ServeStale
        );
        assert_eq!(
            strategy.decide(Some(&entry), start + Duration::from_secs(91), 0.5),
            Decision::FetchSync(SyncReason::StaleBudgetExceeded)
        );
    }

    #[test]
    fn test_probabilistic_far_from_expiry_is_fresh() {
        let start = Instant::now();
        let entry = entry(start, 300, 100);
        let strategy = RefreshStrategy::Probabilistic { beta: 1.0 };
        // Lead time for draw 0.01 is 0.1 * 4.6 = 0.46s, far below 300s.
        assert_eq!(strategy.decide(Some(&entry), start, 0.01), Decision::Fresh);
    }

    #[test]
    fn test_probabilistic_near_expiry_with_low_draw_refreshes() {
        let start = Instant::now();
        let entry = entry(start, 60, 2_000);
        let strategy = RefreshStrategy::Probabilistic { beta: 1.0 };
        let now = start + Duration::from_secs(59);
        // gap 1s, lead = 2 * -ln(0.1) = 4.6s
        assert_eq!(strategy.decide(Some(&entry), now, 0.1), Decision::RefreshEarly);
        // draw 1.0 gives zero lead
        assert_eq!(strategy.decide(Some(&entry), now, 1.0), Decision::Fresh);
    }

    #[test]
    fn test_probabilistic_expired_fetches_sync() {
        let start = Instant::now();
        let entry = entry(start, 60, 100);
        let strategy = RefreshStrategy::Probabilistic { beta: 1.0 };
        assert_eq!(
            strategy.decide(Some(&entry), start + Duration::from_secs(61), 0.5),
            Decision::FetchSync(SyncReason::Expired)
        );
    }

    #[test]
    fn test_should_refresh_early_sign() {
        // Published form `gap < delta * beta * ln(draw)` is never true for
        // positive gaps; the canonical rule is.
        assert!(should_refresh_early(
            Duration::from_millis(100),
            Duration::from_secs(1),
            1.0,
            0.5
        ));
        assert!(!should_refresh_early(
            Duration::from_secs(10),
            Duration::from_secs(1),
            1.0,
            0.5
        ));
        assert!(!should_refresh_early(
            Duration::from_millis(1),
            Duration::ZERO,
            1.0,
            0.0001
        ));
    }

    #[test]
    fn test_draw_range() {
        for _ in 0..1000 {
            let sample = draw();
            assert!(sample > 0.0 && sample <= 1.0);
        }
    }

    #[test]
    fn test_from_name() {
        let max_age = Duration::from_secs(30);
        assert_eq!(RefreshStrategy::from_name("STRICT", 1.0, max_age), Some(RefreshStrategy::Strict));
        assert_eq!(
            RefreshStrategy::from_name("probabilistic", 2.0, max_age),
            Some(RefreshStrategy::Probabilistic { beta: 2.0 })
        );
        assert_eq!(
            RefreshStrategy::from_name(" scheduled ", 1.0, max_age),
            Some(RefreshStrategy::Scheduled { stale_max_age: max_age })
        );
        assert_eq!(RefreshStrategy::from_name("lazy", 1.0, max_age), None);
    }
}
