//! Backoff Module
//!
//! Exponential backoff with random jitter, shared by lock polling, watch
//! re-subscription and warmer retries. Also hosts the jitter helper used for
//! entry TTLs and watch timeouts.

use std::time::Duration;

use rand::Rng;

// == Backoff Policy ==
/// Exponential backoff with a capped ceiling and symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay
    pub cap: Duration,
    /// Fraction of the delay added or removed at random (0.0 disables jitter)
    pub jitter_fraction: f64,
    /// Number of delays `iter` yields, None = unbounded
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            multiplier: 2.0,
            cap: Duration::from_secs(1),
            jitter_fraction: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl BackoffPolicy {
    // == Constructor ==
    /// Creates a policy without jitter and without an attempt limit.
    pub fn new(initial: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            initial,
            multiplier,
            cap,
            jitter_fraction: 0.0,
            max_attempts: None,
        }
    }

    /// Sets the jitter fraction, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Sets the attempt limit.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    // == Base Delay ==
    /// Returns the un-jittered delay for a zero-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        let capped = secs.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    // == Delay ==
    /// Returns the jittered delay for a zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        jitter(self.base_delay(attempt), self.jitter_fraction)
    }

    // == Iterator ==
    /// Returns an iterator over successive jittered delays.
    pub fn iter(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

// == Backoff Iterator ==
/// Stateful walk through a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

// == Jitter ==
/// Draws a duration uniformly from `[base * (1 - fraction), base * (1 + fraction)]`.
pub fn jitter(base: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || base.is_zero() {
        return base;
    }
    let offset = rand::rng().random_range(-fraction..=fraction);
    base.mul_f64(1.0 + offset)
}
