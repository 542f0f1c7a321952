//! Exponential backoff with full jitter for cloud retries

use std::time::Duration;

use rand::{Rng, SeedableRng};

/// Base delay of the retry ladder.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Ceiling of the retry ladder (5 minutes).
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Retry delay generator: each failure doubles the window (up to the cap)
/// and the actual delay is drawn uniformly from it, so synchronized
/// devices do not reconnect in lockstep.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
    rng: rand::rngs::StdRng,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_limits(BACKOFF_BASE, BACKOFF_CAP)
    }

    pub fn with_limits(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: 0,
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            base: BACKOFF_BASE,
            cap: BACKOFF_CAP,
            failures: 0,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let window = self
            .base
            .saturating_mul(1u32 << self.failures.min(30))
            .min(self.cap);
        self.failures = self.failures.saturating_add(1);
        let millis = window.as_millis().max(1) as u64;
        Duration::from_millis(self.rng.gen_range(0..millis))
    }

    /// Success or connectivity edge: start over from the base window.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
