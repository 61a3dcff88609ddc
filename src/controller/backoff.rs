//! Retry backoff for jobs that asked to run again.
//!
//! Exponential: `initial * multiplier^(run_attempt - 1)`, capped at `max`, with
//! a symmetric random jitter so retries of many jobs do not line up.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Fraction of the computed backoff used as jitter range, in `[0, 1]`.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Backoff before attempt `run_attempt + 1`, without jitter.
    ///
    /// `run_attempt` is the number of attempts that ended in a retry so far,
    /// including the one just finished.
    pub fn base_backoff(&self, run_attempt: u32) -> Duration {
        let exponent = run_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = backoff_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn next_backoff(&self, run_attempt: u32) -> Duration {
        let base = self.base_backoff(run_attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as f64 * jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_millis((base.as_millis() as f64 + offset).max(0.0) as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60 * 60),
            jitter: 0.1,
        }
    }
}
