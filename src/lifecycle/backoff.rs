//! Backoff policy for polling remote batches.
//!
//! ```rust
//! # use barrage::lifecycle::BackoffPolicy;
//! let policy = BackoffPolicy {
//!     max_attempts: 500,
//!     backoff_ms: 5_000,        // Start with 5 seconds
//!     backoff_factor: 2,        // Double each time (5s, 10s, 20s)
//!     max_backoff_ms: 300_000,  // Cap at 5 minutes
//!     jitter: false,
//! };
//! assert_eq!(policy.delay(2).as_millis(), 20_000);
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap and a per-batch attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Transient poll failures allowed per batch before it is parked in `PollTimeout`
    pub max_attempts: u32,
    /// Base delay in milliseconds
    pub backoff_ms: u64,
    /// Factor by which the delay grows with each attempt
    pub backoff_factor: u64,
    /// Maximum delay in milliseconds
    pub max_backoff_ms: u64,
    /// Draw the actual delay uniformly from `[0, delay]`
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 500,
            backoff_ms: 5_000,
            backoff_factor: 2,
            max_backoff_ms: 300_000,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the zero-based `attempt`.
    ///
    /// `backoff_ms * backoff_factor^attempt`, capped at `max_backoff_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        if self.jitter && capped > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=capped))
        } else {
            Duration::from_millis(capped)
        }
    }

    /// Whether `attempts` spent attempts exhaust the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// A policy with no waiting, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_ms: 0,
            backoff_factor: 1,
            max_backoff_ms: 0,
            jitter: false,
        }
    }
}
