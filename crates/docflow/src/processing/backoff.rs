//! Exponential retry schedule for the indexer

use std::time::Duration;

use crate::config::IndexerConfig;

/// Attempt budget and delay schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    ///
    /// `base * 2^(attempt-1)`, capped. No jitter, so the schedule is strictly
    /// increasing until it reaches the cap.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.checked_mul(exp).unwrap_or(self.cap).min(self.cap)
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&IndexerConfig::default())
    }
}
