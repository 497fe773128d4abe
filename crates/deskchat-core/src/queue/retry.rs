//! Bounded exponential backoff for message delivery.
//!
//! Stateless: the attempt count lives on the job record, so the decision
//! survives restarts.

use std::time::Duration;

use deskchat_types::config::QueueConfig;
use deskchat_types::error::RemoteError;

/// What to do after a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    RetryAfter(Duration),
    /// Mark the job terminal-failed.
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            multiplier: config.multiplier.max(1),
        }
    }

    /// Whether another attempt is allowed after `attempt` failed.
    ///
    /// `attempt` is 1-based (first delivery is attempt 1).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`.
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn decide(&self, attempt: u32, error: &RemoteError) -> RetryDecision {
        if error.is_retryable() && self.should_retry(attempt) {
            RetryDecision::RetryAfter(self.delay_for(attempt))
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}
