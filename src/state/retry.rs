//! Exponential backoff for recovering from the error state

use std::time::Duration;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

/// What to do on entering the error state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule recovery attempt number `attempt` after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Attempts are exhausted
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retries, max)`
    pub fn delay_for(&self, retries: u32) -> Duration {
        2u32.checked_pow(retries)
            .map(|factor| self.base_delay.saturating_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide based on how many retries were already scheduled
    pub fn decide(&self, retries: u32) -> RetryDecision {
        if retries < self.max_retries {
            RetryDecision::Retry {
                attempt: retries + 1,
                delay: self.delay_for(retries),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}
