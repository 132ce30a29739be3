//! Exponential backoff for retryable idempotent failures.

use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: Duration) -> Self {
        Self { initial, max, jitter }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            Duration::from_millis(config.jitter_ms),
        )
    }

    /// Delay before retry number `attempt` (0-based), without jitter:
    /// `initial * 2^attempt`, capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Uniform in `[0, jitter)`.
    pub fn jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.jitter()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}
