//! Exponential backoff with jitter for driver retries

use crate::config::PeripheralConfig;
use rand::Rng;
use std::time::Duration;

/// Retry schedule for one driver call
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub jitter_percent: f64,
    pub max_ms: u64,
    /// Total attempts, including the first call
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 50,
            factor: 2.0,
            jitter_percent: 0.20,
            max_ms: 1_000,
            max_attempts: 3,
        }
    }
}

impl From<&PeripheralConfig> for BackoffConfig {
    fn from(config: &PeripheralConfig) -> Self {
        Self {
            base_ms: config.retry_base_delay_ms,
            max_ms: config.retry_max_delay_ms,
            max_attempts: config.retry_attempts,
            ..Self::default()
        }
    }
}

impl BackoffConfig {
    /// Calculate backoff duration with jitter
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        // base * factor^attempt, capped
        let base_backoff =
            (self.base_ms as f64 * self.factor.powi(attempt as i32)).min(self.max_ms as f64);

        let jitter_range = base_backoff * self.jitter_percent;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let backoff_ms = (base_backoff + jitter).max(0.0) as u64;
        Duration::from_millis(backoff_ms)
    }
}

/// Attempt counter for a single retried call
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    failures: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, failures: 0 }
    }

    /// Record a failed attempt. Returns the delay before the next attempt,
    /// or `None` once the attempt budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.config.max_attempts {
            return None;
        }
        Some(self.config.calculate_backoff(self.failures - 1))
    }

    pub fn attempts(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
