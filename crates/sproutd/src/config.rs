//! Configuration management for sproutd.
//!
//! Loads settings from /etc/sprout/config.toml or uses defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sprout_shared::event::{
    valid_sampling_interval, MAX_SAMPLING_INTERVAL_SECS, MIN_SAMPLING_INTERVAL_SECS,
};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/sprout/config.toml";

/// Longest scheduler tick accepted: one day
pub const MAX_TICK_INTERVAL_SECS: f64 = 86_400.0;

/// Recipe scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks. Clamped to the shortest cycle.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: f64,
}

fn default_tick_interval() -> f64 {
    2.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
        }
    }
}

/// Peripheral manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralConfig {
    /// Poll interval when the setup declares no sampling interval default
    #[serde(default = "default_sampling_interval")]
    pub default_sampling_interval_secs: f64,

    /// Driver call attempts per poll before the values go stale
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on a single retry delay
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Consecutive failed polls before the peripheral is faulted
    #[serde(default = "default_fault_threshold")]
    pub fault_threshold: u32,
}

fn default_sampling_interval() -> f64 {
    5.0
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    50
}

fn default_retry_max_delay() -> u64 {
    1_000
}

fn default_fault_threshold() -> u32 {
    3
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            default_sampling_interval_secs: default_sampling_interval(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            fault_threshold: default_fault_threshold(),
        }
    }
}

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-transaction timeout, also bounds shutdown latency
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_ms: u64,

    /// Use the simulated I2C backend instead of hardware
    #[serde(default = "default_simulate")]
    pub simulate: bool,
}

fn default_transaction_timeout() -> u64 {
    500
}

fn default_simulate() -> bool {
    true
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: default_transaction_timeout(),
            simulate: default_simulate(),
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub peripherals: PeripheralConfig,

    #[serde(default)]
    pub bus: BusConfig,
}

impl Config {
    /// Load config from the default path, or return defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH).unwrap_or_else(|e| {
            warn!("Config not found, using defaults: {}", e);
            Config::default()
        })
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values that would stall the daemon
    pub fn validate(&self) -> Result<()> {
        let tick = self.scheduler.tick_interval_secs;
        if !(tick > 0.0 && tick <= MAX_TICK_INTERVAL_SECS) {
            anyhow::bail!(
                "scheduler.tick_interval_secs must be > 0 and at most {}, got {}",
                MAX_TICK_INTERVAL_SECS,
                tick
            );
        }
        let sampling = self.peripherals.default_sampling_interval_secs;
        if !valid_sampling_interval(sampling) {
            anyhow::bail!(
                "peripherals.default_sampling_interval_secs must be between {} and {}, got {}",
                MIN_SAMPLING_INTERVAL_SECS,
                MAX_SAMPLING_INTERVAL_SECS,
                sampling
            );
        }
        if self.peripherals.retry_attempts == 0 {
            anyhow::bail!("peripherals.retry_attempts must be at least 1");
        }
        if self.peripherals.fault_threshold == 0 {
            anyhow::bail!("peripherals.fault_threshold must be at least 1");
        }
        if self.bus.transaction_timeout_ms == 0 {
            anyhow::bail!("bus.transaction_timeout_ms must be > 0");
        }
        Ok(())
    }

    /// Scheduler tick period. An unusable value, possible only in a config
    /// that skipped `validate`, falls back to the default.
    pub fn tick_interval(&self) -> Duration {
        let secs = self.scheduler.tick_interval_secs;
        Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|period| !period.is_zero() && secs <= MAX_TICK_INTERVAL_SECS)
            .unwrap_or_else(|| Duration::from_secs_f64(default_tick_interval()))
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.bus.transaction_timeout_ms)
    }
}
