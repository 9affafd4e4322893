//! Scheduling engine configuration.
//!
//! ```toml
//! [engine]
//! delete_delay_secs = 35
//! tick_interval_ms = 200
//! max_batch_size = 100
//! max_retry_attempts = 5
//! retry_base_delay_secs = 1.5
//! retry_max_delay_secs = 35.0
//! worker_concurrency = 12
//! metrics_log_interval_secs = 60
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Longest default delete delay. Keeps the wheel allocation bounded.
pub const MAX_DELETE_DELAY_SECS: u64 = 7 * 24 * 3600;

/// Longest retry delay, in seconds.
pub const MAX_RETRY_DELAY_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Delay applied when a schedule request does not carry its own.
    #[serde(default = "default_delete_delay_secs")]
    pub delete_delay_secs: u64,

    /// Wheel tick interval in milliseconds. Bounds deletion jitter.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Messages per batch-delete call. The platform caps this at 100.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Retries after the first attempt before an entry is dropped as failed.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Base of the exponential retry backoff, in seconds.
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f64,

    /// Upper bound for any retry delay, in seconds.
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: f64,

    /// Per-chat dispatches allowed to talk to the platform at once.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// How often the metrics summary is logged.
    #[serde(default = "default_metrics_log_interval_secs")]
    pub metrics_log_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delete_delay_secs: default_delete_delay_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            max_batch_size: default_max_batch_size(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            worker_concurrency: default_worker_concurrency(),
            metrics_log_interval_secs: default_metrics_log_interval_secs(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_DELETE_DELAY_SECS).contains(&self.delete_delay_secs) {
            return Err(ConfigError::Validation(format!(
                "engine.delete_delay_secs must be between 1 and {MAX_DELETE_DELAY_SECS}, got {}",
                self.delete_delay_secs
            )));
        }
        if !(50..=2000).contains(&self.tick_interval_ms) {
            return Err(ConfigError::Validation(format!(
                "engine.tick_interval_ms must be between 50 and 2000, got {}",
                self.tick_interval_ms
            )));
        }
        if !(1..=100).contains(&self.max_batch_size) {
            return Err(ConfigError::Validation(format!(
                "engine.max_batch_size must be between 1 and 100, got {}",
                self.max_batch_size
            )));
        }
        if self.max_retry_attempts > 20 {
            return Err(ConfigError::Validation(format!(
                "engine.max_retry_attempts must be at most 20, got {}",
                self.max_retry_attempts
            )));
        }
        if !(0.1..=MAX_RETRY_DELAY_SECS).contains(&self.retry_base_delay_secs) {
            return Err(ConfigError::Validation(format!(
                "engine.retry_base_delay_secs must be between 0.1 and {MAX_RETRY_DELAY_SECS}, got {}",
                self.retry_base_delay_secs
            )));
        }
        if !(1.0..=MAX_RETRY_DELAY_SECS).contains(&self.retry_max_delay_secs) {
            return Err(ConfigError::Validation(format!(
                "engine.retry_max_delay_secs must be between 1.0 and {MAX_RETRY_DELAY_SECS}, got {}",
                self.retry_max_delay_secs
            )));
        }
        if self.retry_base_delay_secs > self.retry_max_delay_secs {
            return Err(ConfigError::Validation(
                "engine.retry_base_delay_secs cannot exceed engine.retry_max_delay_secs".into(),
            ));
        }
        if !(1..=50).contains(&self.worker_concurrency) {
            return Err(ConfigError::Validation(format!(
                "engine.worker_concurrency must be between 1 and 50, got {}",
                self.worker_concurrency
            )));
        }
        if self.metrics_log_interval_secs < 10 {
            return Err(ConfigError::Validation(
                "engine.metrics_log_interval_secs must be at least 10".into(),
            ));
        }
        Ok(())
    }

    pub fn delete_delay(&self) -> Duration {
        Duration::from_secs(self.delete_delay_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Out-of-range values saturate at the retry ceiling; `validate` rejects them.
    pub fn retry_base_delay(&self) -> Duration {
        bounded_secs(self.retry_base_delay_secs)
    }

    pub fn retry_max_delay(&self) -> Duration {
        bounded_secs(self.retry_max_delay_secs)
    }

    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_log_interval_secs)
    }
}

fn bounded_secs(secs: f64) -> Duration {
    let ceiling = Duration::from_secs(MAX_RETRY_DELAY_SECS as u64);
    Duration::try_from_secs_f64(secs).map_or(ceiling, |delay| delay.min(ceiling))
}

fn default_delete_delay_secs() -> u64 {
    35
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_secs() -> f64 {
    1.5
}

fn default_retry_max_delay_secs() -> f64 {
    35.0
}

fn default_worker_concurrency() -> usize {
    12
}

fn default_metrics_log_interval_secs() -> u64 {
    60
}
