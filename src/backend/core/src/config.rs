//! Configuration management.
//!
//! Every section has defaults, so an empty environment yields a working
//! engine. Environment variables use the `TASKMILL` prefix and `__` as
//! the section separator, e.g. `TASKMILL__POLLING__CONCURRENCY=8`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::BreakerSettings;
use crate::error::{EngineError, Result};
use crate::jobs::{builtin_strategy, RetryerRegistry, SharedStrategy};
use crate::scheduling::{parse_retention, DEFAULT_JANITOR_BATCH_SIZE};
use crate::telemetry::{LoggingConfig, MetricsConfig};

const ENV_PREFIX: &str = "TASKMILL";

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service name reported in logs and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub scheduling: SchedulingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            circuit_breaker: CircuitBreakerConfig::default(),
            polling: PollingConfig::default(),
            scheduling: SchedulingConfig::default(),
            retry: RetryConfig::default(),
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive half-open successes before closing
    #[serde(default = "default_max_success_count")]
    pub max_success_count: u32,

    /// Consecutive failures before opening
    #[serde(default = "default_max_failure_count")]
    pub max_failure_count: u32,

    /// Time an open breaker waits before probing
    #[serde(default = "default_retry_timeout", with = "humantime_serde")]
    pub retry_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_success_count: default_max_success_count(),
            max_failure_count: default_max_failure_count(),
            retry_timeout: default_retry_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Number of worker loops
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Wait between poll iterations
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Grace period for running jobs on shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Time between maintenance ticks
    #[serde(default = "default_scheduling_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Executing jobs fetched per janitor page
    #[serde(default = "default_janitor_batch_size")]
    pub janitor_batch_size: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            interval: default_scheduling_interval(),
            janitor_batch_size: default_janitor_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Strategy used when a task names none
    #[serde(default = "default_strategy")]
    pub default_strategy: String,

    /// Bundled strategies to register
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,

    /// Delay of the `constant` strategy
    #[serde(default = "default_constant_delay", with = "humantime_serde")]
    pub constant_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            strategies: default_strategies(),
            constant_delay: default_constant_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// How long finished jobs are kept, e.g. "30d". Empty keeps them forever.
    #[serde(default = "default_retention_period")]
    pub period: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            period: default_retention_period(),
        }
    }
}

// Default value functions
fn default_service_name() -> String { "taskmill".to_string() }
fn default_max_success_count() -> u32 { 3 }
fn default_max_failure_count() -> u32 { 5 }
fn default_retry_timeout() -> Duration { Duration::from_secs(30) }
fn default_concurrency() -> usize { 4 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_initial_delay() -> Duration { Duration::from_secs(1) }
fn default_scheduling_interval() -> Duration { Duration::from_secs(5) }
fn default_janitor_batch_size() -> usize { DEFAULT_JANITOR_BATCH_SIZE }
fn default_strategy() -> String { "jitter".to_string() }
fn default_strategies() -> Vec<String> {
    ["constant", "linear", "squared", "jitter"].map(String::from).to_vec()
}
fn default_constant_delay() -> Duration { Duration::from_secs(10) }
fn default_retention_period() -> String { "30d".to_string() }

impl EngineConfig {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: EngineConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a file (format picked by extension), with the
    /// environment layered on top.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?;

        let cfg: EngineConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.breaker_settings()?;

        if self.polling.concurrency == 0 {
            return Err(EngineError::configuration("polling.concurrency must be greater than zero"));
        }
        if self.polling.interval.is_zero() {
            return Err(EngineError::configuration("polling.interval must be greater than zero"));
        }
        if self.scheduling.interval.is_zero() {
            return Err(EngineError::configuration("scheduling.interval must be greater than zero"));
        }
        if self.scheduling.janitor_batch_size == 0 {
            return Err(EngineError::configuration(
                "scheduling.janitor_batch_size must be greater than zero",
            ));
        }

        self.retry_registry()?;
        self.retention_period()?;
        Ok(())
    }

    pub fn breaker_settings(&self) -> Result<BreakerSettings> {
        BreakerSettings::new(
            self.circuit_breaker.max_success_count,
            self.circuit_breaker.max_failure_count,
            self.circuit_breaker.retry_timeout,
        )
    }

    /// Registry holding the configured strategies.
    pub fn retry_registry(&self) -> Result<RetryerRegistry> {
        let strategies = self
            .retry
            .strategies
            .iter()
            .map(|name| {
                builtin_strategy(name, self.retry.constant_delay).ok_or_else(|| {
                    EngineError::configuration(format!("Unknown retry strategy '{}'", name))
                })
            })
            .collect::<Result<Vec<SharedStrategy>>>()?;

        RetryerRegistry::new(strategies, self.retry.default_strategy.clone())
    }

    /// Parsed retention; `None` disables deletion.
    pub fn retention_period(&self) -> Result<Option<Duration>> {
        parse_retention(&self.retention.period)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("retry.strategies")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.circuit_breaker.max_failure_count, 5);
        assert_eq!(config.polling.concurrency, 4);
        assert_eq!(config.scheduling.interval, Duration::from_secs(5));
        assert_eq!(config.retry.default_strategy, "jitter");
        config.validate().unwrap();

        let registry = config.retry_registry().unwrap();
        assert_eq!(registry.names(), vec!["constant", "jitter", "linear", "squared"]);
        assert_eq!(
            config.retention_period().unwrap(),
            Some(Duration::from_secs(30 * 86_400))
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = EngineConfig::default();
        config.polling.concurrency = 0;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let mut config = EngineConfig::default();
        config.retry.default_strategy = "fibonacci".to_string();
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let mut config = EngineConfig::default();
        config.retry.strategies = vec!["linear".to_string(), "exponential".to_string()];
        config.retry.default_strategy = "linear".to_string();
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let mut config = EngineConfig::default();
        config.retry.strategies.clear();
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let mut config = EngineConfig::default();
        config.circuit_breaker.retry_timeout = Duration::ZERO;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let mut config = EngineConfig::default();
        config.retention.period = "forever".to_string();
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_empty_retention_disables_deletion() {
        let mut config = EngineConfig::default();
        config.retention.period = String::new();
        config.validate().unwrap();
        assert_eq!(config.retention_period().unwrap(), None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
service_name = "billing-jobs"

[polling]
concurrency = 8
interval = "250ms"

[circuit_breaker]
retry_timeout = "1m"

[retry]
default_strategy = "linear"
strategies = ["linear", "squared"]

[retention]
period = "12h"
"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service_name, "billing-jobs");
        assert_eq!(config.polling.concurrency, 8);
        assert_eq!(config.polling.interval, Duration::from_millis(250));
        assert_eq!(config.polling.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.circuit_breaker.retry_timeout, Duration::from_secs(60));
        assert_eq!(config.retry_registry().unwrap().names(), vec!["linear", "squared"]);
        assert_eq!(config.retention_period().unwrap(), Some(Duration::from_secs(12 * 3600)));
        config.validate().unwrap();
    }

    #[test]
    fn test_serializes_durations_as_text() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["polling"]["interval"], "1s");
        assert_eq!(json["circuit_breaker"]["retry_timeout"], "30s");
    }
}
