//! Retry strategies, the strategy registry and the retry decision.
//!
//! A strategy maps a 1-based attempt count to the delay before that
//! attempt runs. Strategies are looked up by name so a task can pick its
//! own backoff; one registered name is the default.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{add_duration, SharedClock};
use crate::error::{EngineError, Result};

/// Maps an attempt count to a backoff delay.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Registry key.
    fn name(&self) -> &str;

    /// Delay before attempt `retries`.
    fn apply(&self, retries: u32) -> Duration;
}

/// Shared strategy handle.
pub type SharedStrategy = Arc<dyn RetryStrategy>;

// ═══════════════════════════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════════════════════════

/// Same delay for every attempt.
#[derive(Debug, Clone)]
pub struct ConstantRetryStrategy {
    delay: Duration,
}

impl ConstantRetryStrategy {
    pub const NAME: &'static str = "constant";

    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ConstantRetryStrategy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl RetryStrategy for ConstantRetryStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, _retries: u32) -> Duration {
        self.delay
    }
}

/// `retries` seconds.
#[derive(Debug, Clone, Default)]
pub struct LinearRetryStrategy;

impl LinearRetryStrategy {
    pub const NAME: &'static str = "linear";
}

impl RetryStrategy for LinearRetryStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, retries: u32) -> Duration {
        Duration::from_secs(u64::from(retries))
    }
}

/// `retries²` seconds.
#[derive(Debug, Clone, Default)]
pub struct SquaredRetryStrategy;

impl SquaredRetryStrategy {
    pub const NAME: &'static str = "squared";
}

impl RetryStrategy for SquaredRetryStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, retries: u32) -> Duration {
        let retries = u64::from(retries);
        Duration::from_secs(retries.saturating_mul(retries))
    }
}

/// `(retries * 4 + 15) + rand[1, 30] * (retries + 1)` seconds.
///
/// The random term widens with every attempt so that jobs failing
/// together spread out instead of retrying in lockstep.
#[derive(Debug, Clone, Default)]
pub struct JitterRetryStrategy;

impl JitterRetryStrategy {
    pub const NAME: &'static str = "jitter";

    /// Delay for a given random factor in `1..=30`.
    pub fn delay_with(retries: u32, random: u64) -> Duration {
        let retries = u64::from(retries);
        let base = retries.saturating_mul(4).saturating_add(15);
        let spread = random.saturating_mul(retries.saturating_add(1));
        Duration::from_secs(base.saturating_add(spread))
    }
}

impl RetryStrategy for JitterRetryStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, retries: u32) -> Duration {
        let random = rand::thread_rng().gen_range(1..=30u64);
        Self::delay_with(retries, random)
    }
}

/// Build one of the bundled strategies by name.
pub fn builtin_strategy(name: &str, constant_delay: Duration) -> Option<SharedStrategy> {
    let strategy: SharedStrategy = match name {
        ConstantRetryStrategy::NAME => Arc::new(ConstantRetryStrategy::new(constant_delay)),
        LinearRetryStrategy::NAME => Arc::new(LinearRetryStrategy),
        SquaredRetryStrategy::NAME => Arc::new(SquaredRetryStrategy),
        JitterRetryStrategy::NAME => Arc::new(JitterRetryStrategy),
        _ => return None,
    };
    Some(strategy)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Named strategies plus the default.
#[derive(Debug, Clone)]
pub struct RetryerRegistry {
    strategies: HashMap<String, SharedStrategy>,
    default_name: String,
}

impl RetryerRegistry {
    /// Fails when `strategies` is empty or does not contain `default_name`.
    pub fn new(strategies: Vec<SharedStrategy>, default_name: impl Into<String>) -> Result<Self> {
        if strategies.is_empty() {
            return Err(EngineError::configuration(
                "At least one retry strategy must be registered",
            ));
        }

        let default_name = default_name.into();
        let strategies: HashMap<String, SharedStrategy> = strategies
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();

        if !strategies.contains_key(&default_name) {
            return Err(EngineError::configuration(format!(
                "Default retry strategy '{}' is not registered",
                default_name
            )));
        }

        Ok(Self {
            strategies,
            default_name,
        })
    }

    /// Registry with all bundled strategies and `jitter` as default.
    pub fn with_builtins() -> Self {
        let strategies = vec![
            Arc::new(ConstantRetryStrategy::default()) as SharedStrategy,
            Arc::new(LinearRetryStrategy),
            Arc::new(SquaredRetryStrategy),
            Arc::new(JitterRetryStrategy),
        ];
        let default_name = JitterRetryStrategy::NAME.to_string();
        Self {
            strategies: strategies
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
            default_name,
        }
    }

    pub fn get(&self, name: &str) -> Option<SharedStrategy> {
        self.strategies.get(name).cloned()
    }

    pub fn default_strategy(&self) -> SharedStrategy {
        // Presence checked at construction.
        self.strategies[&self.default_name].clone()
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// The named strategy, or the default when the name is absent or unknown.
    pub fn resolve(&self, name: Option<&str>) -> SharedStrategy {
        match name {
            Some(name) => self.get(name).unwrap_or_else(|| {
                tracing::warn!(
                    strategy = name,
                    fallback = %self.default_name,
                    "Unknown retry strategy, using default"
                );
                self.default_strategy()
            }),
            None => self.default_strategy(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retryer
// ═══════════════════════════════════════════════════════════════════════════════

/// Decides whether a job may retry and when.
#[derive(Debug, Clone)]
pub struct JobRetryer {
    clock: SharedClock,
}

impl JobRetryer {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// A job at its budget has exhausted it.
    pub fn is_retryable(&self, retries: u32, max_retries: u32) -> bool {
        retries < max_retries
    }

    pub fn next_retry_at(&self, retries: u32, strategy: &dyn RetryStrategy) -> DateTime<Utc> {
        add_duration(self.clock.now(), strategy.apply(retries))
    }
}
