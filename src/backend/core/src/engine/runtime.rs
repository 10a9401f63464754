//! Engine - wires storage, tasks and configuration into a running
//! execution pool and scheduling manager.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, SharedBreaker};
use super::pipeline::{JobExecution, JobPicker, JobProcessor};
use super::pool::{ExecutionPoolStats, PollingExecutionPool, PoolConfig};
use super::result::JobResultProcessor;
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::jobs::{SharedStorage, TaskDescriptor, TaskRegistry};
use crate::scheduling::{standard_commands, CommandContext, SchedulingManager, SchedulingStats};
use crate::telemetry::{SharedDispatcher, TracingDispatcher};

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Option<SharedStorage>,
    tasks: TaskRegistry,
    dispatcher: Option<SharedDispatcher>,
    clock: Option<SharedClock>,
    env: HashMap<String, String>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            storage: None,
            tasks: TaskRegistry::new(),
            dispatcher: None,
            clock: None,
            env: HashMap::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn task(mut self, descriptor: TaskDescriptor) -> Self {
        self.tasks.register(descriptor);
        self
    }

    /// Replace all registered tasks.
    pub fn tasks(mut self, tasks: TaskRegistry) -> Self {
        self.tasks = tasks;
        self
    }

    /// Defaults to a [`TracingDispatcher`].
    pub fn dispatcher(mut self, dispatcher: SharedDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Defaults to the system clock.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Environment handed to every handler.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let storage = self
            .storage
            .ok_or_else(|| EngineError::configuration("A job storage must be provided"))?;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let dispatcher = self.dispatcher.unwrap_or_else(TracingDispatcher::shared);

        let breaker: SharedBreaker = Arc::new(CircuitBreaker::new(
            "storage",
            self.config.breaker_settings()?,
            clock.clone(),
        ));
        let retryers = Arc::new(self.config.retry_registry()?);
        let retention = self.config.retention_period()?;
        let abort = CancellationToken::new();

        let results =
            JobResultProcessor::new(storage.clone(), breaker.clone(), clock.clone(), dispatcher.clone())
                .shared();
        let processor = JobProcessor::new(Arc::new(self.tasks), retryers, results, dispatcher.clone())
            .with_env(self.env)
            .with_cancellation(abort.clone());
        let picker = JobPicker::new(storage.clone(), breaker.clone(), dispatcher.clone());

        let pool = PollingExecutionPool::new(
            PoolConfig::default()
                .with_concurrency(self.config.polling.concurrency)
                .with_interval(self.config.polling.interval),
            Arc::new(JobExecution::new(picker, processor)),
        )
        .with_abort_token(abort);

        let ctx = CommandContext::new(storage.clone(), breaker.clone(), clock, dispatcher.clone());
        let scheduler = SchedulingManager::new(
            standard_commands(ctx, self.config.scheduling.janitor_batch_size, retention),
            self.config.scheduling.initial_delay,
            self.config.scheduling.interval,
        );

        Ok(Engine {
            config: Arc::new(self.config),
            storage,
            breaker,
            dispatcher,
            pool,
            scheduler,
        })
    }
}

/// A configured job engine.
pub struct Engine {
    config: Arc<EngineConfig>,
    storage: SharedStorage,
    breaker: SharedBreaker,
    dispatcher: SharedDispatcher,
    pool: PollingExecutionPool,
    scheduler: SchedulingManager,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn breaker(&self) -> &SharedBreaker {
        &self.breaker
    }

    pub fn dispatcher(&self) -> &SharedDispatcher {
        &self.dispatcher
    }

    pub fn pool(&self) -> &PollingExecutionPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &SchedulingManager {
        &self.scheduler
    }

    /// Start the scheduler and the workers. Returns false if already started.
    pub fn start(&self) -> bool {
        let scheduler_started = self.scheduler.start();
        let pool_started = self.pool.start();
        if scheduler_started || pool_started {
            tracing::info!(service = %self.config.service_name, "Engine started");
        }
        scheduler_started || pool_started
    }

    /// Stop workers at their next wait. Scheduling keeps running.
    pub fn pause(&self) {
        self.pool.pause();
    }

    pub fn resume(&self) {
        self.pool.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.pool.is_paused()
    }

    /// Let running jobs finish within the configured grace period, then
    /// stop the scheduler.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.config.polling.shutdown_timeout;
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "Engine shutting down");

        let finished = self.pool.shutdown(timeout).await;
        self.scheduler.stop();
        self.scheduler.join().await;

        if finished {
            tracing::info!("Engine shut down");
            Ok(())
        } else {
            Err(EngineError::shutdown_timeout(timeout))
        }
    }

    /// Abort running jobs and stop the scheduler without waiting.
    pub fn shutdown_now(&self) {
        self.pool.shutdown_now();
        self.scheduler.stop();
        tracing::warn!("Engine aborted");
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            pool: self.pool.stats(),
            scheduling: self.scheduler.stats(),
            circuit_breaker: self.breaker.stats(),
        }
    }
}

/// Combined engine statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub pool: ExecutionPoolStats,
    pub scheduling: SchedulingStats,
    pub circuit_breaker: CircuitBreakerStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use crate::jobs::InMemoryStorage;

    #[test]
    fn test_build_requires_storage() {
        let err = Engine::builder().build().err().unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.polling.concurrency = 0;
        let clock = ManualClock::starting_now();

        let err = Engine::builder()
            .config(config)
            .storage(Arc::new(InMemoryStorage::new(clock.clone())))
            .clock(clock)
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_and_shutdown() {
        let clock = ManualClock::starting_now();
        let engine = Engine::builder()
            .storage(Arc::new(InMemoryStorage::new(clock.clone())))
            .clock(clock)
            .build()
            .unwrap();

        assert!(engine.start());
        assert!(!engine.start());
        assert_eq!(engine.stats().pool.workers_spawned, 4);
        assert!(engine.stats().scheduling.running);

        engine.pause();
        assert!(engine.is_paused());
        engine.resume();

        engine.shutdown().await.unwrap();
        assert!(!engine.stats().scheduling.running);
    }
}
