#![allow(clippy::result_large_err)]
//! # Taskmill Core
//!
//! A background job engine: workers poll storage for ready jobs, run
//! their handlers and record the outcome, while a scheduler keeps the
//! job set moving.
//!
//! ## Architecture
//!
//! - **Jobs**: job records, retry strategies, task handlers and the storage contract
//! - **Engine**: circuit breaker, loop strategy, polling execution pool and the
//!   pick → run → record pipeline
//! - **Scheduling**: fixed-rate maintenance (enqueue, cron, janitor, retention)
//! - **Telemetry**: structured logging, Prometheus metrics and engine events
//! - **Config**: layered configuration from files and the environment

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod scheduling;
pub mod telemetry;

pub use error::{EngineError, ErrorCode, ErrorSeverity, Result, TaskError, TaskResult};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{
        BreakerSettings, CircuitBreaker, CircuitState, Engine, EngineBuilder, EngineStats,
        PollingExecutionPool, PoolConfig,
    };
    pub use crate::error::{EngineError, ErrorCode, Result, TaskError, TaskResult};
    pub use crate::jobs::{
        CronJob, FnHandler, InMemoryStorage, Job, JobId, JobState, JobStorage, Queue,
        RetryStrategy, SharedStorage, TaskContext, TaskDescriptor, TaskHandler, TaskRegistry,
    };
    pub use crate::scheduling::{SchedulerCommand, SchedulingManager};
    pub use crate::telemetry::{
        CollectingDispatcher, EngineEvent, EventDispatcher, SharedDispatcher, TracingDispatcher,
    };
}
