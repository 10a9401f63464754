//! The execution side of the engine.
//!
//! ```text
//!   PollingExecutionPool ── N × PollingLoop ── LoopStrategy (shared pause flag)
//!            │
//!            ▼
//!      JobExecution: JobPicker ─▶ JobProcessor ─▶ JobResultProcessor
//!                       │                               │
//!                 CircuitBreaker                    JobStorage
//! ```

pub mod circuit_breaker;
pub mod loop_strategy;
pub mod pipeline;
pub mod polling;
pub mod pool;
pub mod result;
pub mod runtime;

pub use circuit_breaker::{
    transition, BreakerEvent, BreakerSettings, BreakerState, CircuitBreaker, CircuitBreakerStats,
    CircuitState, SharedBreaker,
};
pub use loop_strategy::LoopStrategy;
pub use pipeline::{JobExecution, JobPicker, JobProcessor};
pub use polling::{IterationStatus, LoopRunner, PollingLoop, PollingStats};
pub use pool::{ExecutionPoolStats, PollingExecutionPool, PoolConfig};
pub use result::JobResultProcessor;
pub use runtime::{Engine, EngineBuilder, EngineStats};
