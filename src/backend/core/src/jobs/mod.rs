//! Jobs and everything the engine needs to know about them.
//!
//! - **Records**: [`Job`], [`Queue`], [`CronJob`] and [`JobMessage`]
//! - **Retry**: backoff strategies, the named registry and the retry decision
//! - **Tasks**: user handlers and the registry they are resolved from
//! - **Storage**: the persistence contract and an in-memory backend
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │  Scheduling  │───▶│   Storage    │◀───│ Polling Pool │
//! │   Manager    │    │ (JobStorage) │    │  (workers)   │
//! └──────────────┘    └──────────────┘    └──────┬───────┘
//!                                                │
//!                            ┌───────────────────┴──────────┐
//!                            ▼                              ▼
//!                     ┌──────────────┐              ┌──────────────┐
//!                     │ TaskRegistry │              │ JobRetryer + │
//!                     │  (handlers)  │              │   registry   │
//!                     └──────────────┘              └──────────────┘
//! ```

pub mod job;
pub mod retry;
pub mod storage;
pub mod task;

pub use job::{
    CronJob, CronJobId, Job, JobCategory, JobId, JobMessage, JobState, MessageLevel, Queue,
    QueueId,
};
pub use retry::{
    builtin_strategy, ConstantRetryStrategy, JitterRetryStrategy, JobRetryer,
    LinearRetryStrategy, RetryStrategy, RetryerRegistry, SharedStrategy, SquaredRetryStrategy,
};
pub use storage::{InMemoryStorage, JobFilter, JobStorage, Pageable};
pub use task::{
    FnHandler, JobProgress, TaskContext, TaskDescriptor, TaskHandler, TaskRegistry,
};

/// Shared storage handle.
pub type SharedStorage = std::sync::Arc<dyn JobStorage>;
