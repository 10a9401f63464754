//! Task handlers and the registry the processor resolves them from.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Job, JobId};
use crate::error::TaskResult;
use crate::telemetry::{EngineEvent, SharedDispatcher};

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// User code that executes a job.
///
/// Return a [`TaskError`](crate::error::TaskError) to fail the attempt; the
/// engine then applies the job's retry budget.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> TaskResult;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = TaskResult> + Send + 'static,
{
    async fn run(&self, ctx: &TaskContext) -> TaskResult {
        (self.0)(ctx.clone()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Descriptor & Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Registration record for a handler.
#[derive(Clone)]
pub struct TaskDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// Registry name of the backoff to use; `None` means the default
    pub retry_strategy: Option<String>,
    /// Used when the job itself carries no timeout
    pub timeout: Option<Duration>,
    pub handler: Arc<dyn TaskHandler>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        Self {
            name: name.into(),
            description: None,
            retry_strategy: None,
            timeout: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retry_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.retry_strategy = Some(strategy.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("retry_strategy", &self.retry_strategy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Handler lookup table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskDescriptor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one with the same name.
    pub fn register(&mut self, descriptor: TaskDescriptor) -> &mut Self {
        if self.tasks.contains_key(&descriptor.name) {
            tracing::warn!(task = %descriptor.name, "Replacing registered task");
        }
        self.tasks.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn get_by_name(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Progress update from a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    /// Progress percentage (0-100)
    pub percent: u8,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

/// What a handler sees while it runs.
#[derive(Clone)]
pub struct TaskContext {
    job: Arc<Job>,
    env: Arc<HashMap<String, String>>,
    span: tracing::Span,
    dispatcher: SharedDispatcher,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(
        job: Job,
        env: Arc<HashMap<String, String>>,
        dispatcher: SharedDispatcher,
        cancellation: CancellationToken,
    ) -> Self {
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            handler = %job.handler,
            queue = %job.queue.name,
            attempt = job.retries.saturating_add(1),
        );
        Self {
            job: Arc::new(job),
            env,
            span,
            dispatcher,
            cancellation,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.retries.saturating_add(1)
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.job.data
    }

    /// Deserialize the payload into a typed value.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<T> {
        Ok(serde_json::from_value(self.job.data.clone())?)
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Span carrying the job's identity; enter it for job-scoped logging.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Set when the engine is shutting down without grace.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn report_progress(&self, percent: u8, message: Option<String>) {
        let progress = JobProgress {
            job_id: self.job.id,
            percent: percent.min(100),
            message,
            timestamp: Utc::now(),
        };
        self.dispatcher.dispatch(EngineEvent::JobProgress(progress));
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("job_id", &self.job.id)
            .field("handler", &self.job.handler)
            .field("attempt", &self.attempt())
            .finish_non_exhaustive()
    }
}
