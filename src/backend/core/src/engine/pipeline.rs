//! Per-iteration job execution: pick, run the handler, record the outcome.
//!
//! Nothing a handler does can escape this module. Errors, timeouts,
//! panics and unknown handler names all become task failures that the
//! result processor classifies as retryable or failed.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::circuit_breaker::SharedBreaker;
use super::polling::{IterationStatus, LoopRunner};
use super::pool::panic_message;
use super::result::JobResultProcessor;
use crate::error::{EngineError, ErrorCode, TaskError, TaskResult};
use crate::jobs::{Job, RetryerRegistry, SharedStorage, TaskContext, TaskDescriptor, TaskRegistry};
use crate::telemetry::{EngineEvent, JobMetrics, SharedDispatcher};

// ═══════════════════════════════════════════════════════════════════════════════
// Picker
// ═══════════════════════════════════════════════════════════════════════════════

/// Claims one ready job through the circuit breaker.
pub struct JobPicker {
    storage: SharedStorage,
    breaker: SharedBreaker,
    dispatcher: SharedDispatcher,
}

impl JobPicker {
    pub fn new(storage: SharedStorage, breaker: SharedBreaker, dispatcher: SharedDispatcher) -> Self {
        Self {
            storage,
            breaker,
            dispatcher,
        }
    }

    /// The next job, or `None` when nothing is ready or storage is down.
    pub async fn pick(&self) -> Option<Job> {
        let started = Instant::now();
        let storage = &self.storage;

        match self.breaker.call(|| storage.pick_job()).await {
            Ok(Some(job)) => {
                let latency = started.elapsed();
                self.dispatcher.dispatch(EngineEvent::JobSelected {
                    job: job.clone(),
                    latency,
                });
                Some(job)
            }
            Ok(None) => None,
            Err(err) if err.code() == ErrorCode::CircuitOpen => {
                tracing::trace!("Circuit open, skipping pick");
                None
            }
            Err(err) => {
                err.log();
                None
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Processor
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs a picked job's handler and hands the outcome on.
pub struct JobProcessor {
    tasks: Arc<TaskRegistry>,
    retryers: Arc<RetryerRegistry>,
    results: Arc<JobResultProcessor>,
    dispatcher: SharedDispatcher,
    env: Arc<HashMap<String, String>>,
    cancellation: CancellationToken,
}

impl JobProcessor {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        retryers: Arc<RetryerRegistry>,
        results: Arc<JobResultProcessor>,
        dispatcher: SharedDispatcher,
    ) -> Self {
        Self {
            tasks,
            retryers,
            results,
            dispatcher,
            env: Arc::new(HashMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Environment exposed to handlers through their context.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Parent of every handler's cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Run the job and persist its outcome.
    pub async fn process(&self, job: Job) {
        let descriptor = self.tasks.get_by_name(&job.handler);
        let strategy = self
            .retryers
            .resolve(descriptor.and_then(|d| d.retry_strategy.as_deref()));

        let started = Instant::now();
        let outcome = match descriptor {
            Some(descriptor) => self.run_handler(descriptor, &job).await,
            None => Err(TaskError::from(EngineError::task_not_found(&job.handler))),
        };
        let elapsed = started.elapsed();

        let job_id = job.id;
        let result = match outcome {
            Ok(()) => {
                JobMetrics::record_execution(&job.handler, "completed", elapsed);
                self.results.handle_successful(job).await
            }
            Err(error) => {
                let outcome = if error.timed_out { "timed_out" } else { "failed" };
                JobMetrics::record_execution(&job.handler, outcome, elapsed);
                self.results.handle_failed(job, &error, strategy.as_ref()).await
            }
        };

        // The job stays executing in storage; the janitor reclaims it.
        if let Err(err) = result {
            tracing::error!(job_id = %job_id, error = %err, "Failed to persist job outcome");
        }
    }

    async fn run_handler(&self, descriptor: &TaskDescriptor, job: &Job) -> TaskResult {
        let limit = effective_timeout(job, descriptor);
        let ctx = TaskContext::new(
            job.clone(),
            self.env.clone(),
            self.dispatcher.clone(),
            self.cancellation.child_token(),
        );
        let span = ctx.span().clone();
        let handler = descriptor.handler.clone();

        let run = AssertUnwindSafe(async move { handler.run(&ctx).await })
            .catch_unwind()
            .instrument(span);

        let caught = match limit {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(caught) => caught,
                Err(_) => return Err(TaskError::timeout(limit)),
            },
            None => run.await,
        };

        caught.unwrap_or_else(|panic| {
            Err(TaskError::new(format!("Task panicked: {}", panic_message(&*panic)))
                .with_code(ErrorCode::TaskPanicked.to_string()))
        })
    }
}

/// The job's own timeout, else the descriptor's; zero means unbounded.
fn effective_timeout(job: &Job, descriptor: &TaskDescriptor) -> Option<Duration> {
    if !job.timeout.is_zero() {
        Some(job.timeout)
    } else {
        descriptor.timeout.filter(|t| !t.is_zero())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════════════════════════

/// Loop body for the execution pool.
pub struct JobExecution {
    picker: JobPicker,
    processor: JobProcessor,
}

impl JobExecution {
    pub fn new(picker: JobPicker, processor: JobProcessor) -> Self {
        Self { picker, processor }
    }
}

#[async_trait]
impl LoopRunner for JobExecution {
    async fn execute(&self) -> IterationStatus {
        match self.picker.pick().await {
            Some(job) => {
                self.processor.process(job).await;
                IterationStatus::Processed
            }
            None => IterationStatus::Skipped,
        }
    }
}
