//! Applies the outcome of an attempt to its job and persists it.

use serde_json::json;
use std::sync::Arc;

use super::circuit_breaker::SharedBreaker;
use crate::clock::SharedClock;
use crate::error::{Result, TaskError};
use crate::jobs::{Job, JobMessage, JobRetryer, RetryStrategy, SharedStorage};
use crate::telemetry::{EngineEvent, SharedDispatcher};

/// Turns handler outcomes into job state transitions.
///
/// Saves go through the storage breaker, so an outage while recording
/// results trips it just like one while picking.
pub struct JobResultProcessor {
    storage: SharedStorage,
    breaker: SharedBreaker,
    retryer: JobRetryer,
    clock: SharedClock,
    dispatcher: SharedDispatcher,
}

impl JobResultProcessor {
    pub fn new(
        storage: SharedStorage,
        breaker: SharedBreaker,
        clock: SharedClock,
        dispatcher: SharedDispatcher,
    ) -> Self {
        Self {
            storage,
            breaker,
            retryer: JobRetryer::new(clock.clone()),
            clock,
            dispatcher,
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Complete the job, whatever its retry counts.
    pub async fn handle_successful(&self, mut job: Job) -> Result<Job> {
        job.mark_completed(self.clock.now());
        self.save(&job).await?;

        tracing::debug!(
            job_id = %job.id,
            handler = %job.handler,
            attempt = job.retries.saturating_add(1),
            "Job completed"
        );
        self.dispatcher.dispatch(EngineEvent::JobCompleted(job.clone()));
        Ok(job)
    }

    /// Park the job for another attempt if its budget allows, otherwise
    /// fail it. The error is recorded against the job either way.
    pub async fn handle_failed(
        &self,
        mut job: Job,
        error: &TaskError,
        strategy: &dyn RetryStrategy,
    ) -> Result<Job> {
        let now = self.clock.now();
        let attempt = job.retries.saturating_add(1);
        let retryable = self.retryer.is_retryable(job.retries, job.max_retries);

        if retryable {
            // Delay for the attempt about to be scheduled, 1-based.
            let next_at = self.retryer.next_retry_at(job.retries.saturating_add(1), strategy);
            job.mark_retryable(next_at);
        } else {
            job.mark_failed(now);
        }
        self.save(&job).await?;

        let message = JobMessage::error(job.id, error.message.clone(), now).with_detail(json!({
            "code": error.code,
            "context": error.context,
            "timed_out": error.timed_out,
            "attempt": attempt,
            "strategy": strategy.name(),
        }));
        if let Err(err) = self
            .breaker
            .call(|| self.storage.save_job_message(&message))
            .await
        {
            tracing::warn!(job_id = %job.id, error = %err, "Failed to record job message");
        }

        let event = if retryable {
            EngineEvent::JobRetrying {
                job: job.clone(),
                error: error.clone(),
            }
        } else {
            EngineEvent::JobFailed {
                job: job.clone(),
                error: error.clone(),
            }
        };
        self.dispatcher.dispatch(event);
        Ok(job)
    }

    async fn save(&self, job: &Job) -> Result<()> {
        self.breaker.call(|| self.storage.save_job(job)).await
    }
}
