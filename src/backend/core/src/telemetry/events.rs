//! Engine events and the sinks they are dispatched to.
//!
//! Events are named value objects carrying the affected entity. The
//! engine never waits on a sink: `dispatch` is synchronous and must not
//! block.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TaskError;
use crate::jobs::{CronJob, Job, JobProgress};

/// Something the engine did to a job or cron definition.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Promoted to the executable state by the enqueue step
    JobEnqueued(Job),
    /// Picked by a worker
    JobSelected { job: Job, latency: Duration },
    JobCompleted(Job),
    /// Failed and parked for another attempt
    JobRetrying { job: Job, error: TaskError },
    /// Failed with no retries left
    JobFailed { job: Job, error: TaskError },
    JobProgress(JobProgress),
    /// Reclaimed from a stuck execution by the janitor
    JobRescued(Job),
    CronScheduled { cron: CronJob, job: Job },
    JobsDeleted { count: u64, older_than: DateTime<Utc> },
}

impl EngineEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobEnqueued(_) => "job.enqueued",
            Self::JobSelected { .. } => "job.selected",
            Self::JobCompleted(_) => "job.completed",
            Self::JobRetrying { .. } => "job.retrying",
            Self::JobFailed { .. } => "job.failed",
            Self::JobProgress(_) => "job.progress",
            Self::JobRescued(_) => "job.rescued",
            Self::CronScheduled { .. } => "cron.scheduled",
            Self::JobsDeleted { .. } => "jobs.deleted",
        }
    }

    /// The job this event concerns, if any.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::JobEnqueued(job)
            | Self::JobCompleted(job)
            | Self::JobRescued(job)
            | Self::JobSelected { job, .. }
            | Self::JobRetrying { job, .. }
            | Self::JobFailed { job, .. }
            | Self::CronScheduled { job, .. } => Some(job),
            Self::JobProgress(_) | Self::JobsDeleted { .. } => None,
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of engine events.
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: EngineEvent);
}

/// Shared dispatcher handle.
pub type SharedDispatcher = Arc<dyn EventDispatcher>;

// ═══════════════════════════════════════════════════════════════════════════════
// Tracing Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Logs every event and feeds the metrics recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDispatcher;

impl TracingDispatcher {
    pub fn shared() -> SharedDispatcher {
        Arc::new(Self)
    }
}

impl EventDispatcher for TracingDispatcher {
    fn dispatch(&self, event: EngineEvent) {
        let name = event.name();
        counter!("taskmill_events_total", "event" => name).increment(1);

        match &event {
            EngineEvent::JobSelected { job, latency } => {
                histogram!("taskmill_pick_latency_seconds").record(latency.as_secs_f64());
                tracing::debug!(
                    event = name,
                    job_id = %job.id,
                    handler = %job.handler,
                    latency_ms = latency.as_millis() as u64,
                    "Job selected"
                );
            }
            EngineEvent::JobRetrying { job, error } => {
                tracing::warn!(
                    event = name,
                    job_id = %job.id,
                    handler = %job.handler,
                    retries = job.retries,
                    max_retries = job.max_retries,
                    next_attempt_at = ?job.scheduled_at,
                    error = %error,
                    "Job failed, retry scheduled"
                );
            }
            EngineEvent::JobFailed { job, error } => {
                tracing::error!(
                    event = name,
                    job_id = %job.id,
                    handler = %job.handler,
                    retries = job.retries,
                    error = %error,
                    "Job failed permanently"
                );
            }
            EngineEvent::JobProgress(progress) => {
                tracing::debug!(
                    event = name,
                    job_id = %progress.job_id,
                    percent = progress.percent,
                    message = ?progress.message,
                    "Job progress"
                );
            }
            EngineEvent::CronScheduled { cron, job } => {
                tracing::info!(
                    event = name,
                    cron = %cron.name,
                    job_id = %job.id,
                    next_run_at = ?cron.next_run_at,
                    "Cron job fired"
                );
            }
            EngineEvent::JobsDeleted { count, older_than } => {
                tracing::info!(event = name, count, older_than = %older_than, "Old jobs deleted");
            }
            EngineEvent::JobRescued(job) => {
                tracing::warn!(
                    event = name,
                    job_id = %job.id,
                    handler = %job.handler,
                    retries = job.retries,
                    max_retries = job.max_retries,
                    "Stuck job reclaimed"
                );
            }
            EngineEvent::JobEnqueued(job) | EngineEvent::JobCompleted(job) => {
                tracing::debug!(event = name, job_id = %job.id, handler = %job.handler, "Job event");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collecting Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Keeps every event in memory. Useful in tests and for hosts that poll.
#[derive(Debug, Default)]
pub struct CollectingDispatcher {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(EngineEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventDispatcher for CollectingDispatcher {
    fn dispatch(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Sends each event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutDispatcher {
    sinks: Vec<SharedDispatcher>,
}

impl FanoutDispatcher {
    pub fn new(sinks: Vec<SharedDispatcher>) -> Self {
        Self { sinks }
    }
}

impl EventDispatcher for FanoutDispatcher {
    fn dispatch(&self, event: EngineEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.dispatch(event.clone());
            }
            last.dispatch(event);
        }
    }
}
