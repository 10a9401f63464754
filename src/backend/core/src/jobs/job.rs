//! Job, queue and cron job records.
//!
//! This module provides the data the engine moves around:
//!
//! - **Job**: one unit of work and its lifecycle timestamps
//! - **JobState**: where a job sits in its lifecycle
//! - **Queue**: named grouping with a weight and a lock flag
//! - **CronJob**: a recurring definition materialized into jobs
//! - **JobMessage**: an error or note recorded against a job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::add_duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a job instance.
    JobId
);
uuid_id!(
    /// Unique identifier for a queue.
    QueueId
);
uuid_id!(
    /// Unique identifier for a cron definition.
    CronJobId
);

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for `scheduled_at`
    Scheduled,
    /// Ready to be picked by a worker
    Enqueued,
    /// Picked and running
    Executing,
    /// Failed, waiting for its next attempt
    Retryable,
    /// Finished successfully
    Completed,
    /// Failed with no retries left
    Failed,
    /// Dropped without running to completion
    Discarded,
}

impl JobState {
    /// Check if the job has left the active lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Discarded)
    }

    /// Check if the job is still moving through the engine.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// States the enqueue step promotes once their time has come.
    pub fn is_awaiting_schedule(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Retryable)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scheduled => "SCHEDULED",
            Self::Enqueued => "ENQUEUED",
            Self::Executing => "EXECUTING",
            Self::Retryable => "RETRYABLE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Discarded => "DISCARDED",
        };
        f.write_str(name)
    }
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobCategory {
    /// Enqueued by a client
    #[default]
    Normal,
    /// Materialized from a cron definition
    Scheduled,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Named grouping of jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub name: String,
    /// Relative share of worker attention; interpreted by storage
    pub weight: u32,
    /// A locked queue does not fire its cron jobs
    pub locked: bool,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: QueueId::new(),
            name: name.into(),
            weight: 1,
            locked: false,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Optional client-supplied key
    pub identifier: Option<String>,
    pub queue: Queue,
    /// Name the task registry resolves
    pub handler: String,
    pub state: JobState,
    pub category: JobCategory,
    /// Opaque payload
    pub data: serde_json::Value,
    pub retries: u32,
    pub max_retries: u32,
    /// Execution budget; zero means unbounded
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub executing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a job that is ready to run at `now`.
    pub fn new(handler: impl Into<String>, queue: Queue, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            identifier: None,
            queue,
            handler: handler.into(),
            state: JobState::Enqueued,
            category: JobCategory::Normal,
            data: serde_json::Value::Null,
            retries: 0,
            max_retries: 3,
            timeout: Duration::from_secs(300),
            tags: BTreeSet::new(),
            created_at: now,
            scheduled_at: Some(now),
            executing_at: None,
            completed_at: None,
            failed_at: None,
            discarded_at: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Defer the job until `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self.state = JobState::Scheduled;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn mark_enqueued(&mut self) {
        self.state = JobState::Enqueued;
    }

    pub fn mark_executing(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Executing;
        self.executing_at = Some(now);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.completed_at = Some(now);
        self.failed_at = None;
        self.discarded_at = None;
    }

    /// Count the failed attempt and park the job until `next_at`.
    pub fn mark_retryable(&mut self, next_at: DateTime<Utc>) {
        self.retries = self.retries.saturating_add(1);
        self.state = JobState::Retryable;
        self.scheduled_at = Some(next_at);
        self.executing_at = None;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.failed_at = Some(now);
        self.completed_at = None;
        self.discarded_at = None;
    }

    pub fn mark_discarded(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Discarded;
        self.discarded_at = Some(now);
        self.completed_at = None;
        self.failed_at = None;
    }

    /// Reset a stuck job so it runs again.
    ///
    /// A job already at its retry budget gets exactly one more: the budget
    /// is raised to `retries + 1`, which is the same value however many
    /// times the rescue is applied to the same snapshot.
    pub fn rescue(&mut self, now: DateTime<Utc>) {
        if self.retries >= self.max_retries {
            self.max_retries = self.retries.saturating_add(1);
        }
        self.retries = self.retries.saturating_add(1);
        self.state = JobState::Retryable;
        self.scheduled_at = Some(now);
        self.executing_at = None;
        self.completed_at = None;
        self.failed_at = None;
        self.discarded_at = None;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// True when the job is executing past its timeout.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Executing || self.timeout.is_zero() {
            return false;
        }
        match self.executing_at {
            Some(started) => add_duration(started, self.timeout) < now,
            None => false,
        }
    }

    /// True when `scheduled_at` has been reached.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    /// When the job left the active lifecycle, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.failed_at).or(self.discarded_at)
    }

    pub fn has_retries_left(&self) -> bool {
        self.retries < self.max_retries
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cron Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A recurring job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: CronJobId,
    pub name: String,
    pub expression: String,
    pub handler: String,
    pub queue: Queue,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Payload copied into every derived job
    pub data: serde_json::Value,
    pub tags: BTreeSet<String>,
}

impl CronJob {
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        handler: impl Into<String>,
        queue: Queue,
    ) -> Self {
        Self {
            id: CronJobId::new(),
            name: name.into(),
            expression: expression.into(),
            handler: handler.into(),
            queue,
            max_retries: 3,
            timeout: Duration::from_secs(300),
            enabled: true,
            next_run_at: None,
            data: serde_json::Value::Null,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// Enabled, on an unlocked queue, and never run or already past due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !self.queue.locked
            && self.next_run_at.map_or(true, |at| at <= now)
    }

    /// Derive the concrete job for one firing.
    pub fn to_job(&self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            identifier: Some(self.name.clone()),
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            state: JobState::Scheduled,
            category: JobCategory::Scheduled,
            data: self.data.clone(),
            retries: 0,
            max_retries: self.max_retries,
            timeout: self.timeout,
            tags: self.tags.clone(),
            created_at: now,
            scheduled_at: Some(now),
            executing_at: None,
            completed_at: None,
            failed_at: None,
            discarded_at: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Message
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity of a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warn,
    Error,
}

/// A note attached to a job, typically the error behind a retry or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub level: MessageLevel,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn error(job_id: JobId, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            level: MessageLevel::Error,
            message: message.into(),
            detail: None,
            created_at: now,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Discarded.is_terminal());
        assert!(!JobState::Executing.is_terminal());
        assert!(JobState::Retryable.is_awaiting_schedule());
        assert!(!JobState::Enqueued.is_awaiting_schedule());
    }

    #[test]
    fn test_new_job_is_stamped_with_given_time() {
        let job = Job::new("report", Queue::new("default"), at(42));
        assert_eq!(job.created_at, at(42));
        assert_eq!(job.scheduled_at, Some(at(42)));
        assert_eq!(job.state, JobState::Enqueued);
    }

    #[test]
    fn test_exactly_one_terminal_timestamp() {
        let mut job = Job::new("report", Queue::new("default"), at(0));
        job.mark_completed(at(1));
        job.mark_failed(at(2));
        assert_eq!(job.finished_at(), Some(at(2)));
        assert!(job.completed_at.is_none());
        assert!(job.discarded_at.is_none());
    }

    #[test]
    fn test_mark_retryable_clears_execution() {
        let mut job = Job::new("report", Queue::new("default"), at(0));
        job.mark_executing(at(0));
        job.mark_retryable(at(30));

        assert_eq!(job.state, JobState::Retryable);
        assert_eq!(job.retries, 1);
        assert_eq!(job.scheduled_at, Some(at(30)));
        assert!(job.executing_at.is_none());
    }

    #[test]
    fn test_is_stale() {
        let mut job = Job::new("report", Queue::new("default"), at(0))
            .with_timeout(Duration::from_secs(60));
        assert!(!job.is_stale(at(1000)));

        job.mark_executing(at(0));
        assert!(!job.is_stale(at(60)));
        assert!(job.is_stale(at(61)));

        job.timeout = Duration::ZERO;
        assert!(!job.is_stale(at(10_000)));
    }

    #[test]
    fn test_rescue_within_budget() {
        let mut job = Job::new("report", Queue::new("default"), at(0))
            .with_retries(2)
            .with_max_retries(5);
        job.mark_executing(at(0));
        job.rescue(at(100));

        assert_eq!(job.state, JobState::Retryable);
        assert_eq!(job.retries, 3);
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.scheduled_at, Some(at(100)));
        assert!(job.executing_at.is_none());
    }

    #[test]
    fn test_rescue_exhausted_budget_grants_one_more() {
        let mut job = Job::new("report", Queue::new("default"), at(0))
            .with_retries(4)
            .with_max_retries(4);
        job.mark_executing(at(0));
        job.rescue(at(100));

        assert_eq!(job.retries, 5);
        assert_eq!(job.max_retries, 5);
        assert!(!job.has_retries_left());
    }

    #[test]
    fn test_retry_counters_saturate() {
        let mut job = Job::new("report", Queue::new("default"), at(0)).with_retries(u32::MAX);
        job.mark_retryable(at(10));
        assert_eq!(job.retries, u32::MAX);

        let mut stuck = Job::new("report", Queue::new("default"), at(0))
            .with_retries(u32::MAX)
            .with_max_retries(u32::MAX);
        stuck.mark_executing(at(0));
        stuck.rescue(at(100));
        assert_eq!(stuck.retries, u32::MAX);
        assert_eq!(stuck.max_retries, u32::MAX);
        assert_eq!(stuck.state, JobState::Retryable);
    }

    #[test]
    fn test_cron_job_due() {
        let queue = Queue::new("maintenance");
        let cron = CronJob::new("nightly", "0 3 * * *", "cleanup", queue.clone());
        assert!(cron.is_due(at(0)));

        let later = cron.clone().next_run_at(at(10));
        assert!(!later.is_due(at(5)));
        assert!(later.is_due(at(10)));

        assert!(!cron.clone().disabled().is_due(at(0)));

        let locked = CronJob::new("nightly", "0 3 * * *", "cleanup", queue.locked());
        assert!(!locked.is_due(at(0)));
    }

    #[test]
    fn test_cron_job_to_job() {
        let cron = CronJob::new("nightly", "0 3 * * *", "cleanup", Queue::new("maintenance"))
            .with_max_retries(7)
            .with_timeout(Duration::from_secs(45));
        let job = cron.to_job(at(0));

        assert_eq!(job.category, JobCategory::Scheduled);
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.retries, 0);
        assert_eq!(job.max_retries, 7);
        assert_eq!(job.timeout, Duration::from_secs(45));
        assert_eq!(job.handler, "cleanup");
        assert_eq!(job.queue.name, "maintenance");
    }

    #[test]
    fn test_job_serializes_timeout_as_text() {
        let job = Job::new("report", Queue::new("default"), at(0)).with_timeout(Duration::from_secs(90));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["timeout"], "1m 30s");
        assert_eq!(value["state"], "ENQUEUED");
    }
}
