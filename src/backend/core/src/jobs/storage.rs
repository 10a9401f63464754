//! Storage contract consumed by the engine, plus an in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{CronJob, CronJobId, Job, JobId, JobMessage, JobState};
use crate::clock::SharedClock;
use crate::error::{EngineError, Result};

/// Selects jobs by state, queue and handler. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub states: Vec<JobState>,
    pub queue: Option<String>,
    pub handler: Option<String>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.states.is_empty() || self.states.contains(&job.state))
            && self.queue.as_deref().map_or(true, |q| job.queue.name == q)
            && self.handler.as_deref().map_or(true, |h| job.handler == h)
    }
}

/// Offset-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pageable {
    pub offset: usize,
    pub limit: usize,
}

impl Pageable {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self::new(0, limit)
    }
}

/// Persistence the engine needs. Implementations must be safe to call from
/// every worker and the scheduler at once.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Claim one ready job, moving it to `Executing`.
    async fn pick_job(&self) -> Result<Option<Job>>;

    /// Promote every due scheduled or retryable job to `Enqueued`, returning them.
    async fn enqueue_jobs(&self) -> Result<Vec<Job>>;

    /// Insert or replace a job.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Jobs matching `filter`, in a stable order.
    async fn get_jobs(&self, filter: &JobFilter, page: Pageable) -> Result<Vec<Job>>;

    async fn get_all_cron_jobs(&self) -> Result<Vec<CronJob>>;

    /// Insert or replace a cron definition.
    async fn save_cron_job(&self, cron_job: &CronJob) -> Result<()>;

    /// Remove finished jobs older than `older_than`, returning how many went.
    async fn delete_all_jobs(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn save_job_message(&self, message: &JobMessage) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Storage
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct StorageState {
    jobs: HashMap<JobId, Job>,
    cron_jobs: HashMap<CronJobId, CronJob>,
    messages: Vec<JobMessage>,
}

/// Storage held entirely in process memory.
///
/// Picks favour the heaviest queue, then the job that has waited longest.
/// [`set_available`](Self::set_available) simulates an outage: while off,
/// every call fails with `StorageUnavailable`.
#[derive(Debug)]
pub struct InMemoryStorage {
    state: RwLock<StorageState>,
    clock: SharedClock,
    available: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryStorage {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(StorageState::default()),
            clock,
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Trait calls made so far, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Insert a job directly, bypassing availability.
    pub fn insert_job(&self, job: Job) -> JobId {
        let id = job.id;
        self.state.write().jobs.insert(id, job);
        id
    }

    pub fn insert_cron_job(&self, cron_job: CronJob) -> CronJobId {
        let id = cron_job.id;
        self.state.write().cron_jobs.insert(id, cron_job);
        id
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.state.read().jobs.get(&id).cloned()
    }

    pub fn cron_job(&self, id: CronJobId) -> Option<CronJob> {
        self.state.read().cron_jobs.get(&id).cloned()
    }

    /// All jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.read().jobs.values().cloned().collect();
        sort_stable(&mut jobs);
        jobs
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<Job> {
        self.jobs().into_iter().filter(|j| j.state == state).collect()
    }

    pub fn messages(&self) -> Vec<JobMessage> {
        self.state.read().messages.clone()
    }

    /// Lock or unlock a queue on every stored job and cron definition.
    pub fn set_queue_locked(&self, queue: &str, locked: bool) {
        let mut state = self.state.write();
        for job in state.jobs.values_mut().filter(|j| j.queue.name == queue) {
            job.queue.locked = locked;
        }
        for cron in state.cron_jobs.values_mut().filter(|c| c.queue.name == queue) {
            cron.queue.locked = locked;
        }
    }

    fn ensure_available(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_available() {
            Ok(())
        } else {
            Err(EngineError::storage_unavailable("In-memory storage is switched off"))
        }
    }
}

fn sort_stable(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl JobStorage for InMemoryStorage {
    async fn pick_job(&self) -> Result<Option<Job>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.write();

        let next = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Enqueued)
            .min_by(|a, b| {
                b.queue
                    .weight
                    .cmp(&a.queue.weight)
                    .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        Ok(next.and_then(|id| state.jobs.get_mut(&id)).map(|job| {
            job.mark_executing(now);
            job.clone()
        }))
    }

    async fn enqueue_jobs(&self) -> Result<Vec<Job>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.write();

        let mut promoted: Vec<Job> = state
            .jobs
            .values_mut()
            .filter(|j| j.state.is_awaiting_schedule() && j.is_due(now))
            .map(|job| {
                job.mark_enqueued();
                job.clone()
            })
            .collect();
        sort_stable(&mut promoted);
        Ok(promoted)
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.ensure_available()?;
        self.state.write().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_jobs(&self, filter: &JobFilter, page: Pageable) -> Result<Vec<Job>> {
        self.ensure_available()?;
        let mut jobs: Vec<Job> = self
            .state
            .read()
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        sort_stable(&mut jobs);
        Ok(jobs.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn get_all_cron_jobs(&self) -> Result<Vec<CronJob>> {
        self.ensure_available()?;
        let mut crons: Vec<CronJob> = self.state.read().cron_jobs.values().cloned().collect();
        crons.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(crons)
    }

    async fn save_cron_job(&self, cron_job: &CronJob) -> Result<()> {
        self.ensure_available()?;
        self.state
            .write()
            .cron_jobs
            .insert(cron_job.id, cron_job.clone());
        Ok(())
    }

    async fn delete_all_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let purged: HashSet<JobId> = state
            .jobs
            .values()
            .filter(|job| job.state.is_terminal() && job.finished_at().map_or(false, |at| at < older_than))
            .map(|job| job.id)
            .collect();
        if purged.is_empty() {
            return Ok(0);
        }

        state.jobs.retain(|id, _| !purged.contains(id));
        state.messages.retain(|message| !purged.contains(&message.job_id));
        Ok(purged.len() as u64)
    }

    async fn save_job_message(&self, message: &JobMessage) -> Result<()> {
        self.ensure_available()?;
        self.state.write().messages.push(message.clone());
        Ok(())
    }
}
