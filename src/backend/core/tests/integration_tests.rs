//! Integration tests for the Taskmill engine.
//!
//! These tests run the full engine (pool, scheduler, breaker) against
//! in-memory storage. Tokio time is paused, so timers advance
//! instantly; job timestamps come from a manual clock that the tests
//! move forward by hand.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskmill_core::clock::{Clock, ManualClock};
use taskmill_core::config::EngineConfig;
use taskmill_core::engine::{CircuitState, Engine};
use taskmill_core::error::{ErrorCode, TaskError, TaskResult};
use taskmill_core::jobs::{
    CronJob, FnHandler, InMemoryStorage, Job, JobCategory, JobId, JobState, Queue, TaskContext,
    TaskDescriptor,
};
use taskmill_core::telemetry::{CollectingDispatcher, EngineEvent};

// ============================================================================
// Test Utilities
// ============================================================================

struct TestEngine {
    clock: Arc<ManualClock>,
    storage: Arc<InMemoryStorage>,
    events: Arc<CollectingDispatcher>,
    engine: Engine,
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.polling.concurrency = 2;
    config.polling.interval = Duration::from_millis(10);
    config.polling.shutdown_timeout = Duration::from_secs(5);
    config.scheduling.initial_delay = Duration::ZERO;
    config.scheduling.interval = Duration::from_millis(50);
    config.retry.default_strategy = "linear".to_string();
    config
}

fn build(config: EngineConfig, tasks: Vec<TaskDescriptor>) -> TestEngine {
    let clock = ManualClock::starting_now();
    let storage = Arc::new(InMemoryStorage::new(clock.clone()));
    let events = Arc::new(CollectingDispatcher::new());

    let mut builder = Engine::builder()
        .config(config)
        .storage(storage.clone())
        .clock(clock.clone())
        .dispatcher(events.clone());
    for task in tasks {
        builder = builder.task(task);
    }

    TestEngine {
        clock,
        storage,
        events,
        engine: builder.build().unwrap(),
    }
}

async fn succeed(_ctx: TaskContext) -> TaskResult {
    Ok(())
}

async fn always_fail(_ctx: TaskContext) -> TaskResult {
    Err(TaskError::new("always broken"))
}

async fn explode(_ctx: TaskContext) -> TaskResult {
    panic!("handler bug")
}

async fn sleep_ten_minutes(_ctx: TaskContext) -> TaskResult {
    tokio::time::sleep(Duration::from_secs(600)).await;
    Ok(())
}

async fn wait_for_cancel(ctx: TaskContext) -> TaskResult {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(()),
        _ = ctx.cancellation().cancelled() => Err(TaskError::new("cancelled")),
    }
}

fn ok_task() -> TaskDescriptor {
    TaskDescriptor::new("ok", FnHandler(succeed))
}

fn failing_task() -> TaskDescriptor {
    TaskDescriptor::new("broken", FnHandler(always_fail))
}

impl TestEngine {
    /// Let the engine run, moving the job clock one second per step so
    /// retry delays and cron schedules come due. Returns true once `done`
    /// holds.
    async fn run_until(&self, done: impl FnMut(&Self) -> bool) -> bool {
        self.run_until_with(Duration::from_secs(1), done).await
    }

    async fn run_until_with(&self, step: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..300 {
            if done(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.clock.advance(step);
        }
        done(self)
    }

    fn state(&self, id: JobId) -> JobState {
        self.storage.job(id).map(|j| j.state).unwrap()
    }
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_jobs_complete_end_to_end() {
    let t = build(fast_config(), vec![ok_task()]);
    let ids: Vec<JobId> = (0..5)
        .map(|i| t.storage.insert_job(Job::new("ok", Queue::new("default"), t.clock.now()).with_data(serde_json::json!({ "i": i }))))
        .collect();

    t.engine.start();
    assert!(t.run_until(|t| ids.iter().all(|id| t.state(*id) == JobState::Completed)).await);
    t.engine.shutdown().await.unwrap();

    assert_eq!(t.events.count("job.selected"), 5);
    assert_eq!(t.events.count("job.completed"), 5);
    assert_eq!(t.engine.stats().pool.processed, 5);
}

#[tokio::test(start_paused = true)]
async fn test_flaky_job_retries_until_it_succeeds() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let flaky = TaskDescriptor::new(
        "flaky",
        FnHandler(move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::new("not yet"))
                } else {
                    Ok(())
                }
            }
        }),
    );
    let t = build(fast_config(), vec![flaky]);
    let id = t.storage.insert_job(Job::new("flaky", Queue::new("default"), t.clock.now()).with_max_retries(5));

    t.engine.start();
    assert!(t.run_until(|t| t.state(id) == JobState::Completed).await);
    t.engine.shutdown().await.unwrap();

    let job = t.storage.job(id).unwrap();
    assert_eq!(job.retries, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(t.events.count("job.retrying"), 2);
    assert_eq!(t.storage.messages().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_job_fails_with_recorded_error() {
    let t = build(fast_config(), vec![failing_task()]);
    let id = t.storage.insert_job(Job::new("broken", Queue::new("default"), t.clock.now()).with_max_retries(2));

    t.engine.start();
    assert!(t.run_until(|t| t.state(id) == JobState::Failed).await);
    t.engine.shutdown().await.unwrap();

    let job = t.storage.job(id).unwrap();
    assert_eq!(job.retries, 2);
    assert!(job.failed_at.is_some());
    assert_eq!(t.events.count("job.failed"), 1);

    let messages = t.storage.messages();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| m.message == "always broken"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_handler_and_timeout_are_task_failures() {
    let t = build(fast_config(), vec![TaskDescriptor::new("slow", FnHandler(sleep_ten_minutes))]);
    let missing = t.storage.insert_job(Job::new("missing", Queue::new("default"), t.clock.now()).with_max_retries(0));
    let timed_out = t.storage.insert_job(
        Job::new("slow", Queue::new("default"), t.clock.now())
            .with_max_retries(0)
            .with_timeout(Duration::from_secs(1)),
    );

    // The job clock stands still so the janitor never sees the slow job as stuck.
    t.engine.start();
    assert!(
        t.run_until_with(Duration::ZERO, |t| {
            t.state(missing) == JobState::Failed && t.state(timed_out) == JobState::Failed
        })
        .await
    );
    t.engine.shutdown().await.unwrap();

    let failures: Vec<TaskError> = t
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::JobFailed { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|e| e.code.as_deref() == Some("TaskNotFound")));
    assert!(failures.iter().any(|e| e.timed_out));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_does_not_kill_workers() {
    let panicky = TaskDescriptor::new("panicky", FnHandler(explode));
    let t = build(fast_config(), vec![panicky, ok_task()]);
    let bad = t.storage.insert_job(Job::new("panicky", Queue::new("default"), t.clock.now()).with_max_retries(0));
    let good = t.storage.insert_job(Job::new("ok", Queue::new("default"), t.clock.now()));

    t.engine.start();
    assert!(t.run_until(|t| t.state(bad) == JobState::Failed && t.state(good) == JobState::Completed).await);

    let stats = t.engine.stats();
    assert_eq!(stats.pool.worker_panics, 0);
    assert_eq!(stats.pool.active_workers, 2);
    t.engine.shutdown().await.unwrap();
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cron_jobs_fire_and_run() {
    let t = build(fast_config(), vec![ok_task()]);
    let cron = t
        .storage
        .insert_cron_job(CronJob::new("every-minute", "* * * * *", "ok", Queue::new("default")));

    t.engine.start();
    assert!(
        t.run_until(|t| {
            t.storage
                .jobs_in_state(JobState::Completed)
                .iter()
                .filter(|j| j.category == JobCategory::Scheduled)
                .count()
                >= 2
        })
        .await
    );
    t.engine.shutdown().await.unwrap();

    let cron = t.storage.cron_job(cron).unwrap();
    assert!(cron.next_run_at.unwrap() > t.clock.now() - chrono::Duration::minutes(1));
    assert!(t.events.count("cron.scheduled") >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_janitor_rescues_abandoned_execution() {
    let t = build(fast_config(), vec![ok_task()]);
    let mut abandoned = Job::new("ok", Queue::new("default"), t.clock.now()).with_timeout(Duration::from_secs(60));
    abandoned.mark_executing(t.clock.now() - chrono::Duration::minutes(10));
    let id = t.storage.insert_job(abandoned);

    t.engine.start();
    assert!(t.run_until(|t| t.state(id) == JobState::Completed).await);
    t.engine.shutdown().await.unwrap();

    assert_eq!(t.storage.job(id).unwrap().retries, 1);
    let names = t.events.names();
    let rescued = names.iter().position(|n| *n == "job.rescued").unwrap();
    let completed = names.iter().position(|n| *n == "job.completed").unwrap();
    assert!(rescued < completed);
}

#[tokio::test(start_paused = true)]
async fn test_retention_prunes_finished_jobs() {
    let mut config = fast_config();
    config.retention.period = "1h".to_string();
    let t = build(config, vec![ok_task()]);

    let mut old = Job::new("ok", Queue::new("default"), t.clock.now());
    old.mark_completed(t.clock.now() - chrono::Duration::hours(2));
    let old = t.storage.insert_job(old);
    let fresh = t.storage.insert_job(Job::new("ok", Queue::new("default"), t.clock.now()));

    t.engine.start();
    assert!(t.run_until(|t| t.storage.job(old).is_none()).await);
    t.engine.shutdown().await.unwrap();

    assert!(t.storage.job(fresh).is_some());
    assert!(t.events.count("jobs.deleted") >= 1);
}

// ============================================================================
// Resilience & Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_storage_outage_opens_breaker_then_recovers() {
    let t = build(fast_config(), vec![ok_task()]);
    let id = t.storage.insert_job(Job::new("ok", Queue::new("default"), t.clock.now()));
    t.storage.set_available(false);

    t.engine.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(t.engine.breaker().state(), CircuitState::Open);

    // While open, storage is left alone.
    let calls = t.storage.call_count();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(t.storage.call_count(), calls);
    assert!(t.engine.stats().circuit_breaker.total_rejected > 0);

    t.storage.set_available(true);
    assert!(t.run_until(|t| t.state(id) == JobState::Completed).await);
    assert!(t.run_until(|t| t.engine.breaker().state() == CircuitState::Closed).await);
    t.engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_jobs_until_resume() {
    let t = build(fast_config(), vec![ok_task()]);
    t.engine.start();
    t.engine.pause();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let id = t.storage.insert_job(Job::new("ok", Queue::new("default"), t.clock.now()));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(t.state(id), JobState::Enqueued);

    t.engine.resume();
    assert!(t.run_until(|t| t.state(id) == JobState::Completed).await);
    t.engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_times_out_on_long_job() {
    let mut config = fast_config();
    config.polling.shutdown_timeout = Duration::from_secs(1);
    let t = build(config, vec![TaskDescriptor::new("long", FnHandler(wait_for_cancel))]);
    let id = t.storage.insert_job(Job::new("long", Queue::new("default"), t.clock.now()).with_timeout(Duration::ZERO));

    t.engine.start();
    assert!(t.run_until(|t| t.state(id) == JobState::Executing).await);

    let err = t.engine.shutdown().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ShutdownTimeout);

    t.engine.shutdown_now();
    assert!(!t.engine.stats().scheduling.running);
}
