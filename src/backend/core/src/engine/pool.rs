//! Execution Pool - a fixed set of polling workers sharing one loop strategy.
//!
//! The `PollingExecutionPool` provides:
//! - `concurrency` worker loops, each picking and running one job at a time
//! - Pause/resume of all workers together
//! - Cooperative shutdown with a deadline, and immediate shutdown
//! - A supervisor around every worker that logs panics instead of losing them

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::loop_strategy::LoopStrategy;
use super::polling::{LoopRunner, PollingLoop, PollingStats};
use crate::telemetry::JobMetrics;

/// Configuration for the execution pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name for this pool (for logging/metrics)
    pub name: String,
    /// Number of worker loops
    pub concurrency: usize,
    /// Wait between iterations of each loop
    pub interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "jobs".to_string(),
            concurrency: 4,
            interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Internal counters.
#[derive(Default)]
struct PoolCounters {
    active_workers: AtomicUsize,
    workers_spawned: AtomicU64,
    worker_panics: AtomicU64,
}

/// Decrements the active worker count however the worker ends.
struct ActiveWorker(Arc<PoolCounters>);

impl ActiveWorker {
    fn enter(counters: Arc<PoolCounters>) -> Self {
        let active = counters.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        JobMetrics::set_active_workers(active);
        Self(counters)
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        let active = self.0.active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        JobMetrics::set_active_workers(active);
    }
}

/// Runs a [`LoopRunner`] on `concurrency` workers.
pub struct PollingExecutionPool {
    config: PoolConfig,
    strategy: Arc<LoopStrategy>,
    runner: Arc<dyn LoopRunner>,
    polling_stats: Arc<PollingStats>,
    counters: Arc<PoolCounters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    /// Tripped by `shutdown_now` so running handlers can bail out
    abort: CancellationToken,
    created_at: Instant,
}

impl PollingExecutionPool {
    pub fn new(config: PoolConfig, runner: Arc<dyn LoopRunner>) -> Self {
        tracing::info!(
            pool_name = %config.name,
            concurrency = config.concurrency,
            interval_ms = config.interval.as_millis() as u64,
            "Execution pool created"
        );

        Self {
            config,
            strategy: Arc::new(LoopStrategy::paused()),
            runner,
            polling_stats: Arc::new(PollingStats::default()),
            counters: Arc::new(PoolCounters::default()),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            abort: CancellationToken::new(),
            created_at: Instant::now(),
        }
    }

    /// Use `strategy` instead of a fresh paused one.
    pub fn with_strategy(mut self, strategy: Arc<LoopStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Token tripped by [`shutdown_now`](Self::shutdown_now).
    pub fn with_abort_token(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn strategy(&self) -> &Arc<LoopStrategy> {
        &self.strategy
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Fill every empty worker slot, resuming the loop on the first call.
    ///
    /// Later calls only replace workers that have exited, such as ones
    /// killed by a panic, and return false when every slot is still
    /// occupied. A pool that has been shut down stays down. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) -> bool {
        if self.strategy.is_interrupted() {
            tracing::warn!(pool_name = %self.config.name, "Execution pool is shut down; not starting");
            return false;
        }

        let first = !self.started.swap(true, Ordering::SeqCst);
        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        let missing = self.config.concurrency.saturating_sub(workers.len());
        if missing == 0 {
            tracing::debug!(pool_name = %self.config.name, "Execution pool already started");
            return false;
        }

        for _ in 0..missing {
            let worker_id = self.counters.workers_spawned.load(Ordering::SeqCst) as usize;
            workers.push(self.spawn_worker(worker_id));
        }
        drop(workers);

        if first {
            self.strategy.resume();
            tracing::info!(
                pool_name = %self.config.name,
                concurrency = self.config.concurrency,
                "Execution pool started"
            );
        } else {
            tracing::info!(
                pool_name = %self.config.name,
                respawned = missing,
                "Execution pool replaced exited workers"
            );
        }
        true
    }

    fn spawn_worker(&self, worker_id: usize) -> JoinHandle<()> {
        let polling = PollingLoop::new(self.strategy.clone(), self.config.interval, self.runner.clone())
            .with_stats(self.polling_stats.clone());
        let counters = self.counters.clone();
        let pool_name = self.config.name.clone();

        counters.workers_spawned.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let _active = ActiveWorker::enter(counters.clone());
            tracing::debug!(pool_name = %pool_name, worker_id, "Worker started");

            match AssertUnwindSafe(polling.start()).catch_unwind().await {
                Ok(()) => {
                    tracing::debug!(pool_name = %pool_name, worker_id, "Worker stopped");
                }
                Err(panic) => {
                    counters.worker_panics.fetch_add(1, Ordering::SeqCst);
                    JobMetrics::record_worker_panic(&pool_name);
                    tracing::error!(
                        pool_name = %pool_name,
                        worker_id,
                        panic = %panic_message(&*panic),
                        "Worker terminated by panic; call start to replace it"
                    );
                }
            }
        })
    }

    pub fn pause(&self) {
        self.strategy.pause();
        tracing::info!(pool_name = %self.config.name, "Execution pool paused");
    }

    pub fn resume(&self) {
        self.strategy.resume();
        tracing::info!(pool_name = %self.config.name, "Execution pool resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.strategy.is_paused()
    }

    /// Stop the loops and wait up to `timeout` for running jobs to finish.
    ///
    /// Returns true if every worker ended in time. Workers still running
    /// afterwards are left alone; `shutdown_now` aborts them.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.strategy.interrupt();
        let mut handles: Vec<_> = self.workers.lock().drain(..).collect();

        let finished = tokio::time::timeout(
            timeout,
            futures::future::join_all(handles.iter_mut()),
        )
        .await
        .is_ok();

        if finished {
            tracing::info!(pool_name = %self.config.name, "Execution pool shut down");
        } else {
            handles.retain(|h| !h.is_finished());
            tracing::warn!(
                pool_name = %self.config.name,
                timeout_ms = timeout.as_millis() as u64,
                still_running = handles.len(),
                "Execution pool did not shut down in time"
            );
            self.workers.lock().extend(handles);
        }
        finished
    }

    /// Stop immediately, aborting running jobs.
    pub fn shutdown_now(&self) {
        self.strategy.interrupt();
        self.abort.cancel();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }

        tracing::info!(
            pool_name = %self.config.name,
            aborted = handles.len(),
            "Execution pool aborted"
        );
    }

    pub fn stats(&self) -> ExecutionPoolStats {
        ExecutionPoolStats {
            name: self.config.name.clone(),
            concurrency: self.config.concurrency,
            active_workers: self.counters.active_workers.load(Ordering::SeqCst),
            workers_spawned: self.counters.workers_spawned.load(Ordering::SeqCst),
            worker_panics: self.counters.worker_panics.load(Ordering::SeqCst),
            processed: self.polling_stats.processed(),
            skipped: self.polling_stats.skipped(),
            paused: self.is_paused(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Statistics for the execution pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPoolStats {
    pub name: String,
    pub concurrency: usize,
    /// Worker loops currently running
    pub active_workers: usize,
    pub workers_spawned: u64,
    /// Workers that ended in a panic
    pub worker_panics: u64,
    /// Iterations that ran a job
    pub processed: u64,
    /// Iterations that found nothing to do
    pub skipped: u64,
    pub paused: bool,
    pub uptime_secs: u64,
}

impl ExecutionPoolStats {
    /// Share of iterations that found work, as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.processed + self.skipped;
        if total == 0 {
            0.0
        } else {
            (self.processed as f64 / total as f64) * 100.0
        }
    }
}
