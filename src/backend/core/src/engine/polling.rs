//! The per-worker poll cycle: run one iteration, then wait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::loop_strategy::LoopStrategy;

/// Outcome of one poll iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// Nothing was available, or storage could not be reached
    Skipped,
    /// A job ran to completion, successfully or not
    Processed,
}

/// One unit of loop work.
#[async_trait]
pub trait LoopRunner: Send + Sync {
    async fn execute(&self) -> IterationStatus;
}

/// Counters shared by all loops of a pool.
#[derive(Debug, Default)]
pub struct PollingStats {
    processed: AtomicU64,
    skipped: AtomicU64,
}

impl PollingStats {
    pub fn record(&self, status: IterationStatus) {
        match status {
            IterationStatus::Processed => self.processed.fetch_add(1, Ordering::Relaxed),
            IterationStatus::Skipped => self.skipped.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Drives a [`LoopRunner`] under a shared [`LoopStrategy`].
///
/// Every iteration is followed by a wait of `interval`, whether or not it
/// found work, which bounds how often storage is polled.
pub struct PollingLoop {
    strategy: Arc<LoopStrategy>,
    interval: Duration,
    runner: Arc<dyn LoopRunner>,
    stats: Arc<PollingStats>,
}

impl PollingLoop {
    pub fn new(strategy: Arc<LoopStrategy>, interval: Duration, runner: Arc<dyn LoopRunner>) -> Self {
        Self {
            strategy,
            interval,
            runner,
            stats: Arc::new(PollingStats::default()),
        }
    }

    /// Share counters with other loops.
    pub fn with_stats(mut self, stats: Arc<PollingStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<PollingStats> {
        &self.stats
    }

    /// Run until the strategy is interrupted or exhausts its iterations.
    pub async fn start(&self) {
        let this = self;
        self.strategy
            .run(move || async move {
                let status = this.runner.execute().await;
                this.stats.record(status);
                tracing::trace!(status = ?status, "Poll iteration finished");
                this.strategy.wait(this.interval).await;
            })
            .await;
    }
}
