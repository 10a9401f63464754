//! Pause/resume and interruptible waiting shared by worker loops.
//!
//! One [`LoopStrategy`] is shared by every worker of a pool, so pausing it
//! pauses them all. Pausing never interrupts a running iteration: workers
//! finish their current job and block at the next wait point.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared loop control.
#[derive(Debug)]
pub struct LoopStrategy {
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    iteration_limit: Option<u64>,
    iterations: AtomicU64,
    waits: AtomicU64,
}

impl Default for LoopStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopStrategy {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            cancel: CancellationToken::new(),
            iteration_limit: None,
            iterations: AtomicU64::new(0),
            waits: AtomicU64::new(0),
        }
    }

    /// A strategy that starts paused.
    pub fn paused() -> Self {
        let strategy = Self::new();
        strategy.pause();
        strategy
    }

    /// Stop after `limit` iterations in total across all loops.
    pub fn with_iteration_limit(mut self, limit: u64) -> Self {
        self.iteration_limit = Some(limit);
        self
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Clear the pause flag and wake every waiting loop.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Ask every loop to stop at its next check.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Iterations started so far.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Calls to [`wait`](Self::wait) so far.
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::SeqCst)
    }

    /// Run `body` until interrupted or the iteration limit is reached,
    /// blocking between iterations while paused.
    pub async fn run<F, Fut>(&self, mut body: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if !self.wait_while_paused().await {
                break;
            }
            if !self.claim_iteration() {
                break;
            }
            body().await;
        }
    }

    /// Wait for `interval`, returning early on resume or interrupt.
    ///
    /// Wake-ups that are not a resume (the flag being set to paused again)
    /// keep waiting toward the original deadline.
    pub async fn wait(&self, interval: Duration) {
        self.waits.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + interval;
        let mut rx = self.paused.subscribe();
        rx.borrow_and_update();

        loop {
            if Instant::now() >= deadline {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => return,
                changed = rx.changed() => {
                    if changed.is_err() || !*rx.borrow_and_update() {
                        return;
                    }
                }
            }
        }
    }

    /// Block while paused. Returns false if interrupted.
    async fn wait_while_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn claim_iteration(&self) -> bool {
        let started = self.iterations.fetch_add(1, Ordering::SeqCst);
        match self.iteration_limit {
            Some(limit) if started >= limit => {
                self.iterations.fetch_sub(1, Ordering::SeqCst);
                false
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_run_respects_iteration_limit() {
        let strategy = LoopStrategy::new().with_iteration_limit(5);
        let mut count = 0;

        strategy
            .run(|| {
                count += 1;
                async {}
            })
            .await;

        assert_eq!(count, 5);
        assert_eq!(strategy.iterations(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_runs_to_deadline() {
        let strategy = LoopStrategy::new();
        let started = Instant::now();

        strategy.wait(Duration::from_secs(2)).await;

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(strategy.waits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_wakes_waiter_early() {
        let strategy = Arc::new(LoopStrategy::new());
        let started = Instant::now();

        let waiter = {
            let strategy = strategy.clone();
            tokio::spawn(async move { strategy.wait(Duration::from_secs(60)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        strategy.pause();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        strategy.resume();
        waiter.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_loop_blocks_until_resumed() {
        let strategy = Arc::new(LoopStrategy::paused().with_iteration_limit(3));
        let counter = Arc::new(AtomicU64::new(0));

        let handle = {
            let strategy = strategy.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                strategy
                    .run(|| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async {}
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        strategy.resume();
        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_stops_paused_loop() {
        let strategy = Arc::new(LoopStrategy::paused());

        let handle = {
            let strategy = strategy.clone();
            tokio::spawn(async move { strategy.run(|| async {}).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        strategy.interrupt();
        handle.await.unwrap();
        assert!(strategy.is_interrupted());
        assert_eq!(strategy.iterations(), 0);
    }
}
