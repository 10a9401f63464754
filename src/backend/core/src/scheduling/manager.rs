//! Fixed-rate runner for the maintenance commands.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::commands::SharedCommand;
use crate::engine::pool::panic_message;
use crate::telemetry::{OperationTimer, SchedulerMetrics};

/// Timer that runs its commands one after another on every tick.
///
/// Commands never run concurrently, so a command sees everything the
/// commands before it wrote in the same tick. A failing or panicking
/// command is logged and the tick carries on with the next one.
pub struct SchedulingManager {
    commands: Arc<Vec<SharedCommand>>,
    initial_delay: Duration,
    interval: Duration,
    timer: Mutex<Option<Timer>>,
    ticks: Arc<AtomicU64>,
}

struct Timer {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SchedulingManager {
    pub fn new(commands: Vec<SharedCommand>, initial_delay: Duration, interval: Duration) -> Self {
        Self {
            commands: Arc::new(commands),
            initial_delay,
            // tokio intervals reject a zero period
            interval: interval.max(Duration::from_millis(1)),
            timer: Mutex::new(None),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Command names in execution order.
    pub fn command_names(&self) -> Vec<&'static str> {
        self.commands.iter().map(|c| c.name()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map_or(false, |t| !t.cancel.is_cancelled() && !t.handle.is_finished())
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Start the timer. Returns false if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut slot = self.timer.lock();
        if let Some(timer) = slot.as_ref() {
            if !timer.cancel.is_cancelled() && !timer.handle.is_finished() {
                tracing::debug!("Scheduling manager already running");
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let commands = self.commands.clone();
        let ticks = self.ticks.clone();
        let token = cancel.clone();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.initial_delay, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                run_commands(&commands).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
            tracing::debug!("Scheduling timer stopped");
        });

        *slot = Some(Timer { handle, cancel });
        tracing::info!(
            initial_delay_ms = self.initial_delay.as_millis() as u64,
            interval_ms = self.interval.as_millis() as u64,
            commands = ?self.command_names(),
            "Scheduling manager started"
        );
        true
    }

    /// Cancel the timer. A tick in progress runs to completion.
    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().as_ref() {
            if !timer.cancel.is_cancelled() {
                timer.cancel.cancel();
                tracing::info!("Scheduling manager stopped");
            }
        }
    }

    /// Wait for the timer task to end.
    pub async fn join(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            if let Err(err) = timer.handle.await {
                tracing::error!(error = %err, "Scheduling timer ended abnormally");
            }
        }
    }

    /// Run every command once, outside the timer.
    pub async fn run_once(&self) {
        run_commands(&self.commands).await;
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SchedulingStats {
        SchedulingStats {
            running: self.is_running(),
            ticks: self.ticks(),
            commands: self.command_names().into_iter().map(String::from).collect(),
            interval_ms: self.interval.as_millis() as u64,
        }
    }
}

impl Drop for SchedulingManager {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.cancel.cancel();
        }
    }
}

async fn run_commands(commands: &[SharedCommand]) {
    let timer = OperationTimer::start();

    for command in commands {
        let name = command.name();
        match AssertUnwindSafe(command.run()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                SchedulerMetrics::record_command_error(name);
                tracing::warn_span!("scheduler_command", command = name).in_scope(|| err.log());
            }
            Err(panic) => {
                SchedulerMetrics::record_command_error(name);
                tracing::error!(command = name, panic = %panic_message(&*panic), "Scheduler command panicked");
            }
        }
    }

    let elapsed = timer.elapsed();
    SchedulerMetrics::record_tick(elapsed);
    tracing::trace!(elapsed_ms = elapsed.as_millis() as u64, "Scheduling tick finished");
}

/// Snapshot of the scheduling manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingStats {
    pub running: bool,
    pub ticks: u64,
    pub commands: Vec<String>,
    pub interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::scheduling::commands::SchedulerCommand;
    use async_trait::async_trait;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        log: Log,
        work: Duration,
        fail: bool,
    }

    impl Recording {
        fn shared(name: &'static str, log: &Log) -> SharedCommand {
            Arc::new(Self {
                name,
                log: log.clone(),
                work: Duration::from_millis(50),
                fail: false,
            })
        }

        fn failing(name: &'static str, log: &Log) -> SharedCommand {
            Arc::new(Self {
                name,
                log: log.clone(),
                work: Duration::ZERO,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl SchedulerCommand for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self) -> Result<()> {
            self.log.lock().push(format!("{}:start", self.name));
            tokio::time::sleep(self.work).await;
            self.log.lock().push(format!("{}:end", self.name));
            if self.fail {
                return Err(EngineError::storage("boom"));
            }
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl SchedulerCommand for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn run(&self) -> Result<()> {
            panic!("command bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_run_sequentially_in_order() {
        let log: Log = Arc::default();
        let manager = SchedulingManager::new(
            vec![
                Recording::shared("enqueue", &log),
                Recording::shared("cron", &log),
                Recording::shared("janitor", &log),
                Recording::shared("delete", &log),
            ],
            Duration::ZERO,
            Duration::from_secs(5),
        );

        manager.run_once().await;

        assert_eq!(
            *log.lock(),
            vec![
                "enqueue:start", "enqueue:end", "cron:start", "cron:end",
                "janitor:start", "janitor:end", "delete:start", "delete:end",
            ]
        );
        assert_eq!(manager.command_names(), vec!["enqueue", "cron", "janitor", "delete"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_abort_the_tick() {
        let log: Log = Arc::default();
        let manager = SchedulingManager::new(
            vec![
                Recording::failing("enqueue", &log),
                Arc::new(Panicking),
                Recording::shared("delete", &log),
            ],
            Duration::ZERO,
            Duration::from_secs(5),
        );

        manager.run_once().await;

        assert_eq!(log.lock().last().map(String::as_str), Some("delete:end"));
        assert_eq!(manager.ticks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let log: Log = Arc::default();
        let manager = SchedulingManager::new(
            vec![Recording::failing("count", &log)],
            Duration::from_secs(1),
            Duration::from_secs(5),
        );

        assert!(manager.start());
        assert!(!manager.start());
        assert!(manager.is_running());

        // ticks at 1s, 6s and 11s
        tokio::time::sleep(Duration::from_millis(11_500)).await;
        assert_eq!(manager.ticks(), 3);
        assert_eq!(log.lock().iter().filter(|e| e.ends_with(":start")).count(), 3);

        manager.stop();
        manager.join().await;
        assert!(!manager.is_running());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(manager.ticks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_restart_after_stop() {
        let log: Log = Arc::default();
        let manager = SchedulingManager::new(
            vec![Recording::failing("count", &log)],
            Duration::ZERO,
            Duration::from_secs(5),
        );

        assert!(manager.start());
        manager.stop();
        manager.join().await;
        assert!(manager.start());
        assert!(manager.is_running());
        manager.stop();
        manager.join().await;
    }
}
