//! Maintenance commands run by the scheduling manager on every tick.
//!
//! Commands hold no per-tick state, so the same instance runs again on
//! the next tick. Every storage call goes through the shared circuit
//! breaker.

mod cron_job;
mod delete;
mod enqueue;
mod janitor;

pub use cron_job::CronJobCommand;
pub use delete::JobDeleteCommand;
pub use enqueue::JobEnqueueCommand;
pub use janitor::{JanitorCommand, DEFAULT_JANITOR_BATCH_SIZE};

use async_trait::async_trait;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::engine::SharedBreaker;
use crate::error::Result;
use crate::jobs::SharedStorage;
use crate::telemetry::SharedDispatcher;

/// One step of a scheduling tick.
#[async_trait]
pub trait SchedulerCommand: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<()>;
}

pub type SharedCommand = Arc<dyn SchedulerCommand>;

/// Collaborators every command needs.
#[derive(Clone)]
pub struct CommandContext {
    pub storage: SharedStorage,
    pub breaker: SharedBreaker,
    pub clock: SharedClock,
    pub dispatcher: SharedDispatcher,
}

impl CommandContext {
    pub fn new(
        storage: SharedStorage,
        breaker: SharedBreaker,
        clock: SharedClock,
        dispatcher: SharedDispatcher,
    ) -> Self {
        Self {
            storage,
            breaker,
            clock,
            dispatcher,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::engine::{BreakerSettings, CircuitBreaker};
    use crate::jobs::InMemoryStorage;
    use crate::telemetry::CollectingDispatcher;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    pub struct Harness {
        pub clock: Arc<ManualClock>,
        pub storage: Arc<InMemoryStorage>,
        pub breaker: SharedBreaker,
        pub dispatcher: Arc<CollectingDispatcher>,
    }

    impl Harness {
        pub fn new() -> Self {
            let clock = Arc::new(ManualClock::new(start()));
            let storage = Arc::new(InMemoryStorage::new(clock.clone()));
            let settings = BreakerSettings::new(1, 2, Duration::from_secs(30)).unwrap();
            let breaker = Arc::new(CircuitBreaker::new("storage", settings, clock.clone()));
            Self {
                clock,
                storage,
                breaker,
                dispatcher: Arc::new(CollectingDispatcher::new()),
            }
        }

        pub fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }

        pub fn context(&self) -> CommandContext {
            CommandContext::new(
                self.storage.clone(),
                self.breaker.clone(),
                self.clock.clone(),
                self.dispatcher.clone(),
            )
        }
    }

    pub fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 9, 58, 30).unwrap()
    }
}
