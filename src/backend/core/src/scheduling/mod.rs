//! Background maintenance: promoting due jobs, firing cron definitions,
//! rescuing stuck executions and pruning old jobs.
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!   every tick ──▶│ SchedulingManager                        │
//!                 │   enqueue → cron → janitor → delete      │
//!                 └───────────────┬──────────────────────────┘
//!                                 │ CircuitBreaker
//!                                 ▼
//!                            JobStorage
//! ```

pub mod commands;
pub mod cron;
pub mod manager;
pub mod retention;

pub use commands::{
    CommandContext, CronJobCommand, JanitorCommand, JobDeleteCommand, JobEnqueueCommand,
    SchedulerCommand, SharedCommand, DEFAULT_JANITOR_BATCH_SIZE,
};
pub use self::cron::{next_fire_after, upcoming};
pub use manager::{SchedulingManager, SchedulingStats};
pub use retention::{parse_retention, MINIMUM_RETENTION};

use std::sync::Arc;
use std::time::Duration;

/// The standard command list in tick order.
pub fn standard_commands(
    ctx: CommandContext,
    janitor_batch_size: usize,
    retention: Option<Duration>,
) -> Vec<SharedCommand> {
    vec![
        Arc::new(JobEnqueueCommand::new(ctx.clone())),
        Arc::new(CronJobCommand::new(ctx.clone())),
        Arc::new(JanitorCommand::new(ctx.clone()).with_batch_size(janitor_batch_size)),
        Arc::new(JobDeleteCommand::new(ctx, retention)),
    ]
}
