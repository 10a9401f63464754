use async_trait::async_trait;

use super::{CommandContext, SchedulerCommand};
use crate::error::Result;
use crate::jobs::{JobFilter, JobState, Pageable};
use crate::telemetry::EngineEvent;

pub const DEFAULT_JANITOR_BATCH_SIZE: usize = 1000;

/// Reclaims jobs stuck in `Executing` past their timeout.
///
/// Rescued jobs leave the `Executing` set, so the next page starts after
/// only the jobs that were left alone.
pub struct JanitorCommand {
    ctx: CommandContext,
    batch_size: usize,
}

impl JanitorCommand {
    pub fn new(ctx: CommandContext) -> Self {
        Self {
            ctx,
            batch_size: DEFAULT_JANITOR_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl SchedulerCommand for JanitorCommand {
    fn name(&self) -> &'static str {
        "janitor"
    }

    async fn run(&self) -> Result<()> {
        let storage = &self.ctx.storage;
        let breaker = &self.ctx.breaker;
        let filter = JobFilter::new().with_state(JobState::Executing);
        let now = self.ctx.clock.now();

        let mut offset = 0;
        let mut rescued = 0usize;
        loop {
            let page = breaker
                .call(|| storage.get_jobs(&filter, Pageable::new(offset, self.batch_size)))
                .await?;
            let fetched = page.len();

            for mut job in page {
                if !job.is_stale(now) {
                    offset += 1;
                    continue;
                }
                job.rescue(now);
                breaker.call(|| storage.save_job(&job)).await?;
                rescued += 1;

                tracing::warn!(
                    job_id = %job.id,
                    handler = %job.handler,
                    retries = job.retries,
                    max_retries = job.max_retries,
                    "Rescued stuck job"
                );
                self.ctx.dispatcher.dispatch(EngineEvent::JobRescued(job));
            }

            if fetched < self.batch_size {
                break;
            }
        }

        if rescued > 0 {
            tracing::info!(count = rescued, "Janitor reclaimed stuck jobs");
        }
        Ok(())
    }
}
