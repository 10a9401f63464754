use async_trait::async_trait;

use super::{CommandContext, SchedulerCommand};
use crate::error::Result;
use crate::scheduling::cron::next_fire_after;
use crate::telemetry::EngineEvent;

/// Materializes due cron definitions into concrete jobs.
///
/// A definition whose expression cannot be evaluated is logged and
/// skipped so one bad entry does not hold back the rest.
pub struct CronJobCommand {
    ctx: CommandContext,
}

impl CronJobCommand {
    pub fn new(ctx: CommandContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SchedulerCommand for CronJobCommand {
    fn name(&self) -> &'static str {
        "cron"
    }

    async fn run(&self) -> Result<()> {
        let storage = &self.ctx.storage;
        let breaker = &self.ctx.breaker;
        let now = self.ctx.clock.now();

        let due: Vec<_> = breaker
            .call(|| storage.get_all_cron_jobs())
            .await?
            .into_iter()
            .filter(|cron| cron.is_due(now))
            .collect();

        for mut cron in due {
            let next = match next_fire_after(&cron.expression, now) {
                Ok(next) => next,
                Err(err) => {
                    tracing::warn!(cron = %cron.name, expression = %cron.expression, error = %err, "Skipping cron job");
                    continue;
                }
            };
            cron.next_run_at = Some(next);
            breaker.call(|| storage.save_cron_job(&cron)).await?;

            let job = cron.to_job(now);
            breaker.call(|| storage.save_job(&job)).await?;

            tracing::info!(cron = %cron.name, job_id = %job.id, next_run_at = %next, "Cron job fired");
            self.ctx
                .dispatcher
                .dispatch(EngineEvent::CronScheduled { cron, job });
        }
        Ok(())
    }
}
