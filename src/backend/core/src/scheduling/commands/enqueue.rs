use async_trait::async_trait;

use super::{CommandContext, SchedulerCommand};
use crate::error::Result;
use crate::telemetry::EngineEvent;

/// Promotes due scheduled and retryable jobs so workers can pick them.
pub struct JobEnqueueCommand {
    ctx: CommandContext,
}

impl JobEnqueueCommand {
    pub fn new(ctx: CommandContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SchedulerCommand for JobEnqueueCommand {
    fn name(&self) -> &'static str {
        "enqueue"
    }

    async fn run(&self) -> Result<()> {
        let storage = &self.ctx.storage;
        let jobs = self.ctx.breaker.call(|| storage.enqueue_jobs()).await?;

        if !jobs.is_empty() {
            tracing::debug!(count = jobs.len(), "Enqueued due jobs");
        }
        for job in jobs {
            self.ctx.dispatcher.dispatch(EngineEvent::JobEnqueued(job));
        }
        Ok(())
    }
}
