use async_trait::async_trait;
use std::time::Duration;

use super::{CommandContext, SchedulerCommand};
use crate::clock::sub_duration;
use crate::error::Result;
use crate::telemetry::EngineEvent;

/// Removes finished jobs older than the retention period.
pub struct JobDeleteCommand {
    ctx: CommandContext,
    retention: Option<Duration>,
}

impl JobDeleteCommand {
    /// `None` disables deletion.
    pub fn new(ctx: CommandContext, retention: Option<Duration>) -> Self {
        Self { ctx, retention }
    }
}

#[async_trait]
impl SchedulerCommand for JobDeleteCommand {
    fn name(&self) -> &'static str {
        "delete"
    }

    async fn run(&self) -> Result<()> {
        let Some(retention) = self.retention else {
            return Ok(());
        };
        let storage = &self.ctx.storage;
        let older_than = sub_duration(self.ctx.clock.now(), retention);

        let count = self
            .ctx
            .breaker
            .call(|| storage.delete_all_jobs(older_than))
            .await?;

        if count > 0 {
            tracing::info!(count, older_than = %older_than, "Deleted expired jobs");
            self.ctx
                .dispatcher
                .dispatch(EngineEvent::JobsDeleted { count, older_than });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, Queue};
    use crate::scheduling::commands::testing::Harness;

    fn finished(h: &Harness, days_ago: i64) -> Job {
        let mut job = Job::new("cleanup", Queue::new("default"), h.now());
        job.mark_completed(h.now() - chrono::Duration::days(days_ago));
        job
    }

    #[tokio::test]
    async fn test_deletes_jobs_past_retention() {
        let h = Harness::new();
        let old = h.storage.insert_job(finished(&h, 40));
        let recent = h.storage.insert_job(finished(&h, 2));
        let pending = h.storage.insert_job(
            Job::new("cleanup", Queue::new("default"), h.now()).created_at(h.now() - chrono::Duration::days(90)),
        );

        JobDeleteCommand::new(h.context(), Some(Duration::from_secs(30 * 86_400)))
            .run()
            .await
            .unwrap();

        assert!(h.storage.job(old).is_none());
        assert!(h.storage.job(recent).is_some());
        assert!(h.storage.job(pending).is_some());
        assert_eq!(h.dispatcher.names(), vec!["jobs.deleted"]);
    }

    #[tokio::test]
    async fn test_disabled_retention_never_touches_storage() {
        let h = Harness::new();
        h.storage.insert_job(finished(&h, 400));

        JobDeleteCommand::new(h.context(), None).run().await.unwrap();

        assert_eq!(h.storage.call_count(), 0);
        assert_eq!(h.storage.jobs().len(), 1);
    }
}
