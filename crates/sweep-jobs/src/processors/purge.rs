//! Bounded `DELETE … LIMIT` purges.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::trace;

use sweep_core::{JobType, PurgeRepository, Result, RunUpdate};

use crate::context::{DeletedItems, RunContext};
use crate::processor::{JobProcessor, ProcessOutcome, ProgressCheckpoint, RunLedger, VacuumPlan};

/// Delete-with-limit loop over a [`PurgeRepository`].
///
/// Used for soft-deleted documents and stale comparisons. Each batch is one
/// statement; the loop ends on the first batch that deletes nothing.
pub struct PurgeProcessor {
    job_type: JobType,
    repo: Arc<dyn PurgeRepository>,
    ledger: RunLedger,
    batch_size: i64,
    checkpoint_items: i64,
    vacuum: Option<VacuumPlan>,
}

impl PurgeProcessor {
    pub fn new(
        job_type: JobType,
        repo: Arc<dyn PurgeRepository>,
        ledger: RunLedger,
        batch_size: i64,
    ) -> Self {
        Self {
            job_type,
            repo,
            ledger,
            batch_size: batch_size.max(1),
            checkpoint_items: sweep_core::defaults::PROGRESS_CHECKPOINT_ITEMS,
            vacuum: None,
        }
    }

    pub fn with_checkpoint_items(mut self, items: i64) -> Self {
        self.checkpoint_items = items;
        self
    }

    pub fn with_vacuum(mut self, plan: VacuumPlan) -> Self {
        self.vacuum = Some(plan);
        self
    }

    async fn sweep(
        &self,
        ctx: &RunContext,
        delete_before: DateTime<Utc>,
        deleted: &DeletedItems,
    ) -> Result<()> {
        let mut checkpoint = ProgressCheckpoint::new(self.checkpoint_items);
        loop {
            ctx.check()?;
            let rows = ctx
                .guard(self.repo.purge_batch(delete_before, self.batch_size))
                .await?;
            if rows == 0 {
                return Ok(());
            }

            let total = deleted.add(rows);
            trace!(
                subsystem = "jobs",
                component = "processor",
                job_type = %self.job_type,
                batch_rows = rows,
                deleted_items = total,
                "Purge batch committed"
            );
            if checkpoint.due(total) {
                self.ledger.checkpoint(ctx, total).await;
            }
        }
    }
}

#[async_trait]
impl JobProcessor for PurgeProcessor {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn initialize(&self, ctx: &RunContext, delete_before: DateTime<Utc>) -> Result<()> {
        self.ledger.initialize(ctx, delete_before).await
    }

    async fn process(
        &self,
        ctx: &RunContext,
        delete_before: DateTime<Utc>,
        deleted: &DeletedItems,
    ) -> ProcessOutcome {
        ProcessOutcome::new(Vec::new(), self.sweep(ctx, delete_before, deleted).await)
    }

    async fn update_progress(&self, update: &RunUpdate) -> Result<()> {
        self.ledger.update(update).await
    }

    fn vacuum_timeout(&self) -> Duration {
        self.vacuum
            .as_ref()
            .map(VacuumPlan::timeout)
            .unwrap_or(Duration::ZERO)
    }

    async fn perform_vacuum(&self, ctx: &RunContext) -> Result<()> {
        match &self.vacuum {
            Some(plan) => plan.run(ctx, self.repo.affected_tables()).await,
            None => Ok(()),
        }
    }
}
