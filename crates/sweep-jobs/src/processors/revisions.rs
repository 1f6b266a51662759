//! Expired document revision cleanup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use sweep_core::{JobType, Result, RevisionKey, RevisionRepository, RunUpdate};

use crate::context::{DeletedItems, RunContext};
use crate::processor::{JobProcessor, ProcessOutcome, ProgressCheckpoint, RunLedger, VacuumPlan};

const AFFECTED_TABLES: &[&str] = &["document_revision"];

/// Deletes revisions past retention, one keyset page at a time.
///
/// The latest revision of each document is never a candidate. A page whose
/// delete fails is recorded as an item error and the sweep moves past it.
pub struct RevisionCleanupProcessor {
    revisions: Arc<dyn RevisionRepository>,
    ledger: RunLedger,
    batch_size: i64,
    checkpoint_items: i64,
    vacuum: Option<VacuumPlan>,
}

impl RevisionCleanupProcessor {
    pub fn new(revisions: Arc<dyn RevisionRepository>, ledger: RunLedger, batch_size: i64) -> Self {
        Self {
            revisions,
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
        errors: &mut Vec<String>,
    ) -> Result<()> {
        let mut checkpoint = ProgressCheckpoint::new(self.checkpoint_items);
        let mut after: Option<RevisionKey> = None;

        loop {
            ctx.check()?;
            let page = ctx
                .guard(
                    self.revisions
                        .find_expired_revisions(delete_before, after, self.batch_size),
                )
                .await?;
            let Some(last) = page.last().copied() else {
                return Ok(());
            };
            after = Some(last);

            match ctx.guard(self.revisions.delete_revisions(&page)).await {
                Ok(rows) => {
                    let total = deleted.add(rows);
                    trace!(
                        subsystem = "jobs",
                        component = "processor",
                        job_type = "versions",
                        batch_rows = rows,
                        deleted_items = total,
                        "Revision page deleted"
                    );
                    if checkpoint.due(total) {
                        self.ledger.checkpoint(ctx, total).await;
                    }
                }
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "processor",
                        job_type = "versions",
                        page_len = page.len(),
                        error = %e,
                        "Revision page delete failed, continuing"
                    );
                    errors.push(format!(
                        "revisions up to document {} rev {}: {e}",
                        last.document_id, last.revision
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl JobProcessor for RevisionCleanupProcessor {
    fn job_type(&self) -> JobType {
        JobType::Versions
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
        let mut errors = Vec::new();
        let result = self.sweep(ctx, delete_before, deleted, &mut errors).await;
        ProcessOutcome::new(errors, result)
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
            Some(plan) => plan.run(ctx, AFFECTED_TABLES).await,
            None => Ok(()),
        }
    }
}
