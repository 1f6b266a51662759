//! Unreferenced blob cleanup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use sweep_core::{BlobRepository, JobType, Result, RunUpdate};

use crate::context::{DeletedItems, RunContext};
use crate::processor::{JobProcessor, ProcessOutcome, ProgressCheckpoint, RunLedger, VacuumPlan};

const AFFECTED_TABLES: &[&str] = &["blob"];

/// Deletes blobs that no revision references, one blob at a time.
///
/// Candidates are paged in hash order; cancellation is checked before every
/// item. A failed delete is collected and the sweep continues.
pub struct UnreferencedBlobProcessor {
    blobs: Arc<dyn BlobRepository>,
    ledger: RunLedger,
    batch_size: i64,
    checkpoint_items: i64,
    vacuum: Option<VacuumPlan>,
}

impl UnreferencedBlobProcessor {
    pub fn new(blobs: Arc<dyn BlobRepository>, ledger: RunLedger, batch_size: i64) -> Self {
        Self {
            blobs,
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
        created_before: DateTime<Utc>,
        deleted: &DeletedItems,
        errors: &mut Vec<String>,
    ) -> Result<()> {
        let mut checkpoint = ProgressCheckpoint::new(self.checkpoint_items);
        let mut after: Option<String> = None;

        loop {
            ctx.check()?;
            let page = ctx
                .guard(self.blobs.find_unreferenced_blobs(
                    created_before,
                    after.as_deref(),
                    self.batch_size,
                ))
                .await?;
            if page.is_empty() {
                return Ok(());
            }

            for hash in &page {
                ctx.check()?;
                match ctx.guard(self.blobs.delete_blob_if_unreferenced(hash)).await {
                    Ok(true) => {
                        let total = deleted.add(1);
                        if checkpoint.due(total) {
                            self.ledger.checkpoint(ctx, total).await;
                        }
                    }
                    Ok(false) => trace!(
                        subsystem = "jobs",
                        component = "processor",
                        job_type = "unreferenced",
                        blob_hash = %hash,
                        "Blob referenced again, kept"
                    ),
                    Err(e) if e.is_interruption() => return Err(e),
                    Err(e) => {
                        warn!(
                            subsystem = "jobs",
                            component = "processor",
                            job_type = "unreferenced",
                            blob_hash = %hash,
                            error = %e,
                            "Blob delete failed, continuing"
                        );
                        errors.push(format!("blob {hash}: {e}"));
                    }
                }
            }
            after = page.last().cloned();
        }
    }
}

#[async_trait]
impl JobProcessor for UnreferencedBlobProcessor {
    fn job_type(&self) -> JobType {
        JobType::Unreferenced
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::testing::{context, cutoff};
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use sweep_core::Error;
    use sweep_db::MemoryJobRunRepository;

    #[derive(Default)]
    struct FakeBlobs {
        hashes: Mutex<BTreeSet<String>>,
        poisoned: Mutex<BTreeSet<String>>,
        cancel_on: Option<(String, RunContext)>,
    }

    impl FakeBlobs {
        fn with_hashes(n: usize) -> Self {
            let fake = Self::default();
            fake.hashes
                .lock()
                .unwrap()
                .extend((0..n).map(|i| format!("{i:04x}")));
            fake
        }
    }

    #[async_trait]
    impl BlobRepository for FakeBlobs {
        async fn find_unreferenced_blobs(
            &self,
            _created_before: DateTime<Utc>,
            after: Option<&str>,
            limit: i64,
        ) -> Result<Vec<String>> {
            Ok(self
                .hashes
                .lock()
                .unwrap()
                .iter()
                .filter(|h| after.map_or(true, |a| h.as_str() > a))
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn delete_blob_if_unreferenced(&self, hash: &str) -> Result<bool> {
            if self.poisoned.lock().unwrap().contains(hash) {
                return Err(Error::Job("storage backend unavailable".into()));
            }
            let removed = self.hashes.lock().unwrap().remove(hash);
            if let Some((target, ctx)) = &self.cancel_on {
                if target == hash {
                    ctx.cancel("lock lost");
                }
            }
            Ok(removed)
        }
    }

    fn processor(fake: Arc<FakeBlobs>) -> UnreferencedBlobProcessor {
        let runs = MemoryJobRunRepository::new();
        UnreferencedBlobProcessor::new(fake, RunLedger::new(Arc::new(runs)), 4)
    }

    #[tokio::test]
    async fn test_deletes_every_unreferenced_blob() {
        let fake = Arc::new(FakeBlobs::with_hashes(10));
        let deleted = DeletedItems::new();

        let outcome = processor(fake.clone())
            .process(&context(JobType::Unreferenced), cutoff(), &deleted)
            .await;

        assert!(outcome.result.is_ok());
        assert_eq!(deleted.get(), 10);
        assert!(fake.hashes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_item_error_is_collected_and_sweep_continues() {
        let fake = Arc::new(FakeBlobs::with_hashes(10));
        fake.poisoned.lock().unwrap().insert("0005".to_string());
        let deleted = DeletedItems::new();

        let outcome = processor(fake.clone())
            .process(&context(JobType::Unreferenced), cutoff(), &deleted)
            .await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.item_errors.len(), 1);
        assert!(outcome.item_errors[0].contains("0005"));
        assert_eq!(deleted.get(), 9);
        assert_eq!(fake.hashes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_checked_before_each_item() {
        let ctx = context(JobType::Unreferenced);
        let mut fake = FakeBlobs::with_hashes(10);
        fake.cancel_on = Some(("0002".to_string(), ctx.clone()));
        let fake = Arc::new(fake);
        let deleted = DeletedItems::new();

        let outcome = processor(fake.clone()).process(&ctx, cutoff(), &deleted).await;

        assert!(matches!(outcome.result, Err(Error::Cancelled(_))));
        // 0000, 0001, 0002 completed; the next item saw the cancellation.
        assert_eq!(deleted.get(), 3);
        assert_eq!(fake.hashes.lock().unwrap().len(), 7);
    }
}
