//! Job processor contract and shared run bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use sweep_core::{
    JobRun, JobRunRepository, JobRunStatus, JobType, Result, RunUpdate, VacuumRepository,
};

use crate::context::{DeletedItems, RunContext};

/// What a processing pass produced.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// Non-fatal per-item or per-batch errors. The sweep continued past them.
    pub item_errors: Vec<String>,
    /// Error that ended the batch loop, if any.
    pub result: Result<()>,
}

impl ProcessOutcome {
    pub fn new(item_errors: Vec<String>, result: Result<()>) -> Self {
        Self {
            item_errors,
            result,
        }
    }
}

/// Batched, resumable cleanup work for one job type.
///
/// `process` iterates fixed-size batches, calls [`RunContext::check`] before
/// each batch (and before each item for fine-grained jobs), and never holds a
/// transaction across batches. A batch that affects zero rows ends the loop.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The job type this processor cleans.
    fn job_type(&self) -> JobType;

    /// Persist a `running` run row before any destructive work.
    async fn initialize(&self, ctx: &RunContext, delete_before: DateTime<Utc>) -> Result<()>;

    /// Delete candidates older than `delete_before`, adding to `deleted` as batches commit.
    async fn process(
        &self,
        ctx: &RunContext,
        delete_before: DateTime<Utc>,
        deleted: &DeletedItems,
    ) -> ProcessOutcome;

    /// Write status, details, and counts to the run row.
    async fn update_progress(&self, update: &RunUpdate) -> Result<()>;

    /// Vacuum budget. Zero skips the vacuum phase.
    fn vacuum_timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// Reclaim storage freed by this run.
    async fn perform_vacuum(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
}

/// Run-row persistence shared by every processor.
#[derive(Clone)]
pub struct RunLedger {
    runs: Arc<dyn JobRunRepository>,
}

impl RunLedger {
    pub fn new(runs: Arc<dyn JobRunRepository>) -> Self {
        Self { runs }
    }

    pub async fn initialize(&self, ctx: &RunContext, delete_before: DateTime<Utc>) -> Result<()> {
        let run = JobRun::started(
            ctx.job_id(),
            ctx.job_type(),
            ctx.instance_id(),
            delete_before,
        );
        ctx.guard(self.runs.store_run(&run)).await?;
        debug!(
            subsystem = "jobs",
            component = "ledger",
            job_id = %run.id,
            job_type = %run.job_type,
            delete_before = %delete_before,
            "Run initialized"
        );
        Ok(())
    }

    pub async fn update(&self, update: &RunUpdate) -> Result<()> {
        self.runs.update_run(update).await
    }

    /// Partial progress write. Failure is logged and does not end the sweep.
    pub async fn checkpoint(&self, ctx: &RunContext, deleted_items: i64) {
        let update = RunUpdate {
            id: ctx.job_id(),
            status: JobRunStatus::Running,
            details: None,
            deleted_items,
            finished_at: None,
        };
        match ctx.guard(self.runs.update_run(&update)).await {
            Ok(()) => debug!(
                subsystem = "jobs",
                component = "ledger",
                job_id = %ctx.job_id(),
                deleted_items,
                "Progress checkpoint written"
            ),
            Err(e) => warn!(
                subsystem = "jobs",
                component = "ledger",
                job_id = %ctx.job_id(),
                error = %e,
                "Progress checkpoint failed"
            ),
        }
    }

    /// Most recent runs of `job_type`, newest first.
    pub async fn history(&self, job_type: JobType, limit: i64) -> Result<Vec<JobRun>> {
        self.runs.list_runs(job_type, limit).await
    }
}

/// Item-count trigger for partial progress writes.
#[derive(Debug, Clone)]
pub struct ProgressCheckpoint {
    every: i64,
    next: i64,
}

impl ProgressCheckpoint {
    /// Fire each time the running total crosses a multiple of `every`.
    /// Zero or negative disables checkpoints.
    pub fn new(every: i64) -> Self {
        Self { every, next: every }
    }

    pub fn due(&mut self, total: i64) -> bool {
        if self.every <= 0 || total < self.next {
            return false;
        }
        self.next = (total / self.every + 1) * self.every;
        true
    }
}

/// Vacuum repository plus the budget it runs under.
#[derive(Clone)]
pub struct VacuumPlan {
    repo: Arc<dyn VacuumRepository>,
    timeout: Duration,
}

impl VacuumPlan {
    pub fn new(repo: Arc<dyn VacuumRepository>, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, ctx: &RunContext, tables: &[&str]) -> Result<()> {
        if self.timeout.is_zero() || tables.is_empty() {
            return Ok(());
        }
        ctx.guard(self.repo.vacuum_tables(tables)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweep_db::MemoryJobRunRepository;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[test]
    fn test_checkpoint_fires_once_per_threshold() {
        let mut cp = ProgressCheckpoint::new(100);
        assert!(!cp.due(50));
        assert!(cp.due(100));
        assert!(!cp.due(150));
        assert!(cp.due(260));
        assert!(!cp.due(299));
        assert!(cp.due(300));
    }

    #[test]
    fn test_checkpoint_disabled() {
        let mut cp = ProgressCheckpoint::new(0);
        assert!(!cp.due(1_000_000));
    }

    #[tokio::test]
    async fn test_ledger_initialize_and_checkpoint() {
        let repo = MemoryJobRunRepository::new();
        let ledger = RunLedger::new(Arc::new(repo.clone()));
        let ctx = RunContext::new(
            Uuid::now_v7(),
            JobType::Comparisons,
            "i-1",
            CancellationToken::new(),
        );
        let cutoff = Utc::now();

        ledger.initialize(&ctx, cutoff).await.unwrap();
        ledger.checkpoint(&ctx, 42).await;

        let runs = ledger.history(JobType::Comparisons, 5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, ctx.job_id());
        assert_eq!(runs[0].status, JobRunStatus::Running);
        assert_eq!(runs[0].deleted_items, 42);
        assert_eq!(runs[0].delete_before, cutoff);
        assert_eq!(runs[0].instance_id, "i-1");
    }

    #[tokio::test]
    async fn test_ledger_initialize_respects_cancellation() {
        let repo = MemoryJobRunRepository::new();
        let ledger = RunLedger::new(Arc::new(repo.clone()));
        let ctx = RunContext::new(
            Uuid::now_v7(),
            JobType::Versions,
            "i-1",
            CancellationToken::new(),
        );
        ctx.cancel("shutdown");

        assert!(ledger.initialize(&ctx, Utc::now()).await.is_err());
        assert!(repo.runs().is_empty());
    }
}
