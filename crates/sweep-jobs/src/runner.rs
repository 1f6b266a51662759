//! Job runner: the per-run state machine.
//!
//! `MigrationCheck → LockAcquire → Initialize → Processing → Vacuum →
//! Finalize → LockRelease`, with an early exit at each guard. Once a run row
//! exists, every path ends with a terminal status write, a panic included.
//! The lock is released before a panic outcome is recorded.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use sweep_core::defaults::{LOCK_NAME, MAX_DETAILS_LEN, RELEASE_TIMEOUT_SECS};
use sweep_core::{
    truncate_details, JobConfig, JobRunStatus, JobType, MigrationStatusSource, Result, RunUpdate,
};

use crate::context::{DeletedItems, RunContext};
use crate::lock::{Lease, LockOptions, LockService};
use crate::processor::JobProcessor;

/// Lock and release settings shared by every runner in a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    /// The single lock serializing all cleanup job types.
    pub lock_name: String,
    pub lock: LockOptions,
    /// Detached budget for lock release and terminal status writes.
    pub release_timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            lock_name: LOCK_NAME.to_string(),
            lock: LockOptions::default(),
            release_timeout: Duration::from_secs(RELEASE_TIMEOUT_SECS),
        }
    }
}

/// Why a run did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Data migrations were running; their names.
    MigrationRunning(Vec<String>),
    /// Another instance or job type holds the cleanup lock.
    LockHeld,
}

/// Terminal state of a run that reached processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub job_id: Uuid,
    pub status: JobRunStatus,
    pub deleted_items: i64,
    pub details: Option<String>,
}

/// Result of one runner invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Skipped(SkipReason),
    /// The lock was taken but no run row could be created.
    Aborted(String),
    Finished(RunSummary),
}

/// Orchestrates runs of one [`JobProcessor`].
pub struct JobRunner {
    processor: Arc<dyn JobProcessor>,
    locks: LockService,
    migrations: Arc<dyn MigrationStatusSource>,
    config: JobConfig,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        processor: Arc<dyn JobProcessor>,
        locks: LockService,
        migrations: Arc<dyn MigrationStatusSource>,
        config: JobConfig,
    ) -> Self {
        Self {
            processor,
            locks,
            migrations,
            config,
            settings: RunnerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn job_type(&self) -> JobType {
        self.config.job_type
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// One run with the configured timeout and no external shutdown.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.run_with(&CancellationToken::new()).await
    }

    /// One run with the configured timeout, cancelled when `shutdown` fires.
    pub async fn run_with(&self, shutdown: &CancellationToken) -> Result<RunOutcome> {
        self.run_scheduled(shutdown, self.config.timeout).await
    }

    /// One run with an explicit processing budget.
    ///
    /// Returns `Err` only for failures before a run row could exist
    /// (an out-of-range retention cutoff, migration status or lock store
    /// unavailable).
    #[instrument(
        skip_all,
        fields(job_type = %self.config.job_type, instance_id = %self.config.instance_id)
    )]
    pub async fn run_scheduled(
        &self,
        shutdown: &CancellationToken,
        timeout: Duration,
    ) -> Result<RunOutcome> {
        let delete_before = self.config.delete_before(Utc::now())?;
        let running = self.migrations.running_migrations().await?;
        if !running.is_empty() {
            let names: Vec<String> = running.into_iter().map(|m| m.name).collect();
            info!(
                subsystem = "jobs",
                component = "runner",
                migrations = ?names,
                "Data migration running, skipping cleanup"
            );
            return Ok(RunOutcome::Skipped(SkipReason::MigrationRunning(names)));
        }

        let acquired = self
            .locks
            .acquire_lock(
                &self.settings.lock_name,
                &self.config.instance_id,
                self.settings.lock,
            )
            .await;
        let mut lease = match acquired {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(
                    subsystem = "jobs",
                    component = "runner",
                    lock_name = %self.settings.lock_name,
                    "Cleanup lock held elsewhere, skipping"
                );
                return Ok(RunOutcome::Skipped(SkipReason::LockHeld));
            }
            Err(e) if e.is_contention() => return Ok(RunOutcome::Skipped(SkipReason::LockHeld)),
            Err(e) => return Err(e),
        };

        let root = RunContext::new(
            Uuid::now_v7(),
            self.config.job_type,
            self.config.instance_id.as_str(),
            shutdown.child_token(),
        );
        let watcher = lease.take_loss_signal().map(|loss| {
            let ctx = root.clone();
            tokio::spawn(async move {
                if let Ok(loss) = loss.await {
                    warn!(
                        subsystem = "jobs",
                        component = "runner",
                        job_id = %ctx.job_id(),
                        lock_name = %loss.name,
                        reason = %loss.reason,
                        "Lock lost, cancelling run"
                    );
                    ctx.cancel(format!("lock lost: {}", loss.reason));
                }
            })
        });

        let deleted = DeletedItems::new();
        let mut initialized = false;
        let started = Instant::now();

        let result = AssertUnwindSafe(self.execute(
            &root,
            delete_before,
            timeout,
            &deleted,
            &mut initialized,
        ))
        .catch_unwind()
        .await;

        // Release first, then record the outcome.
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.release(lease).await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = format!("panic: {}", panic_message(panic.as_ref()));
                error!(
                    subsystem = "jobs",
                    component = "runner",
                    job_id = %root.job_id(),
                    error = %message,
                    "Cleanup run panicked"
                );
                self.record_failure(&root, delete_before, initialized, &deleted, message)
                    .await
            }
        };

        if let RunOutcome::Finished(summary) = &outcome {
            info!(
                subsystem = "jobs",
                component = "runner",
                job_id = %summary.job_id,
                status = %summary.status,
                deleted_items = summary.deleted_items,
                duration_ms = started.elapsed().as_millis() as u64,
                "Cleanup run finished"
            );
        }
        Ok(outcome)
    }

    async fn execute(
        &self,
        root: &RunContext,
        delete_before: DateTime<Utc>,
        timeout: Duration,
        deleted: &DeletedItems,
        initialized: &mut bool,
    ) -> RunOutcome {
        if let Err(e) = self.processor.initialize(root, delete_before).await {
            error!(
                subsystem = "jobs",
                component = "runner",
                job_id = %root.job_id(),
                error = %e,
                "Failed to initialize run"
            );
            return RunOutcome::Aborted(e.to_string());
        }
        *initialized = true;
        info!(
            subsystem = "jobs",
            component = "runner",
            job_id = %root.job_id(),
            delete_before = %delete_before,
            timeout_secs = timeout.as_secs(),
            "Cleanup run started"
        );

        let mut errors: Vec<String> = Vec::new();
        let mut timed_out = false;

        let processing = root.with_deadline("processing", timeout);
        let outcome = self
            .processor
            .process(&processing, delete_before, deleted)
            .await;
        errors.extend(outcome.item_errors);
        match outcome.result {
            Ok(()) => {}
            Err(e) if e.is_deadline() => {
                warn!(
                    subsystem = "jobs",
                    component = "runner",
                    op = "process",
                    job_id = %root.job_id(),
                    deleted_items = deleted.get(),
                    "Processing deadline exceeded"
                );
                timed_out = true;
                errors.push(e.to_string());
            }
            Err(e) => errors.push(e.to_string()),
        }

        let vacuum_budget = self.processor.vacuum_timeout();
        if vacuum_budget.is_zero() {
            debug!(subsystem = "jobs", component = "runner", "No vacuum phase");
        } else if root.is_cancelled() {
            debug!(
                subsystem = "jobs",
                component = "runner",
                op = "vacuum",
                "Run cancelled, skipping vacuum"
            );
        } else {
            let vacuum = root.with_deadline("vacuum", vacuum_budget);
            match self.processor.perform_vacuum(&vacuum).await {
                Ok(()) => {}
                Err(e) if e.is_deadline() => {
                    warn!(
                        subsystem = "jobs",
                        component = "runner",
                        op = "vacuum",
                        job_id = %root.job_id(),
                        budget_secs = vacuum_budget.as_secs(),
                        "Vacuum deadline exceeded"
                    );
                    timed_out = true;
                    errors.push(e.to_string());
                }
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "runner",
                        op = "vacuum",
                        error = %e,
                        "Vacuum failed"
                    );
                    errors.push(format!("vacuum: {e}"));
                }
            }
        }

        let status = if timed_out {
            JobRunStatus::Timeout
        } else if !errors.is_empty() {
            JobRunStatus::Error
        } else {
            JobRunStatus::Complete
        };
        let summary = RunSummary {
            job_id: root.job_id(),
            status,
            deleted_items: deleted.get(),
            details: join_details(&errors),
        };
        self.finalize(&summary).await;
        RunOutcome::Finished(summary)
    }

    /// Terminal status write under the detached release budget.
    async fn finalize(&self, summary: &RunSummary) {
        let update = RunUpdate {
            id: summary.job_id,
            status: summary.status,
            details: summary.details.clone(),
            deleted_items: summary.deleted_items,
            finished_at: Some(Utc::now()),
        };
        match tokio::time::timeout(
            self.settings.release_timeout,
            self.processor.update_progress(&update),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                subsystem = "jobs",
                component = "runner",
                job_id = %summary.job_id,
                error = %e,
                "Failed to persist final run status"
            ),
            Err(_) => error!(
                subsystem = "jobs",
                component = "runner",
                job_id = %summary.job_id,
                "Timed out persisting final run status"
            ),
        }
    }

    /// Record a panicked run as `error`, creating its row first if needed.
    async fn record_failure(
        &self,
        root: &RunContext,
        delete_before: DateTime<Utc>,
        initialized: bool,
        deleted: &DeletedItems,
        message: String,
    ) -> RunOutcome {
        if !initialized {
            let detached = RunContext::new(
                root.job_id(),
                root.job_type(),
                root.instance_id(),
                CancellationToken::new(),
            )
            .with_deadline("record_failure", self.settings.release_timeout);
            if let Err(e) = self.processor.initialize(&detached, delete_before).await {
                error!(
                    subsystem = "jobs",
                    component = "runner",
                    job_id = %root.job_id(),
                    error = %e,
                    "Failed to create run row for panicked run"
                );
                return RunOutcome::Aborted(message);
            }
        }

        let summary = RunSummary {
            job_id: root.job_id(),
            status: JobRunStatus::Error,
            deleted_items: deleted.get(),
            details: Some(truncate_details(&message, MAX_DETAILS_LEN)),
        };
        self.finalize(&summary).await;
        RunOutcome::Finished(summary)
    }

    async fn release(&self, lease: Lease) {
        let name = lease.name().to_string();
        match tokio::time::timeout(self.settings.release_timeout, self.locks.release_lease(lease))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                subsystem = "jobs",
                component = "runner",
                op = "release",
                lock_name = %name,
                error = %e,
                "Failed to release cleanup lock"
            ),
            Err(_) => error!(
                subsystem = "jobs",
                component = "runner",
                op = "release",
                lock_name = %name,
                "Timed out releasing cleanup lock"
            ),
        }
    }
}

fn join_details(errors: &[String]) -> Option<String> {
    if errors.is_empty() {
        None
    } else {
        Some(truncate_details(&errors.join("; "), MAX_DETAILS_LEN))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
