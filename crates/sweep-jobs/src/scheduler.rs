//! Cron-driven scheduler for cleanup runners.
//!
//! Each [`ScheduledJob`] gets its own loop task. A firing is skipped while the
//! same entry's previous run is still in progress; across entries and
//! processes the shared cleanup lock is the only serialization point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use sweep_core::JobType;

use crate::runner::{JobRunner, RunOutcome};
use crate::schedule::CronSchedule;

/// A runner bound to a cron schedule, with its own re-entrancy guard.
pub struct ScheduledJob {
    schedule: CronSchedule,
    runner: Arc<JobRunner>,
    timeout_buffer: Duration,
    running: Arc<AtomicBool>,
}

/// Clears the entry's running flag when dropped.
pub struct RunningGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl ScheduledJob {
    pub fn new(schedule: CronSchedule, runner: Arc<JobRunner>, timeout_buffer: Duration) -> Self {
        Self {
            schedule,
            runner,
            timeout_buffer,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.runner.job_type()
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the entry for one run. `None` if a run is already in progress.
    pub fn try_begin(&self) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard {
                flag: self.running.clone(),
            })
    }

    /// Processing budget for a firing now: cron interval minus the buffer.
    fn processing_timeout(&self) -> Duration {
        match self.schedule.processing_timeout(self.timeout_buffer) {
            Ok(timeout) => timeout,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    job_type = %self.job_type(),
                    error = %e,
                    "Could not derive timeout from schedule, using configured timeout"
                );
                self.runner.config().timeout
            }
        }
    }

    async fn fire(&self, shutdown: &CancellationToken) {
        let timeout = self.processing_timeout();
        debug!(
            subsystem = "jobs",
            component = "scheduler",
            job_type = %self.job_type(),
            timeout_secs = timeout.as_secs(),
            "Firing scheduled run"
        );
        match self.runner.run_scheduled(shutdown, timeout).await {
            Ok(RunOutcome::Skipped(reason)) => debug!(
                subsystem = "jobs",
                component = "scheduler",
                job_type = %self.job_type(),
                ?reason,
                "Scheduled run skipped"
            ),
            Ok(RunOutcome::Aborted(reason)) => error!(
                subsystem = "jobs",
                component = "scheduler",
                job_type = %self.job_type(),
                %reason,
                "Scheduled run aborted"
            ),
            Ok(RunOutcome::Finished(_)) => {}
            Err(e) => error!(
                subsystem = "jobs",
                component = "scheduler",
                job_type = %self.job_type(),
                error = %e,
                "Scheduled run failed before start"
            ),
        }
    }
}

/// Owns the scheduled entries and their loop tasks.
pub struct JobScheduler {
    entries: Vec<Arc<ScheduledJob>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn add(&mut self, job: ScheduledJob) {
        info!(
            subsystem = "jobs",
            component = "scheduler",
            job_type = %job.job_type(),
            schedule = %job.schedule().expression(),
            "Registered cleanup job"
        );
        self.entries.push(Arc::new(job));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn one loop task per entry. Calling it twice has no effect.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        for entry in &self.entries {
            let entry = entry.clone();
            let shutdown = self.shutdown.clone();
            self.tasks.push(tokio::spawn(entry_loop(entry, shutdown)));
        }
        info!(
            subsystem = "jobs",
            component = "scheduler",
            jobs = self.entries.len(),
            "Scheduler started"
        );
    }

    /// Cancel all loops and in-flight runs, then wait for them to finish
    /// finalizing and releasing.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(
                    subsystem = "jobs",
                    component = "scheduler",
                    error = %e,
                    "Scheduler loop ended abnormally"
                );
            }
        }
        info!(subsystem = "jobs", component = "scheduler", "Scheduler stopped");
    }
}

#[instrument(skip_all, fields(job_type = %entry.job_type()))]
async fn entry_loop(entry: Arc<ScheduledJob>, shutdown: CancellationToken) {
    let mut in_flight = JoinSet::new();
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        // Never fire the same slot twice if the sleep woke early.
        let from = last_fired.map_or(now, |fired| fired.max(now));
        let Some(next) = entry.schedule.next_after(from) else {
            warn!(
                subsystem = "jobs",
                component = "scheduler",
                schedule = %entry.schedule.expression(),
                "Schedule has no future firings"
            );
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }
        last_fired = Some(next);

        match entry.try_begin() {
            Some(guard) => {
                let entry = entry.clone();
                let shutdown = shutdown.clone();
                in_flight.spawn(async move {
                    let _guard = guard;
                    entry.fire(&shutdown).await;
                });
            }
            None => warn!(
                subsystem = "jobs",
                component = "scheduler",
                scheduled_for = %next,
                "Previous run still in progress, skipping firing"
            ),
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(
            subsystem = "jobs",
            component = "scheduler",
            error = %e,
            "Scheduled run task panicked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeletedItems, RunContext};
    use crate::lock::LockService;
    use crate::processor::{JobProcessor, ProcessOutcome, RunLedger};
    use async_trait::async_trait;
    use sweep_core::{JobConfig, JobRunRepository, JobRunStatus, Result, RunUpdate};
    use sweep_db::{MemoryJobRunRepository, MemoryLockStore, MemoryMigrationStatus};
    use tokio::sync::Notify;

    struct SweepOnce {
        ledger: RunLedger,
        block: bool,
        /// Held open past any deadline until notified or cancelled.
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl JobProcessor for SweepOnce {
        fn job_type(&self) -> JobType {
            JobType::Comparisons
        }

        async fn initialize(&self, ctx: &RunContext, delete_before: DateTime<Utc>) -> Result<()> {
            self.ledger.initialize(ctx, delete_before).await
        }

        async fn process(
            &self,
            ctx: &RunContext,
            _delete_before: DateTime<Utc>,
            deleted: &DeletedItems,
        ) -> ProcessOutcome {
            deleted.add(1);
            if let Some(gate) = &self.gate {
                while !ctx.is_cancelled() {
                    tokio::select! {
                        _ = gate.notified() => break,
                        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                    }
                }
            }
            let result = if self.block {
                ctx.guard(std::future::pending::<Result<()>>()).await
            } else {
                Ok(())
            };
            ProcessOutcome::new(Vec::new(), result)
        }

        async fn update_progress(&self, update: &RunUpdate) -> Result<()> {
            self.ledger.update(update).await
        }
    }

    struct Fixture {
        runs: MemoryJobRunRepository,
        locks: MemoryLockStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                runs: MemoryJobRunRepository::new(),
                locks: MemoryLockStore::new(),
            }
        }

        fn job(&self, expression: &str, block: bool) -> ScheduledJob {
            self.entry(expression, block, None)
        }

        fn gated_job(&self, expression: &str, gate: Arc<Notify>) -> ScheduledJob {
            self.entry(expression, false, Some(gate))
        }

        fn entry(&self, expression: &str, block: bool, gate: Option<Arc<Notify>>) -> ScheduledJob {
            let processor = SweepOnce {
                ledger: RunLedger::new(Arc::new(self.runs.clone())),
                block,
                gate,
            };
            let runner = JobRunner::new(
                Arc::new(processor),
                LockService::new(Arc::new(self.locks.clone())),
                Arc::new(MemoryMigrationStatus::new()),
                JobConfig::new(JobType::Comparisons, "i-1", 30),
            );
            ScheduledJob::new(
                CronSchedule::parse(expression).unwrap(),
                Arc::new(runner),
                Duration::from_secs(60 * 60),
            )
        }
    }

    #[test]
    fn test_running_guard_suppresses_reentry() {
        let fixture = Fixture::new();
        let job = fixture.job("0 3 * * *", false);

        let guard = job.try_begin().expect("first claim succeeds");
        assert!(job.is_running());
        assert!(job.try_begin().is_none());

        drop(guard);
        assert!(!job.is_running());
        assert!(job.try_begin().is_some());
    }

    #[tokio::test]
    async fn test_start_and_stop_without_firing() {
        let fixture = Fixture::new();
        let mut scheduler = JobScheduler::new();
        assert!(scheduler.is_empty());
        scheduler.add(fixture.job("0 0 1 1 *", false));
        assert_eq!(scheduler.len(), 1);

        scheduler.start();
        tokio::time::timeout(Duration::from_secs(2), scheduler.stop())
            .await
            .expect("stop returns promptly");
        assert!(fixture.runs.runs().is_empty());
    }

    #[tokio::test]
    async fn test_fires_on_schedule() {
        let fixture = Fixture::new();
        let mut scheduler = JobScheduler::new();
        scheduler.add(fixture.job("* * * * * *", false));
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await;

        let runs = fixture.runs.runs();
        assert!(!runs.is_empty());
        assert!(runs.iter().all(|r| r.status == JobRunStatus::Complete));
    }

    #[tokio::test]
    async fn test_firings_skipped_while_run_in_progress() {
        let fixture = Fixture::new();
        let gate = Arc::new(Notify::new());
        let mut scheduler = JobScheduler::new();
        scheduler.add(fixture.gated_job("* * * * * *", gate.clone()));
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let runs = fixture.runs.runs();
        assert_eq!(runs.len(), 1, "overlapping firings must not start runs");
        assert_eq!(runs[0].status, JobRunStatus::Running);

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
            .await
            .expect("stop waits for the released run");

        let first = fixture.runs.get_run(runs[0].id).await.unwrap().unwrap();
        assert!(first.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_run() {
        let fixture = Fixture::new();
        let mut scheduler = JobScheduler::new();
        scheduler.add(fixture.job("* * * * * *", true));
        scheduler.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fixture.runs.runs().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "run never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
            .await
            .expect("stop waits for the run to finish");

        let runs = fixture.runs.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, JobRunStatus::Error);
        let lock = fixture.locks.snapshot(sweep_core::defaults::LOCK_NAME).unwrap();
        assert!(lock.expires_at < Utc::now());
    }
}
