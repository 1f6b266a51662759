//! Two instances racing for the same expired cleanup lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use sweep_db::{MemoryJobRunRepository, MemoryLockStore, MemoryMigrationStatus};
use sweep_jobs::{
    defaults::LOCK_NAME, JobConfig, JobRunRepository, JobRunStatus, JobRunner, JobType,
    LockRecord, LockService, PurgeProcessor, PurgeRepository, Result, RunLedger, RunOutcome,
    SkipReason,
};

/// Purge source that parks the first batch until the test opens the gate.
struct GatedPurge {
    gate: Semaphore,
    entered: AtomicBool,
    remaining: AtomicU64,
}

#[async_trait]
impl PurgeRepository for GatedPurge {
    async fn purge_batch(&self, _delete_before: DateTime<Utc>, limit: i64) -> Result<u64> {
        if !self.entered.swap(true, Ordering::SeqCst) {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| sweep_jobs::Error::Internal(e.to_string()))?;
        }
        let take = self.remaining.load(Ordering::SeqCst).min(limit as u64);
        self.remaining.fetch_sub(take, Ordering::SeqCst);
        Ok(take)
    }

    fn affected_tables(&self) -> &'static [&'static str] {
        &["document_comparison"]
    }
}

fn runner(
    instance_id: &str,
    purge: Arc<GatedPurge>,
    locks: &MemoryLockStore,
    runs: &MemoryJobRunRepository,
) -> JobRunner {
    let processor = PurgeProcessor::new(
        JobType::Comparisons,
        purge,
        RunLedger::new(Arc::new(runs.clone())),
        10,
    );
    JobRunner::new(
        Arc::new(processor),
        LockService::new(Arc::new(locks.clone())),
        Arc::new(MemoryMigrationStatus::new()),
        JobConfig::new(JobType::Comparisons, instance_id, 30),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_lock_race_has_single_runner() {
    let locks = MemoryLockStore::new();
    let runs = MemoryJobRunRepository::new();
    let past = Utc::now() - chrono::Duration::minutes(10);
    locks.seed(LockRecord {
        name: LOCK_NAME.to_string(),
        owner_instance_id: "crashed".to_string(),
        acquired_at: past - chrono::Duration::minutes(1),
        expires_at: past,
        version: 5,
    });

    let purge = Arc::new(GatedPurge {
        gate: Semaphore::new(0),
        entered: AtomicBool::new(false),
        remaining: AtomicU64::new(25),
    });
    let a = Arc::new(runner("instance-a", purge.clone(), &locks, &runs));
    let b = Arc::new(runner("instance-b", purge.clone(), &locks, &runs));

    let ha = tokio::spawn({
        let a = a.clone();
        async move { a.run().await }
    });
    let hb = tokio::spawn({
        let b = b.clone();
        async move { b.run().await }
    });

    // The winner parks inside its first batch; the loser must return on its own.
    let wait_until = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(purge.entered.load(Ordering::SeqCst) && (ha.is_finished() || hb.is_finished())) {
        assert!(tokio::time::Instant::now() < wait_until, "race did not settle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        !(ha.is_finished() && hb.is_finished()),
        "winner must still be holding the lock"
    );

    let during = locks.snapshot(LOCK_NAME).unwrap();
    assert_eq!(during.version, 6);
    let winner_id = during.owner_instance_id.clone();

    purge.gate.add_permits(1);
    let outcomes = [ha.await.unwrap().unwrap(), hb.await.unwrap().unwrap()];

    let skipped = outcomes
        .iter()
        .filter(|o| **o == RunOutcome::Skipped(SkipReason::LockHeld))
        .count();
    assert_eq!(skipped, 1);
    let summary = outcomes
        .iter()
        .find_map(|o| match o {
            RunOutcome::Finished(s) => Some(s.clone()),
            _ => None,
        })
        .expect("one run finished");
    assert_eq!(summary.status, JobRunStatus::Complete);
    assert_eq!(summary.deleted_items, 25);

    let all = runs.runs();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].instance_id, winner_id);
    let history = runs.list_runs(JobType::Comparisons, 10).await.unwrap();
    assert_eq!(history[0].status, JobRunStatus::Complete);

    let released = locks.snapshot(LOCK_NAME).unwrap();
    assert_eq!(released.owner_instance_id, winner_id);
    assert!(released.expires_at < Utc::now());
}
