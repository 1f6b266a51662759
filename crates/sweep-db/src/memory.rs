//! In-memory implementations of the lock, run, and migration stores.
//!
//! These apply the same predicates as the PostgreSQL statements, with a mutex
//! standing in for statement atomicity. Used by unit tests and single-node
//! development without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use sweep_core::{
    Error, JobRun, JobRunRepository, JobType, LeaseGrant, LockRecord, LockStore, MigrationRun,
    MigrationStatusSource, Result, RunUpdate,
};

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory LockStore.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    records: Arc<Mutex<HashMap<String, LockRecord>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a record in place as-is, bypassing all predicates.
    pub fn seed(&self, record: LockRecord) {
        lock_or_recover(&self.records).insert(record.name.clone(), record);
    }

    /// Current record for `name`.
    pub fn snapshot(&self, name: &str) -> Option<LockRecord> {
        lock_or_recover(&self.records).get(name).cloned()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn find(&self, name: &str) -> Result<Option<LockRecord>> {
        Ok(self.snapshot(name))
    }

    async fn insert(&self, name: &str, grant: &LeaseGrant) -> Result<LockRecord> {
        let mut records = lock_or_recover(&self.records);
        if records.contains_key(name) {
            return Err(Error::LockAlreadyAcquired(name.to_string()));
        }
        let record = LockRecord {
            name: name.to_string(),
            owner_instance_id: grant.owner_instance_id.clone(),
            acquired_at: grant.acquired_at,
            expires_at: grant.expires_at,
            version: 1,
        };
        records.insert(name.to_string(), record.clone());
        Ok(record)
    }

    async fn take_over(
        &self,
        name: &str,
        expected_version: i64,
        safe_now: DateTime<Utc>,
        grant: &LeaseGrant,
    ) -> Result<bool> {
        let mut records = lock_or_recover(&self.records);
        match records.get_mut(name) {
            Some(record) if record.version == expected_version && record.expires_at < safe_now => {
                record.owner_instance_id = grant.owner_instance_id.clone();
                record.acquired_at = grant.acquired_at;
                record.expires_at = grant.expires_at;
                record.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refresh(
        &self,
        name: &str,
        owner_instance_id: &str,
        expected_version: i64,
        safe_now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = lock_or_recover(&self.records);
        match records.get_mut(name) {
            Some(record)
                if record.owner_instance_id == owner_instance_id
                    && record.version == expected_version
                    && record.expires_at > safe_now =>
            {
                record.expires_at = expires_at;
                record.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(
        &self,
        name: &str,
        owner_instance_id: &str,
        expected_version: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = lock_or_recover(&self.records);
        match records.get_mut(name) {
            Some(record)
                if record.owner_instance_id == owner_instance_id
                    && record.version == expected_version =>
            {
                record.expires_at = expires_at;
                record.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-memory JobRunRepository.
#[derive(Clone, Default)]
pub struct MemoryJobRunRepository {
    runs: Arc<Mutex<Vec<JobRun>>>,
}

impl MemoryJobRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored runs, in insertion order.
    pub fn runs(&self) -> Vec<JobRun> {
        lock_or_recover(&self.runs).clone()
    }
}

#[async_trait]
impl JobRunRepository for MemoryJobRunRepository {
    async fn store_run(&self, run: &JobRun) -> Result<()> {
        let mut runs = lock_or_recover(&self.runs);
        if runs.iter().any(|r| r.id == run.id) {
            return Err(Error::Job(format!("run {} already exists", run.id)));
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn update_run(&self, update: &RunUpdate) -> Result<()> {
        let mut runs = lock_or_recover(&self.runs);
        let run = runs
            .iter_mut()
            .find(|r| r.id == update.id)
            .ok_or_else(|| Error::Job(format!("run {} not found", update.id)))?;
        run.status = update.status;
        run.details = update.details.clone();
        run.deleted_items = update.deleted_items;
        run.finished_at = update.finished_at;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<JobRun>> {
        Ok(lock_or_recover(&self.runs)
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_runs(&self, job_type: JobType, limit: i64) -> Result<Vec<JobRun>> {
        let mut runs: Vec<JobRun> = lock_or_recover(&self.runs)
            .iter()
            .filter(|r| r.job_type == job_type)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(runs)
    }
}

/// In-memory MigrationStatusSource.
#[derive(Clone, Default)]
pub struct MemoryMigrationStatus {
    running: Arc<Mutex<Vec<MigrationRun>>>,
}

impl MemoryMigrationStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a migration as running.
    pub fn start(&self, name: &str) -> Uuid {
        let id = Uuid::now_v7();
        lock_or_recover(&self.running).push(MigrationRun {
            id,
            name: name.to_string(),
            status: "running".to_string(),
            started_at: Utc::now(),
        });
        id
    }

    /// Mark a migration as finished.
    pub fn finish(&self, id: Uuid) {
        lock_or_recover(&self.running).retain(|m| m.id != id);
    }
}

#[async_trait]
impl MigrationStatusSource for MemoryMigrationStatus {
    async fn running_migrations(&self) -> Result<Vec<MigrationRun>> {
        Ok(lock_or_recover(&self.running).clone())
    }
}
