//! Core traits for sweep abstractions.
//!
//! These traits define the persistence interfaces that concrete
//! implementations must satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// LOCK STORE
// =============================================================================

/// Persistence of lock records.
///
/// Every mutation is a single compare-and-swap. Methods return `true` when
/// exactly one row was changed and `false` when the predicate did not match;
/// interpreting a mismatch is the caller's job.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Read the record for `name`, if any.
    async fn find(&self, name: &str) -> Result<Option<LockRecord>>;

    /// Insert a brand-new record with `version = 1`.
    ///
    /// A uniqueness violation yields `Error::LockAlreadyAcquired`.
    async fn insert(&self, name: &str, grant: &LeaseGrant) -> Result<LockRecord>;

    /// Take over an expired lease:
    /// `WHERE name = ? AND version = expected_version AND expires_at < safe_now`.
    async fn take_over(
        &self,
        name: &str,
        expected_version: i64,
        safe_now: DateTime<Utc>,
        grant: &LeaseGrant,
    ) -> Result<bool>;

    /// Extend our own lease:
    /// `WHERE name = ? AND owner = ? AND version = expected_version AND expires_at > safe_now`.
    async fn refresh(
        &self,
        name: &str,
        owner_instance_id: &str,
        expected_version: i64,
        safe_now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Soft release: move `expires_at` into the past and bump the version.
    /// `WHERE name = ? AND owner = ? AND version = expected_version`.
    async fn release(
        &self,
        name: &str,
        owner_instance_id: &str,
        expected_version: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;
}

// =============================================================================
// RUN PERSISTENCE
// =============================================================================

/// Persistence of job run records.
#[async_trait]
pub trait JobRunRepository: Send + Sync {
    /// Insert a new run row.
    async fn store_run(&self, run: &JobRun) -> Result<()>;

    /// Update status, details, counts, and finish time in place.
    async fn update_run(&self, update: &RunUpdate) -> Result<()>;

    /// Get a run by ID.
    async fn get_run(&self, id: Uuid) -> Result<Option<JobRun>>;

    /// Most recent runs of a job type, newest first.
    async fn list_runs(&self, job_type: JobType, limit: i64) -> Result<Vec<JobRun>>;
}

/// Source of system-wide data migration status.
#[async_trait]
pub trait MigrationStatusSource: Send + Sync {
    /// Migrations currently running. Non-empty means cleanup must not start.
    async fn running_migrations(&self) -> Result<Vec<MigrationRun>>;
}

// =============================================================================
// CLEANUP REPOSITORIES
// =============================================================================

/// Expired document revisions.
#[async_trait]
pub trait RevisionRepository: Send + Sync {
    /// Next page of revisions created before `delete_before`, in key order,
    /// strictly after `after`. The latest revision of a document is never a candidate.
    async fn find_expired_revisions(
        &self,
        delete_before: DateTime<Utc>,
        after: Option<RevisionKey>,
        limit: i64,
    ) -> Result<Vec<RevisionKey>>;

    /// Delete the given revisions, returning the number of rows removed.
    async fn delete_revisions(&self, keys: &[RevisionKey]) -> Result<u64>;
}

/// Rows removable by a bounded `DELETE … LIMIT`.
#[async_trait]
pub trait PurgeRepository: Send + Sync {
    /// Delete up to `limit` rows older than `delete_before`. Zero means done.
    async fn purge_batch(&self, delete_before: DateTime<Utc>, limit: i64) -> Result<u64>;

    /// Tables whose storage the purge frees.
    fn affected_tables(&self) -> &'static [&'static str];
}

/// Blobs no longer referenced by any revision.
#[async_trait]
pub trait BlobRepository: Send + Sync {
    /// Next page of unreferenced blob hashes created before `created_before`,
    /// in hash order, strictly after `after`.
    async fn find_unreferenced_blobs(
        &self,
        created_before: DateTime<Utc>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Delete one blob if it is still unreferenced. Returns whether it was removed.
    async fn delete_blob_if_unreferenced(&self, hash: &str) -> Result<bool>;
}

/// Storage reclamation after bulk deletes.
#[async_trait]
pub trait VacuumRepository: Send + Sync {
    /// Vacuum and analyze the given tables.
    async fn vacuum_tables(&self, tables: &[&str]) -> Result<()>;
}
