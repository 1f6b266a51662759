//! Centralized default constants for sweep.
//!
//! **This module is the single source of truth** for all shared default values.
//! Configuration loaders and tests reference these constants instead of
//! defining their own magic numbers.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section.

// =============================================================================
// LOCKING
// =============================================================================

/// Name of the single lock shared by every cleanup job type.
pub const LOCK_NAME: &str = "cleanup_jobs";

/// Lease length in seconds.
pub const LOCK_LEASE_SECS: u64 = 60;

/// Heartbeat (refresh) interval in seconds.
pub const LOCK_HEARTBEAT_SECS: u64 = 20;

/// Clock-skew margin in seconds.
///
/// Subtracted from "now" when deciding whether a foreign lease has expired,
/// added to "now" when refreshing our own.
pub const CLOCK_SKEW_SECS: u64 = 10;

/// Budget in seconds for lock release and terminal status writes once the
/// run's own deadline has passed.
pub const RELEASE_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// SCHEDULING
// =============================================================================

/// Buffer subtracted from the cron interval when deriving a processing budget.
pub const TIMEOUT_BUFFER_MINUTES: u64 = 60;

/// Fraction of the cron interval used when the interval is shorter than the buffer.
pub const SHORT_INTERVAL_TIMEOUT_RATIO: f64 = 0.9;

/// Processing budget in minutes for manual (unscheduled) runs.
pub const JOB_TIMEOUT_MINUTES: u64 = 60;

// =============================================================================
// RUN RECORDS
// =============================================================================

/// Maximum characters of error text stored in a run's `details` column.
pub const MAX_DETAILS_LEN: usize = 2000;

/// Deleted-item threshold between partial progress writes.
pub const PROGRESS_CHECKPOINT_ITEMS: i64 = 10_000;

/// Longest accepted retention horizon, in days.
pub const MAX_TTL_DAYS: u32 = 36_500;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Revision cleanup: daily at 02:00.
pub const VERSIONS_SCHEDULE: &str = "0 2 * * *";
/// Revision retention in days.
pub const VERSIONS_TTL_DAYS: u32 = 90;
/// Revisions per page.
pub const VERSIONS_BATCH_SIZE: i64 = 500;
/// Vacuum budget in minutes after revision cleanup.
pub const VERSIONS_VACUUM_MINUTES: u64 = 30;

/// Comparison cleanup: daily at 03:00.
pub const COMPARISONS_SCHEDULE: &str = "0 3 * * *";
/// Comparison retention in days.
pub const COMPARISONS_TTL_DAYS: u32 = 30;
/// Comparisons per delete batch.
pub const COMPARISONS_BATCH_SIZE: i64 = 1000;
/// Comparison cleanup does not vacuum by default.
pub const COMPARISONS_VACUUM_MINUTES: u64 = 0;

/// Soft-deleted data cleanup: daily at 04:00.
pub const SOFT_DELETED_SCHEDULE: &str = "0 4 * * *";
/// Days a soft-deleted document is kept before purging.
pub const SOFT_DELETED_TTL_DAYS: u32 = 30;
/// Documents per delete batch.
pub const SOFT_DELETED_BATCH_SIZE: i64 = 200;
/// Vacuum budget in minutes after purging soft-deleted documents.
pub const SOFT_DELETED_VACUUM_MINUTES: u64 = 30;

/// Unreferenced blob cleanup: weekly, Sunday 05:00.
pub const UNREFERENCED_SCHEDULE: &str = "0 5 * * Sun";
/// Minimum blob age in days before it can be considered unreferenced.
pub const UNREFERENCED_TTL_DAYS: u32 = 7;
/// Candidate blobs per page.
pub const UNREFERENCED_BATCH_SIZE: i64 = 100;
/// Vacuum budget in minutes after blob cleanup.
pub const UNREFERENCED_VACUUM_MINUTES: u64 = 15;

// =============================================================================
// DATABASE
// =============================================================================

/// Default database URL.
pub const DATABASE_URL: &str = "postgres://localhost/sweep";

/// Default maximum number of pooled connections.
pub const DB_MAX_CONNECTIONS: u32 = 10;
