//! Data models for locks, job runs, and cleanup candidates.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// LOCK TYPES
// =============================================================================

/// One row of the lock table.
///
/// Absence of the row means the lock is free. `version` increments on every
/// successful mutation and never decreases, so releases keep the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub owner_instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: i64,
}

/// New ownership written by an insert or a take-over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub owner_instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Cleanup job types. All of them share one cluster-wide lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Delete document revisions past retention (keeps the latest per document)
    Versions,
    /// Delete stale document comparison results
    Comparisons,
    /// Hard-delete documents soft-deleted before the cutoff
    SoftDeleted,
    /// Delete blobs no revision references anymore
    Unreferenced,
}

impl JobType {
    /// Every job type, in scheduling order.
    pub const ALL: [JobType; 4] = [
        JobType::Versions,
        JobType::Comparisons,
        JobType::SoftDeleted,
        JobType::Unreferenced,
    ];

    /// Database / log representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Versions => "versions",
            JobType::Comparisons => "comparisons",
            JobType::SoftDeleted => "soft_deleted",
            JobType::Unreferenced => "unreferenced",
        }
    }

    /// Upper-case fragment used in `SWEEP_<JOB>_*` environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            JobType::Versions => "VERSIONS",
            JobType::Comparisons => "COMPARISONS",
            JobType::SoftDeleted => "SOFT_DELETED",
            JobType::Unreferenced => "UNREFERENCED",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "versions" => Ok(JobType::Versions),
            "comparisons" => Ok(JobType::Comparisons),
            "soft_deleted" => Ok(JobType::SoftDeleted),
            "unreferenced" => Ok(JobType::Unreferenced),
            other => Err(Error::Config(format!("unknown job type: {other}"))),
        }
    }
}

// =============================================================================
// JOB RUNS
// =============================================================================

/// Status of a single cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRunStatus {
    Running,
    Complete,
    Error,
    Timeout,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Complete => "complete",
            JobRunStatus::Error => "error",
            JobRunStatus::Timeout => "timeout",
        }
    }

    /// Whether the run has reached a final state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobRunStatus::Running)
    }
}

impl fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobRunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobRunStatus::Running),
            "complete" => Ok(JobRunStatus::Complete),
            "error" => Ok(JobRunStatus::Error),
            "timeout" => Ok(JobRunStatus::Timeout),
            other => Err(Error::Serialization(format!("unknown run status: {other}"))),
        }
    }
}

/// Persisted record of one cleanup invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_type: JobType,
    pub instance_id: String,
    pub status: JobRunStatus,
    /// Retention cutoff: candidates older than this are deleted.
    pub delete_before: DateTime<Utc>,
    pub deleted_items: i64,
    /// Truncated error text.
    pub details: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    /// A freshly started run.
    pub fn started(
        id: Uuid,
        job_type: JobType,
        instance_id: impl Into<String>,
        delete_before: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_type,
            instance_id: instance_id.into(),
            status: JobRunStatus::Running,
            delete_before,
            deleted_items: 0,
            details: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// In-place update of a run row, used for checkpoints and finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunUpdate {
    pub id: Uuid,
    pub status: JobRunStatus,
    pub details: Option<String>,
    pub deleted_items: i64,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Truncate error text to at most `max_chars` characters on a char boundary.
pub fn truncate_details(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Per-invocation job configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub job_type: JobType,
    pub instance_id: String,
    /// Retention horizon in days.
    pub ttl_days: u32,
    /// Processing budget. Independent of the processor's vacuum budget.
    pub timeout: Duration,
}

impl JobConfig {
    pub fn new(job_type: JobType, instance_id: impl Into<String>, ttl_days: u32) -> Self {
        Self {
            job_type,
            instance_id: instance_id.into(),
            ttl_days,
            timeout: Duration::from_secs(crate::defaults::JOB_TIMEOUT_MINUTES * 60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cutoff relative to `now`: `now - ttl_days`.
    pub fn delete_before(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        chrono::Duration::try_days(i64::from(self.ttl_days))
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .ok_or_else(|| {
                Error::Config(format!(
                    "ttl of {} days for {} is out of range",
                    self.ttl_days, self.job_type
                ))
            })
    }
}

// =============================================================================
// COLLABORATOR TYPES
// =============================================================================

/// A system-wide data migration as reported by the migration status source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

/// Primary key of a document revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionKey {
    pub document_id: Uuid,
    pub revision: i32,
}
