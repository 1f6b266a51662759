//! Job run repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use sweep_core::{Error, JobRun, JobRunRepository, JobRunStatus, JobType, Result, RunUpdate};

/// PostgreSQL implementation of JobRunRepository over `cleanup_job_run`.
#[derive(Clone)]
pub struct PgJobRunRepository {
    pool: Pool<Postgres>,
}

impl PgJobRunRepository {
    /// Create a new PgJobRunRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a run row into a JobRun struct.
    fn parse_run_row(row: sqlx::postgres::PgRow) -> Result<JobRun> {
        let job_type: String = row.get("job_type");
        let status: String = row.get("status");
        Ok(JobRun {
            id: row.get("id"),
            job_type: job_type.parse::<JobType>()?,
            instance_id: row.get("instance_id"),
            status: status.parse::<JobRunStatus>()?,
            delete_before: row.get("delete_before"),
            deleted_items: row.get("deleted_items"),
            details: row.get("details"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        })
    }
}

#[async_trait]
impl JobRunRepository for PgJobRunRepository {
    async fn store_run(&self, run: &JobRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO cleanup_job_run
                (id, job_type, instance_id, status, delete_before, deleted_items, details, started_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(run.id)
        .bind(run.job_type.as_str())
        .bind(&run.instance_id)
        .bind(run.status.as_str())
        .bind(run.delete_before)
        .bind(run.deleted_items)
        .bind(&run.details)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn update_run(&self, update: &RunUpdate) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cleanup_job_run
             SET status = $2, details = $3, deleted_items = $4, finished_at = $5
             WHERE id = $1",
        )
        .bind(update.id)
        .bind(update.status.as_str())
        .bind(&update.details)
        .bind(update.deleted_items)
        .bind(update.finished_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::Job(format!("run {} not found", update.id)));
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<JobRun>> {
        let row = sqlx::query(
            "SELECT id, job_type, instance_id, status, delete_before, deleted_items, details, started_at, finished_at
             FROM cleanup_job_run WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_run_row).transpose()
    }

    async fn list_runs(&self, job_type: JobType, limit: i64) -> Result<Vec<JobRun>> {
        let rows = sqlx::query(
            "SELECT id, job_type, instance_id, status, delete_before, deleted_items, details, started_at, finished_at
             FROM cleanup_job_run
             WHERE job_type = $1
             ORDER BY started_at DESC
             LIMIT $2",
        )
        .bind(job_type.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_run_row).collect()
    }
}
