//! Data migration status source.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use sweep_core::{Error, MigrationRun, MigrationStatusSource, Result};

/// Reads running system migrations from `data_migration_run`.
#[derive(Clone)]
pub struct PgMigrationStatusSource {
    pool: Pool<Postgres>,
}

impl PgMigrationStatusSource {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MigrationStatusSource for PgMigrationStatusSource {
    async fn running_migrations(&self) -> Result<Vec<MigrationRun>> {
        let rows = sqlx::query(
            "SELECT id, name, status, started_at
             FROM data_migration_run
             WHERE status = 'running'
             ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| MigrationRun {
                id: row.get("id"),
                name: row.get("name"),
                status: row.get("status"),
                started_at: row.get("started_at"),
            })
            .collect())
    }
}
