//! Table vacuum after bulk deletes.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::{debug, info};

use sweep_core::{Error, Result, VacuumRepository};

/// Tables cleanup jobs are allowed to vacuum.
///
/// `VACUUM` cannot take bind parameters, so table names are only ever
/// interpolated from this list.
pub const VACUUMABLE_TABLES: &[&str] = &[
    "document",
    "document_revision",
    "document_comparison",
    "blob",
];

/// PostgreSQL implementation of VacuumRepository.
#[derive(Clone)]
pub struct PgVacuumRepository {
    pool: Pool<Postgres>,
}

impl PgVacuumRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

/// Validate table names against [`VACUUMABLE_TABLES`].
pub fn validate_vacuum_tables(tables: &[&str]) -> Result<()> {
    match tables.iter().find(|t| !VACUUMABLE_TABLES.contains(t)) {
        Some(table) => Err(Error::Config(format!(
            "table {table} is not allowed to be vacuumed"
        ))),
        None => Ok(()),
    }
}

#[async_trait]
impl VacuumRepository for PgVacuumRepository {
    async fn vacuum_tables(&self, tables: &[&str]) -> Result<()> {
        validate_vacuum_tables(tables)?;

        for table in tables {
            let start = Instant::now();
            debug!(subsystem = "db", component = "vacuum", db_table = table, "Vacuuming table");

            // Runs outside any transaction block, which VACUUM requires.
            sqlx::query(&format!("VACUUM (ANALYZE) {table}"))
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;

            info!(
                subsystem = "db",
                component = "vacuum",
                db_table = table,
                duration_ms = start.elapsed().as_millis() as u64,
                "Table vacuumed"
            );
        }
        Ok(())
    }
}
