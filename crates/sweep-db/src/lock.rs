//! Lock store implementation.
//!
//! Each mutation is one conditional statement; `rows_affected() == 1` is the
//! only success signal. No transactions or row locks are taken.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use sweep_core::{Error, LeaseGrant, LockRecord, LockStore, Result};

/// PostgreSQL implementation of LockStore over the `cleanup_lock` table.
#[derive(Clone)]
pub struct PgLockStore {
    pool: Pool<Postgres>,
}

impl PgLockStore {
    /// Create a new PgLockStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_lock_row(row: sqlx::postgres::PgRow) -> LockRecord {
        LockRecord {
            name: row.get("name"),
            owner_instance_id: row.get("owner_instance_id"),
            acquired_at: row.get("acquired_at"),
            expires_at: row.get("expires_at"),
            version: row.get("version"),
        }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn find(&self, name: &str) -> Result<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT name, owner_instance_id, acquired_at, expires_at, version
             FROM cleanup_lock WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_lock_row))
    }

    async fn insert(&self, name: &str, grant: &LeaseGrant) -> Result<LockRecord> {
        let result = sqlx::query(
            "INSERT INTO cleanup_lock (name, owner_instance_id, acquired_at, expires_at, version)
             VALUES ($1, $2, $3, $4, 1)
             RETURNING name, owner_instance_id, acquired_at, expires_at, version",
        )
        .bind(name)
        .bind(&grant.owner_instance_id)
        .bind(grant.acquired_at)
        .bind(grant.expires_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(Self::parse_lock_row(row)),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                debug!(
                    subsystem = "db",
                    component = "lock",
                    lock_name = name,
                    "Lost first-time insert race"
                );
                Err(Error::LockAlreadyAcquired(name.to_string()))
            }
            Err(e) => Err(Error::Database(e)),
        }
    }

    async fn take_over(
        &self,
        name: &str,
        expected_version: i64,
        safe_now: DateTime<Utc>,
        grant: &LeaseGrant,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE cleanup_lock
             SET owner_instance_id = $3, acquired_at = $4, expires_at = $5, version = version + 1
             WHERE name = $1 AND version = $2 AND expires_at < $6",
        )
        .bind(name)
        .bind(expected_version)
        .bind(&grant.owner_instance_id)
        .bind(grant.acquired_at)
        .bind(grant.expires_at)
        .bind(safe_now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn refresh(
        &self,
        name: &str,
        owner_instance_id: &str,
        expected_version: i64,
        safe_now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE cleanup_lock
             SET expires_at = $4, version = version + 1
             WHERE name = $1 AND owner_instance_id = $2 AND version = $3 AND expires_at > $5",
        )
        .bind(name)
        .bind(owner_instance_id)
        .bind(expected_version)
        .bind(expires_at)
        .bind(safe_now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(
        &self,
        name: &str,
        owner_instance_id: &str,
        expected_version: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE cleanup_lock
             SET expires_at = $4, version = version + 1
             WHERE name = $1 AND owner_instance_id = $2 AND version = $3",
        )
        .bind(name)
        .bind(owner_instance_id)
        .bind(expected_version)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
