//! Unreferenced blob repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use sweep_core::{BlobRepository, Error, Result};

/// PostgreSQL implementation of BlobRepository over `blob`.
#[derive(Clone)]
pub struct PgBlobRepository {
    pool: Pool<Postgres>,
}

impl PgBlobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlobRepository for PgBlobRepository {
    async fn find_unreferenced_blobs(
        &self,
        created_before: DateTime<Utc>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let hashes: Vec<String> = sqlx::query_scalar(
            "SELECT b.hash
             FROM blob b
             WHERE b.created_at < $1
               AND ($2::text IS NULL OR b.hash > $2)
               AND NOT EXISTS (
                   SELECT 1 FROM document_revision r WHERE r.blob_hash = b.hash
               )
             ORDER BY b.hash
             LIMIT $3",
        )
        .bind(created_before)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(hashes)
    }

    async fn delete_blob_if_unreferenced(&self, hash: &str) -> Result<bool> {
        // Re-check at delete time: a revision may have started referencing
        // the blob since the candidate page was read.
        let result = sqlx::query(
            "DELETE FROM blob b
             WHERE b.hash = $1
               AND NOT EXISTS (
                   SELECT 1 FROM document_revision r WHERE r.blob_hash = b.hash
               )",
        )
        .bind(hash)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
