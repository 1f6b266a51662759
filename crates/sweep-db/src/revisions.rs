//! Document revision cleanup repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use sweep_core::{Error, Result, RevisionKey, RevisionRepository};

/// PostgreSQL implementation of RevisionRepository over `document_revision`.
#[derive(Clone)]
pub struct PgRevisionRepository {
    pool: Pool<Postgres>,
}

impl PgRevisionRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevisionRepository for PgRevisionRepository {
    async fn find_expired_revisions(
        &self,
        delete_before: DateTime<Utc>,
        after: Option<RevisionKey>,
        limit: i64,
    ) -> Result<Vec<RevisionKey>> {
        let (after_document, after_revision) = match after {
            Some(key) => (Some(key.document_id), Some(key.revision)),
            None => (None, None),
        };

        // Keyset pagination on the primary key; the latest revision of each
        // document is always retained regardless of age.
        let rows = sqlx::query(
            "SELECT r.document_id, r.revision
             FROM document_revision r
             WHERE r.created_at < $1
               AND ($2::uuid IS NULL OR (r.document_id, r.revision) > ($2::uuid, $3::int4))
               AND r.revision < (
                   SELECT MAX(l.revision) FROM document_revision l
                   WHERE l.document_id = r.document_id
               )
             ORDER BY r.document_id, r.revision
             LIMIT $4",
        )
        .bind(delete_before)
        .bind(after_document)
        .bind(after_revision)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| RevisionKey {
                document_id: row.get("document_id"),
                revision: row.get("revision"),
            })
            .collect())
    }

    async fn delete_revisions(&self, keys: &[RevisionKey]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let document_ids: Vec<Uuid> = keys.iter().map(|k| k.document_id).collect();
        let revisions: Vec<i32> = keys.iter().map(|k| k.revision).collect();

        let result = sqlx::query(
            "DELETE FROM document_revision r
             USING UNNEST($1::uuid[], $2::int4[]) AS k(document_id, revision)
             WHERE r.document_id = k.document_id AND r.revision = k.revision",
        )
        .bind(&document_ids)
        .bind(&revisions)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }
}
