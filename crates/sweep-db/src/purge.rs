//! Bounded-delete repositories for soft-deleted documents and stale comparisons.
//!
//! PostgreSQL has no `DELETE … LIMIT`, so each batch deletes the rows
//! selected by a limited sub-select in primary-key order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use sweep_core::{Error, PurgeRepository, Result};

/// Which set of rows a [`PgPurgeRepository`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeTarget {
    /// Documents soft-deleted before the cutoff (revisions and comparisons cascade).
    SoftDeletedDocuments,
    /// Comparison results created before the cutoff.
    StaleComparisons,
}

impl PurgeTarget {
    fn statement(&self) -> &'static str {
        match self {
            PurgeTarget::SoftDeletedDocuments => {
                "DELETE FROM document WHERE id IN (
                     SELECT id FROM document
                     WHERE deleted_at IS NOT NULL AND deleted_at < $1
                     ORDER BY id
                     LIMIT $2
                 )"
            }
            PurgeTarget::StaleComparisons => {
                "DELETE FROM document_comparison WHERE id IN (
                     SELECT id FROM document_comparison
                     WHERE created_at < $1
                     ORDER BY id
                     LIMIT $2
                 )"
            }
        }
    }

    fn tables(&self) -> &'static [&'static str] {
        match self {
            PurgeTarget::SoftDeletedDocuments => {
                &["document", "document_revision", "document_comparison"]
            }
            PurgeTarget::StaleComparisons => &["document_comparison"],
        }
    }
}

/// PostgreSQL implementation of PurgeRepository.
#[derive(Clone)]
pub struct PgPurgeRepository {
    pool: Pool<Postgres>,
    target: PurgeTarget,
}

impl PgPurgeRepository {
    pub fn new(pool: Pool<Postgres>, target: PurgeTarget) -> Self {
        Self { pool, target }
    }

    pub fn soft_deleted(pool: Pool<Postgres>) -> Self {
        Self::new(pool, PurgeTarget::SoftDeletedDocuments)
    }

    pub fn comparisons(pool: Pool<Postgres>) -> Self {
        Self::new(pool, PurgeTarget::StaleComparisons)
    }

    pub fn target(&self) -> PurgeTarget {
        self.target
    }
}

#[async_trait]
impl PurgeRepository for PgPurgeRepository {
    async fn purge_batch(&self, delete_before: DateTime<Utc>, limit: i64) -> Result<u64> {
        let result = sqlx::query(self.target.statement())
            .bind(delete_before)
            .bind(limit)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    fn affected_tables(&self) -> &'static [&'static str] {
        self.target.tables()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_deleted_tables_include_cascades() {
        let tables = PurgeTarget::SoftDeletedDocuments.tables();
        assert!(tables.contains(&"document"));
        assert!(tables.contains(&"document_revision"));
        assert!(tables.contains(&"document_comparison"));
    }

    #[test]
    fn test_statements_are_bounded() {
        for target in [PurgeTarget::SoftDeletedDocuments, PurgeTarget::StaleComparisons] {
            assert!(target.statement().contains("LIMIT $2"));
            assert!(target.statement().contains("ORDER BY id"));
        }
    }
}
