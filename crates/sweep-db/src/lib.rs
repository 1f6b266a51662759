//! # sweep-db
//!
//! PostgreSQL database layer for sweep.
//!
//! This crate provides:
//! - Connection pool management
//! - The optimistic-version lock store
//! - Job run persistence and the data-migration status source
//! - Cleanup repositories (revisions, bounded purges, unreferenced blobs, vacuum)
//! - In-memory stores for tests and single-node development
//!
//! ## Example
//!
//! ```rust,ignore
//! use sweep_db::Database;
//! use sweep_core::LockStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/sweep").await?;
//!
//!     if let Some(lock) = db.locks.find("cleanup_jobs").await? {
//!         println!("held by {} until {}", lock.owner_instance_id, lock.expires_at);
//!     }
//!     Ok(())
//! }
//! ```
pub mod blobs;
pub mod lock;
pub mod memory;
pub mod migration_status;
pub mod pool;
pub mod purge;
pub mod revisions;
pub mod runs;
pub mod vacuum;

// Re-export core types
pub use sweep_core::*;

pub use blobs::PgBlobRepository;
pub use lock::PgLockStore;
pub use memory::{MemoryJobRunRepository, MemoryLockStore, MemoryMigrationStatus};
pub use migration_status::PgMigrationStatusSource;
pub use pool::{
    create_pool, create_pool_with_config, log_pool_metrics, pool_pressure, PoolConfig, PoolPressure,
    MIN_POOL_SIZE,
};
pub use purge::{PgPurgeRepository, PurgeTarget};
pub use revisions::PgRevisionRepository;
pub use runs::PgJobRunRepository;
pub use vacuum::{PgVacuumRepository, VACUUMABLE_TABLES};

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Cluster-wide lock records.
    pub locks: PgLockStore,
    /// Cleanup run history.
    pub runs: PgJobRunRepository,
    /// Running data migrations.
    pub migrations: PgMigrationStatusSource,
    /// Expired document revisions.
    pub revisions: PgRevisionRepository,
    /// Soft-deleted documents past retention.
    pub soft_deleted: PgPurgeRepository,
    /// Stale document comparisons.
    pub comparisons: PgPurgeRepository,
    /// Unreferenced blobs.
    pub blobs: PgBlobRepository,
    /// Post-delete table vacuum.
    pub vacuum: PgVacuumRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            locks: PgLockStore::new(pool.clone()),
            runs: PgJobRunRepository::new(pool.clone()),
            migrations: PgMigrationStatusSource::new(pool.clone()),
            revisions: PgRevisionRepository::new(pool.clone()),
            soft_deleted: PgPurgeRepository::soft_deleted(pool.clone()),
            comparisons: PgPurgeRepository::comparisons(pool.clone()),
            blobs: PgBlobRepository::new(pool.clone()),
            vacuum: PgVacuumRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with default pool configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
