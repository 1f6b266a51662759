//! Connection pool sizing and health for cleanup runs.
//!
//! A running job needs two connections at once: one for its batch statements
//! and one for the lock heartbeat. The pool is never sized below that, and
//! acquisition gives up well inside a lease so a starved heartbeat surfaces as
//! a transient refresh error instead of a silent stall.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use sweep_core::{defaults, Error, Result};

/// Batch connection plus heartbeat connection.
pub const MIN_POOL_SIZE: u32 = 2;

/// How long a caller waits for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_LIFETIME: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::DB_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Read `DB_MAX_CONNECTIONS` and `DB_ACQUIRE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Sizes below [`MIN_POOL_SIZE`] are raised to it.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let requested = lookup("DB_MAX_CONNECTIONS")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(defaults::DB_MAX_CONNECTIONS);
        if requested < MIN_POOL_SIZE {
            warn!(
                subsystem = "db",
                component = "pool",
                requested,
                minimum = MIN_POOL_SIZE,
                "DB_MAX_CONNECTIONS too small for heartbeat plus batch work, raising"
            );
        }
        let acquire_secs = lookup("DB_ACQUIRE_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
            .max(1);

        Self {
            max_connections: requested.max(MIN_POOL_SIZE),
            acquire_timeout: Duration::from_secs(acquire_secs),
        }
    }

    /// Whether a heartbeat waiting the full acquire timeout still renews
    /// before `lease` runs out.
    pub fn fits_lease(&self, lease: Duration) -> bool {
        self.acquire_timeout < lease / 2
    }
}

/// Create a pool with default configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.max(MIN_POOL_SIZE))
        .min_connections(1)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(IDLE_TIMEOUT)
        .max_lifetime(MAX_LIFETIME)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Load on the pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPressure {
    /// At least one idle connection.
    Available,
    /// Every open connection is busy but the pool may still grow.
    Saturated,
    /// Every connection up to the maximum is busy.
    Exhausted,
}

pub fn pool_pressure(size: u32, idle: usize, max_connections: u32) -> PoolPressure {
    if idle > 0 {
        PoolPressure::Available
    } else if size < max_connections {
        PoolPressure::Saturated
    } else {
        PoolPressure::Exhausted
    }
}

/// Log current pool load. An exhausted pool is the usual cause of heartbeat
/// refresh timeouts.
pub fn log_pool_metrics(pool: &PgPool) -> PoolPressure {
    let size = pool.size();
    let idle = pool.num_idle();
    let max = pool.options().get_max_connections();
    let pressure = pool_pressure(size, idle, max);

    match pressure {
        PoolPressure::Exhausted => warn!(
            subsystem = "db",
            component = "pool",
            op = "metrics",
            pool_size = size,
            max_connections = max,
            "Connection pool exhausted, lock heartbeat may miss its lease"
        ),
        _ => debug!(
            subsystem = "db",
            component = "pool",
            op = "metrics",
            pool_size = size,
            pool_idle = idle,
            ?pressure,
            "Pool health check"
        ),
    }
    pressure
}
