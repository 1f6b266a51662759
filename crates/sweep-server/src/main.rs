//! sweep-server: runs the scheduled cleanup jobs against PostgreSQL.
//!
//! With `SWEEP_RUN_ONCE=<job type>` a single run is executed and the process
//! exits; otherwise every enabled job is scheduled until SIGINT or SIGTERM.

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sweep_db::{log_pool_metrics, Database, PoolConfig};
use sweep_jobs::{
    defaults, JobScheduler, JobType, LockService, RunOutcome, ScheduledJob, SweepConfig,
};

const POOL_METRICS_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "sweep_server=info,sweep_jobs=info,sweep_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sweep_server=info,sweep_jobs=info,sweep_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("sweep-server.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        subsystem = "server",
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = SweepConfig::from_env()?;
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| defaults::DATABASE_URL.to_string());

    let pool_config = PoolConfig::from_env();
    if !pool_config.fits_lease(Duration::from_secs(config.lease_secs)) {
        warn!(
            subsystem = "server",
            acquire_timeout_secs = pool_config.acquire_timeout.as_secs(),
            lease_secs = config.lease_secs,
            "DB_ACQUIRE_TIMEOUT_SECS is more than half the lock lease"
        );
    }
    let db = Database::connect_with_config(&database_url, pool_config).await?;
    db.migrate().await?;
    info!(
        subsystem = "server",
        instance_id = %config.instance_id,
        lock_name = %config.lock_name,
        "Database ready"
    );

    let locks = LockService::new(Arc::new(db.locks.clone())).with_skew_margin(config.clock_skew());

    match config.run_once {
        Some(job_type) => run_once(&db, &config, &locks, job_type).await,
        None => serve(&db, &config, &locks).await,
    }
}

/// Execute one run of `job_type` and exit. Ctrl-C cancels it cleanly.
async fn run_once(
    db: &Database,
    config: &SweepConfig,
    locks: &LockService,
    job_type: JobType,
) -> anyhow::Result<()> {
    let settings = config
        .job(job_type)
        .ok_or_else(|| anyhow::anyhow!("no settings for job type {job_type}"))?;
    let runner = jobs::build_runner(db, config, locks, settings);

    let token = CancellationToken::new();
    let on_signal = token.clone();
    let watcher = tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let outcome = runner.run_with(&token).await;
    watcher.abort();

    match outcome? {
        RunOutcome::Skipped(reason) => {
            info!(subsystem = "server", %job_type, ?reason, "Run skipped");
        }
        RunOutcome::Aborted(reason) => {
            anyhow::bail!("run of {job_type} aborted: {reason}");
        }
        RunOutcome::Finished(summary) => {
            info!(
                subsystem = "server",
                %job_type,
                job_id = %summary.job_id,
                status = %summary.status,
                deleted_items = summary.deleted_items,
                details = summary.details.as_deref().unwrap_or(""),
                "Run finished"
            );
        }
    }
    Ok(())
}

/// Schedule every enabled job until a shutdown signal arrives.
async fn serve(db: &Database, config: &SweepConfig, locks: &LockService) -> anyhow::Result<()> {
    let mut scheduler = JobScheduler::new();
    for settings in config.enabled_jobs() {
        let runner = jobs::build_runner(db, config, locks, settings);
        scheduler.add(ScheduledJob::new(
            settings.cron()?,
            Arc::new(runner),
            config.timeout_buffer(),
        ));
    }

    if scheduler.is_empty() {
        warn!(subsystem = "server", "No cleanup jobs enabled, exiting");
        return Ok(());
    }

    scheduler.start();
    let metrics_stop = CancellationToken::new();
    let metrics = tokio::spawn(watch_pool(db.clone(), metrics_stop.clone()));

    shutdown_signal().await;
    info!(subsystem = "server", "Shutdown signal received, stopping scheduler");
    scheduler.stop().await;
    metrics_stop.cancel();
    if let Err(e) = metrics.await {
        warn!(subsystem = "server", error = %e, "Pool metrics task ended abnormally");
    }
    db.pool().close().await;
    info!(subsystem = "server", "Shutdown complete");
    Ok(())
}

/// Periodic pool load logging while the scheduler runs.
async fn watch_pool(db: Database, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(POOL_METRICS_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                log_pool_metrics(db.pool());
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(subsystem = "server", error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(subsystem = "server", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
