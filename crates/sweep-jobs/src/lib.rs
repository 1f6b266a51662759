//! # sweep-jobs
//!
//! Lease-locked cleanup jobs for sweep.
//!
//! This crate provides:
//! - A lease lock service with optimistic versioning and a background heartbeat
//! - An explicit run context carrying cancellation and phase deadlines
//! - The job processor contract and the concrete cleanup processors
//! - The job runner state machine (migration check, lock, process, vacuum, finalize)
//! - Cron schedule parsing, timeout derivation, and the job scheduler
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sweep_db::Database;
//! use sweep_jobs::{
//!     JobRunner, JobScheduler, JobType, LockService, RevisionCleanupProcessor, RunLedger,
//!     ScheduledJob, SweepConfig,
//! };
//!
//! let config = SweepConfig::from_env()?;
//! let db = Database::connect("postgres://...").await?;
//! let locks = LockService::new(Arc::new(db.locks.clone())).with_skew_margin(config.clock_skew());
//!
//! let versions = config.job(JobType::Versions).unwrap();
//! let processor = RevisionCleanupProcessor::new(
//!     Arc::new(db.revisions.clone()),
//!     RunLedger::new(Arc::new(db.runs.clone())),
//!     versions.batch_size,
//! );
//! let runner = JobRunner::new(
//!     Arc::new(processor),
//!     locks,
//!     Arc::new(db.migrations.clone()),
//!     versions.job_config(&config.instance_id),
//! )
//! .with_settings(config.runner_settings());
//!
//! let mut scheduler = JobScheduler::new();
//! scheduler.add(ScheduledJob::new(versions.cron()?, Arc::new(runner), config.timeout_buffer()));
//! scheduler.start();
//! // ...
//! scheduler.stop().await;
//! ```

pub mod config;
pub mod context;
pub mod lock;
pub mod processor;
pub mod processors;
pub mod runner;
pub mod schedule;
pub mod scheduler;

// Re-export core types
pub use sweep_core::*;

pub use config::{JobSettings, SweepConfig};
pub use context::{DeletedItems, RunContext};
pub use lock::{Lease, LockLoss, LockOptions, LockService};
pub use processor::{JobProcessor, ProcessOutcome, ProgressCheckpoint, RunLedger, VacuumPlan};
pub use processors::{PurgeProcessor, RevisionCleanupProcessor, UnreferencedBlobProcessor};
pub use runner::{JobRunner, RunOutcome, RunSummary, RunnerSettings, SkipReason};
pub use schedule::{derive_timeout, CronSchedule};
pub use scheduler::{JobScheduler, RunningGuard, ScheduledJob};
