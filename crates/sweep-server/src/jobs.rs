//! Wiring of configured job types to their processors and runners.

use std::sync::Arc;

use sweep_db::Database;
use sweep_jobs::{
    JobProcessor, JobRunner, JobSettings, JobType, LockService, PurgeProcessor,
    RevisionCleanupProcessor, RunLedger, SweepConfig, UnreferencedBlobProcessor, VacuumPlan,
};

/// Build the processor for one job type over the PostgreSQL stores.
pub fn build_processor(
    db: &Database,
    settings: &JobSettings,
    checkpoint_items: i64,
) -> Arc<dyn JobProcessor> {
    let ledger = RunLedger::new(Arc::new(db.runs.clone()));
    let vacuum = (settings.vacuum_minutes > 0)
        .then(|| VacuumPlan::new(Arc::new(db.vacuum.clone()), settings.vacuum_timeout()));

    match settings.job_type {
        JobType::Versions => {
            let mut processor = RevisionCleanupProcessor::new(
                Arc::new(db.revisions.clone()),
                ledger,
                settings.batch_size,
            )
            .with_checkpoint_items(checkpoint_items);
            if let Some(plan) = vacuum {
                processor = processor.with_vacuum(plan);
            }
            Arc::new(processor)
        }
        JobType::Comparisons | JobType::SoftDeleted => {
            let repo = if settings.job_type == JobType::Comparisons {
                db.comparisons.clone()
            } else {
                db.soft_deleted.clone()
            };
            let mut processor =
                PurgeProcessor::new(settings.job_type, Arc::new(repo), ledger, settings.batch_size)
                    .with_checkpoint_items(checkpoint_items);
            if let Some(plan) = vacuum {
                processor = processor.with_vacuum(plan);
            }
            Arc::new(processor)
        }
        JobType::Unreferenced => {
            let mut processor = UnreferencedBlobProcessor::new(
                Arc::new(db.blobs.clone()),
                ledger,
                settings.batch_size,
            )
            .with_checkpoint_items(checkpoint_items);
            if let Some(plan) = vacuum {
                processor = processor.with_vacuum(plan);
            }
            Arc::new(processor)
        }
    }
}

/// Build a runner for one configured job, sharing the cluster lock service.
pub fn build_runner(
    db: &Database,
    config: &SweepConfig,
    locks: &LockService,
    settings: &JobSettings,
) -> JobRunner {
    JobRunner::new(
        build_processor(db, settings, config.checkpoint_items),
        locks.clone(),
        Arc::new(db.migrations.clone()),
        settings.job_config(&config.instance_id),
    )
    .with_settings(config.runner_settings())
}
