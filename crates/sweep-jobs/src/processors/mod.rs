//! Concrete cleanup processors.

pub mod blobs;
pub mod purge;
pub mod revisions;

pub use blobs::UnreferencedBlobProcessor;
pub use purge::PurgeProcessor;
pub use revisions::RevisionCleanupProcessor;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use sweep_core::{JobType, Result, VacuumRepository};

    use crate::context::RunContext;

    pub fn context(job_type: JobType) -> RunContext {
        RunContext::new(Uuid::now_v7(), job_type, "i-test", CancellationToken::new())
    }

    pub fn cutoff() -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::days(30)
    }

    /// Records which tables were vacuumed.
    #[derive(Clone, Default)]
    pub struct RecordingVacuum {
        pub calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl VacuumRepository for RecordingVacuum {
        async fn vacuum_tables(&self, tables: &[&str]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(tables.iter().map(|t| t.to_string()).collect());
            Ok(())
        }
    }
}
