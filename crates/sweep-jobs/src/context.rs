//! Explicit run context: identity, cancellation, and phase deadlines.
//!
//! A `RunContext` is passed by reference through every phase of a run. It
//! carries the run identity, a cancellation token (fired on lock loss or
//! shutdown), and an optional absolute deadline. Cancellation is cooperative:
//! loops call [`RunContext::check`] before each batch, and database calls are
//! wrapped in [`RunContext::guard`] so an in-flight statement is abandoned as
//! soon as the context ends.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sweep_core::{Error, JobType, Result};

#[derive(Clone)]
pub struct RunContext {
    job_id: Uuid,
    job_type: JobType,
    instance_id: Arc<str>,
    token: CancellationToken,
    cancel_reason: Arc<OnceLock<String>>,
    deadline: Option<Instant>,
    phase: &'static str,
}

impl RunContext {
    /// Root context for one run.
    pub fn new(
        job_id: Uuid,
        job_type: JobType,
        instance_id: impl Into<Arc<str>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            job_type,
            instance_id: instance_id.into(),
            token,
            cancel_reason: Arc::new(OnceLock::new()),
            deadline: None,
            phase: "run",
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn phase(&self) -> &'static str {
        self.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Child context for one phase, bounded by `budget` from now and by any
    /// deadline already inherited. Cancelling the parent cancels the child.
    pub fn with_deadline(&self, phase: &'static str, budget: Duration) -> Self {
        // A budget past the clock's range leaves only the inherited deadline.
        let own = Instant::now().checked_add(budget);
        let deadline = match (self.deadline, own) {
            (Some(inherited), Some(own)) => Some(inherited.min(own)),
            (inherited, None) => inherited,
            (None, own) => own,
        };
        Self {
            token: self.token.child_token(),
            deadline,
            phase,
            ..self.clone()
        }
    }

    /// Cancel this context (and its children), recording the first reason given.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.cancel_reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the run was cancelled, if a reason was recorded.
    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.get().map(String::as_str)
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn cancelled_error(&self) -> Error {
        Error::Cancelled(self.cancel_reason().unwrap_or("run cancelled").to_string())
    }

    /// Fail fast if the context has ended.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }
        if self.deadline_passed() {
            return Err(Error::DeadlineExceeded(self.phase.to_string()));
        }
        Ok(())
    }

    /// Run `fut`, abandoning it if the context is cancelled or its deadline passes.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.cancelled_error()),
            _ = expired => Err(Error::DeadlineExceeded(self.phase.to_string())),
            result = fut => result,
        }
    }
}

/// Running deleted-item counter shared between a processor and the runner.
#[derive(Debug, Clone, Default)]
pub struct DeletedItems(Arc<AtomicI64>);

impl DeletedItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` deleted items and return the new total.
    pub fn add(&self, n: u64) -> i64 {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        self.0.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
