//! Error types for sweep.

use thiserror::Error;

/// Result type alias using sweep's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for sweep operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Another instance holds the lock, or won a concurrent race for it
    #[error("Lock already acquired: {0}")]
    LockAlreadyAcquired(String),

    /// The lease ran out before it could be refreshed
    #[error("Lock expired: {0}")]
    LockExpired(String),

    /// The caller's view of the lock version is out of date
    #[error("Lock version mismatch for {name}: expected {expected}, found {actual}")]
    VersionMismatch {
        name: String,
        expected: i64,
        actual: i64,
    },

    /// No lock record exists under this name
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Work was cancelled (lock loss or shutdown)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A phase ran past its deadline
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Cron expression could not be parsed or evaluated
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job processing error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Contention: someone else legitimately holds the lock. Skip, don't fail.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::LockAlreadyAcquired(_))
    }

    /// Staleness: the caller's view of the lock no longer matches the store.
    pub fn is_stale(&self) -> bool {
        matches!(self, Error::LockExpired(_) | Error::VersionMismatch { .. })
    }

    /// Transient failures are worth retrying on the next heartbeat tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => {
                db.code().is_some_and(|code| transient_sqlstate(&code))
            }
            Error::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_)
            ),
            _ => false,
        }
    }

    /// Whether this error was caused by a phase deadline.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Error::DeadlineExceeded(_))
    }

    /// Cancellation or deadline: the current phase must stop, not retry.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Error::Cancelled(_) | Error::DeadlineExceeded(_))
    }
}

/// SQLSTATE classes a retry can clear. `40` covers serialization failures
/// and deadlocks; `57` and `08` are server shutdown and broken connections.
fn transient_sqlstate(code: &str) -> bool {
    ["40", "57", "08"].iter().any(|class| code.starts_with(class))
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_lock_already_acquired() {
        let err = Error::LockAlreadyAcquired("cleanup_jobs".to_string());
        assert_eq!(err.to_string(), "Lock already acquired: cleanup_jobs");
    }

    #[test]
    fn test_error_display_version_mismatch() {
        let err = Error::VersionMismatch {
            name: "cleanup_jobs".to_string(),
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "Lock version mismatch for cleanup_jobs: expected 3, found 5"
        );
    }

    #[test]
    fn test_error_display_deadline() {
        let err = Error::DeadlineExceeded("processing".to_string());
        assert_eq!(err.to_string(), "Deadline exceeded: processing");
    }

    #[test]
    fn test_contention_classification() {
        assert!(Error::LockAlreadyAcquired("x".into()).is_contention());
        assert!(!Error::LockExpired("x".into()).is_contention());
        assert!(!Error::LockNotFound("x".into()).is_contention());
    }

    #[test]
    fn test_stale_classification() {
        assert!(Error::LockExpired("x".into()).is_stale());
        assert!(Error::VersionMismatch {
            name: "x".into(),
            expected: 1,
            actual: 2
        }
        .is_stale());
        assert!(!Error::LockAlreadyAcquired("x".into()).is_stale());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!Error::LockExpired("x".into()).is_transient());
        assert!(!Error::VersionMismatch {
            name: "x".into(),
            expected: 1,
            actual: 2
        }
        .is_transient());
    }

    #[test]
    fn test_transient_sqlstate_classes() {
        for code in ["40001", "40P01", "57014", "57P01", "08006", "08003"] {
            assert!(transient_sqlstate(code), "{code}");
        }
        for code in ["23505", "42P01", "22012", "P0001"] {
            assert!(!transient_sqlstate(code), "{code}");
        }
    }

    #[test]
    fn test_deadline_classification() {
        assert!(Error::DeadlineExceeded("vacuum".into()).is_deadline());
        assert!(!Error::Cancelled("lock lost".into()).is_deadline());
    }

    #[test]
    fn test_interruption_classification() {
        assert!(Error::Cancelled("shutdown".into()).is_interruption());
        assert!(Error::DeadlineExceeded("processing".into()).is_interruption());
        assert!(!Error::Job("bad row".into()).is_interruption());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
