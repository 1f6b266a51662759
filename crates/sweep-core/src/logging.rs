//! Structured logging schema and field name constants for sweep.
//!
//! All crates use these field names for structured logging so that log
//! aggregation can query lock and run events uniformly across instances.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Run could not reach a terminal state, or lock bookkeeping failed |
//! | WARN  | Skipped firing, lock loss, timeout, recoverable heartbeat failure |
//! | INFO  | Lifecycle events (scheduler start/stop), run start and completion |
//! | DEBUG | Decision points (lock contention, phase budgets) |
//! | TRACE | Per-batch iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs", "server"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "lock", "heartbeat", "runner", "scheduler", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "acquire", "refresh", "release", "process", "vacuum"
pub const OPERATION: &str = "op";

/// Process identity used as lock owner and run attribution.
pub const INSTANCE_ID: &str = "instance_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Run UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type (versions, comparisons, soft_deleted, unreferenced).
pub const JOB_TYPE: &str = "job_type";

/// Lock name.
pub const LOCK_NAME: &str = "lock_name";

/// Optimistic lock version.
pub const LOCK_VERSION: &str = "lock_version";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Running count of deleted items.
pub const DELETED_ITEMS: &str = "deleted_items";

/// Rows affected by a single batch.
pub const BATCH_ROWS: &str = "batch_rows";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Terminal run status.
pub const STATUS: &str = "status";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
