//! Structured logging field name constants.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query consistently across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback or retry applied |
//! | INFO  | Lifecycle events, job completions, batch runs |
//! | DEBUG | Decision points, promotions, idle polls |
//! | TRACE | Per-match iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID carried by [`crate::RequestContext`].
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "db", "jobs", "vision", "dedup"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "queue", "worker", "reaper", "client", "ingest"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "enqueue", "dequeue", "reclaim_stale", "search"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job task type tag.
pub const TASK_TYPE: &str = "task_type";

/// Lease holder identity.
pub const WORKER_ID: &str = "worker_id";

/// Dedupe key of a job.
pub const DEDUPE_KEY: &str = "dedupe_key";

/// Canonical pair key of a similarity record.
pub const PAIR_KEY: &str = "pair_key";

/// Source file identifier.
pub const FILE_ID: &str = "file_id";

/// Dedup batch identifier.
pub const BATCH_ID: &str = "batch_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of rows affected by a statement.
pub const ROWS: &str = "rows";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Classified error code stored alongside `last_error`.
pub const ERROR_CODE: &str = "error_code";
