//! Structured logging field name constants.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query queue and provider events by the same names.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Persistence failures, panicked worker tasks |
//! | WARN  | Stage failures, retries, breaker opening, provider fallback |
//! | INFO  | Lifecycle events (supervisor start/stop, job start/finish) |
//! | DEBUG | Decision points (claims, skipped candidates, config changes) |
//! | TRACE | Per-progress-update chatter |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Caller-supplied tracing id carried on a job.
pub const CORRELATION_ID: &str = "correlation_id";

/// Subsystem originating the log event.
/// Values: "jobs", "providers", "db"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "queue", "supervisor", "worker", "breaker", "resolver"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "enqueue", "claim", "resolve", "report_outcome"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Worker currently holding a job.
pub const WORKER_ID: &str = "worker_id";

/// Pipeline stage name.
pub const STAGE: &str = "stage";

/// External provider name.
pub const PROVIDER: &str = "provider";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Retry attempt number of a job.
pub const RETRY_COUNT: &str = "retry_count";

/// Delay until the next retry, in milliseconds.
pub const BACKOFF_MS: &str = "backoff_ms";

/// Number of currently running jobs.
pub const RUNNING: &str = "running";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Circuit breaker state after a transition.
pub const BREAKER_STATE: &str = "breaker_state";
