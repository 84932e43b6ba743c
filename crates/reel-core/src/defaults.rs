//! Centralized default constants for the reel queue.
//!
//! **This module is the single source of truth** for shared default values.
//! Environment-driven settings in `reel-jobs` and `reel-providers` fall back
//! to these constants when a variable is unset or unparsable.

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Default maximum number of jobs running at once.
pub const JOB_MAX_CONCURRENT: usize = 2;

/// Default number of retries for a failed job before it becomes terminal.
pub const JOB_MAX_RETRIES: i32 = 3;

/// Idle polling interval of the dispatch loop (milliseconds).
///
/// The loop is woken by enqueue/cancel/completion notifications, so this only
/// bounds how late a retry whose backoff expired gets picked up.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Number of terminal jobs kept as history before the oldest are evicted.
pub const JOB_RETENTION_COUNT: usize = 500;

/// Wall-clock limit for one pipeline stage (seconds). Rendering is slow.
pub const STAGE_TIMEOUT_SECS: u64 = 1_800;

/// Lowest accepted job priority (served first).
pub const JOB_PRIORITY_MIN: i32 = 0;

/// Highest accepted job priority (served last).
pub const JOB_PRIORITY_MAX: i32 = 100;

/// Priority assigned when the caller does not care.
pub const JOB_PRIORITY_DEFAULT: i32 = 50;

/// Capacity of the supervisor event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// RETRY BACKOFF
// =============================================================================

/// Delay before the first retry (milliseconds). Doubles per retry.
pub const BACKOFF_BASE_MS: u64 = 2_000;

/// Upper bound on a single retry delay (milliseconds).
pub const BACKOFF_MAX_MS: u64 = 300_000;

/// Random jitter added on top of the delay, as a fraction of the delay.
pub const BACKOFF_JITTER: f64 = 0.25;

// =============================================================================
// PROVIDER HEALTH & CIRCUIT BREAKER
// =============================================================================

/// Consecutive failures that open a provider's circuit.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 3;

/// Time a circuit stays open before a half-open probe (seconds).
pub const BREAKER_COOLDOWN_SECS: u64 = 60;

/// Cap for the doubling cool-down after failed probes (seconds).
pub const BREAKER_MAX_COOLDOWN_SECS: u64 = 600;

/// Weight of the newest sample in the success-rate and latency averages.
pub const HEALTH_EWMA_ALPHA: f64 = 0.2;

/// Success rate (percent) below which a provider counts as degraded.
pub const HEALTH_DEGRADED_SUCCESS_RATE: f64 = 50.0;

/// Attempts required before a provider can be judged degraded.
pub const HEALTH_MIN_SAMPLES: u64 = 5;

/// Default timeout for one external provider call (seconds).
pub const PROVIDER_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Default path of the JSON job snapshot file.
pub const SNAPSHOT_PATH: &str = "reel-jobs.json";
