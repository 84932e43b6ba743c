//! Data model shared by the queue, the workers, and the provider layer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

/// Opaque job identifier (UUIDv7, time-ordered).
pub type JobId = Uuid;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Completed, Failed and Cancelled jobs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

/// One sequential phase of the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Script,
    Voice,
    Visuals,
    Render,
}

impl Stage {
    /// Pipeline order. Stages never run concurrently within a job.
    pub const ALL: [Stage; 4] = [Stage::Script, Stage::Voice, Stage::Visuals, Stage::Render];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Script => "script",
            Stage::Voice => "voice",
            Stage::Visuals => "visuals",
            Stage::Render => "render",
        }
    }

    /// Human-readable progress label.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Script => "Generating script",
            Stage::Voice => "Synthesizing voice",
            Stage::Visuals => "Generating visuals",
            Stage::Render => "Rendering video",
        }
    }

    fn index(&self) -> i32 {
        match self {
            Stage::Script => 0,
            Stage::Voice => 1,
            Stage::Visuals => 2,
            Stage::Render => 3,
        }
    }

    /// Map a stage-local percentage onto overall job progress.
    ///
    /// Each stage owns an equal band; values outside 0..=100 are clamped.
    pub fn overall_percent(&self, stage_percent: i32) -> i32 {
        let band = 100 / Stage::ALL.len() as i32;
        self.index() * band + stage_percent.clamp(0, 100) * band / 100
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four generation specs carried by a job.
///
/// The queue treats them as opaque JSON documents; only the stage executor
/// interprets their contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub brief: JsonValue,
    pub plan: JsonValue,
    pub voice: JsonValue,
    pub render: JsonValue,
}

impl JobSpec {
    /// Reject structurally malformed payloads before they reach the queue.
    ///
    /// Every section must be a JSON object and the brief must name a topic.
    pub fn validate(&self) -> Result<()> {
        for (name, section) in [
            ("brief", &self.brief),
            ("plan", &self.plan),
            ("voice", &self.voice),
            ("render", &self.render),
        ] {
            if !section.is_object() {
                return Err(Error::InvalidInput(format!("{name} must be a JSON object")));
            }
        }

        match self.brief.get("topic").and_then(JsonValue::as_str) {
            Some(topic) if !topic.trim().is_empty() => Ok(()),
            _ => Err(Error::InvalidInput(
                "brief.topic must be a non-empty string".to_string(),
            )),
        }
    }
}

/// A job in the generation queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    /// Lower value is served first.
    pub priority: i32,
    pub status: JobStatus,
    pub progress_percent: i32,
    pub progress_message: Option<String>,
    pub current_stage: Option<Stage>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Pending jobs are not dispatched before this instant.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub correlation_id: Option<String>,
    pub output_path: Option<String>,
    pub last_error: Option<String>,
    /// Set when cancellation was requested while the job was running.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        id: JobId,
        spec: JobSpec,
        priority: i32,
        max_retries: i32,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            id,
            spec,
            priority,
            status: JobStatus::Pending,
            progress_percent: 0,
            progress_message: None,
            current_stage: None,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            worker_id: None,
            correlation_id,
            output_path: None,
            last_error: None,
            cancel_requested: false,
        }
    }

    /// When the job may next be claimed: its retry time, or enqueue time.
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.next_retry_at.unwrap_or(self.enqueued_at)
    }

    /// Pending and past any retry backoff.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.ready_at() <= now
    }

    /// Time spent waiting in the queue before the first start.
    pub fn wait_time(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| started - self.enqueued_at)
    }

    /// Time between the first start and the terminal transition.
    pub fn run_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Runtime-adjustable queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfiguration {
    pub max_concurrent_jobs: usize,
    /// When false, no new work is pulled; running jobs continue.
    pub is_enabled: bool,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            is_enabled: true,
        }
    }
}

impl QueueConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(Error::InvalidInput(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// Mean seconds between enqueue and first start, over started jobs.
    pub avg_wait_secs: Option<f64>,
    /// Mean seconds between start and completion, over completed jobs.
    pub avg_duration_secs: Option<f64>,
}

// =============================================================================
// PROVIDER TYPES
// =============================================================================

/// Rolling health of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealthMetrics {
    pub provider: String,
    /// Exponentially weighted success rate, 0..=100.
    pub success_rate_percent: f64,
    /// Exponentially weighted latency.
    pub average_latency_secs: f64,
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub total_failures: u64,
    pub last_updated: DateTime<Utc>,
}

/// State of a provider's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Dashboard view of a provider's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub provider: String,
    pub state: CircuitState,
    pub state_entered_at: DateTime<Utc>,
    /// Consecutive-failure threshold in force when the circuit last opened.
    pub failure_threshold: Option<u32>,
    /// Cool-down the breaker waits in Open before the next probe.
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    pub times_opened: u64,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
