//! # reel-jobs
//!
//! Background generation queue for reel jobs.
//!
//! This crate provides:
//! - Priority-based job queueing with FIFO order among equal priorities
//! - A supervisor that keeps a bounded number of jobs running, reconfigurable
//!   at runtime
//! - The staged pipeline (script, voice, visuals, render) behind a
//!   [`StageExecutor`] seam
//! - Retry with exponential backoff, cancellation, and snapshot persistence
//! - Progress and lifecycle notifications via a broadcast channel
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use reel_jobs::{JsonFileJobStore, NoOpExecutor, QueueSettings, QueueSupervisor};
//!
//! let settings = QueueSettings::from_env();
//! let store = Arc::new(JsonFileJobStore::open("reel-jobs.json").await?);
//! let queue = Arc::new(settings.build_queue(store));
//! queue.restore().await?;
//!
//! let supervisor = QueueSupervisor::new(queue.clone(), resolver, Arc::new(NoOpExecutor), settings);
//! let handle = supervisor.start();
//!
//! let id = queue.enqueue(spec, 10, None).await?;
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Drains running jobs and writes a final snapshot
//! handle.shutdown().await?;
//! ```

pub mod backoff;
pub mod queue;
pub mod stage;
pub mod store;
pub mod supervisor;
pub mod worker;

// Re-export core types
pub use reel_core::*;

pub use backoff::BackoffPolicy;
pub use queue::{summarize, ClaimedJob, FailureOutcome, JobQueue};
pub use stage::{
    provider_kind, InFlightCalls, NoOpExecutor, ProgressCallback, StageContext, StageExecutor,
    StageResult,
};
pub use store::{JsonFileJobStore, MemoryJobStore};
pub use supervisor::{QueueSettings, QueueSupervisor, SupervisorEvent, SupervisorHandle};
pub use worker::JobRunner;

/// Default maximum retries for failed jobs.
pub const DEFAULT_MAX_RETRIES: i32 = reel_core::defaults::JOB_MAX_RETRIES;

/// Default polling interval for the dispatch loop (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = reel_core::defaults::JOB_POLL_INTERVAL_MS;
