//! Queue supervisor: dynamic configuration and the dispatch loop that feeds
//! the worker pool.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use reel_core::{defaults, Error, JobStatus, JobStore, QueueConfiguration, Result, Stage};
use reel_providers::ProviderResolver;

use crate::backoff::BackoffPolicy;
use crate::queue::JobQueue;
use crate::stage::StageExecutor;
use crate::worker::JobRunner;

/// Static supervisor and queue settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Initial dynamic configuration.
    pub configuration: QueueConfiguration,
    /// Idle wake-up interval when no job signal arrives.
    pub poll_interval: Duration,
    /// Wall-clock limit for one stage.
    pub stage_timeout: Duration,
    /// MaxRetries for jobs enqueued without one.
    pub max_retries: i32,
    /// Terminal jobs kept as history.
    pub retention: usize,
    pub backoff: BackoffPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            configuration: QueueConfiguration::default(),
            poll_interval: Duration::from_millis(defaults::JOB_POLL_INTERVAL_MS),
            stage_timeout: Duration::from_secs(defaults::STAGE_TIMEOUT_SECS),
            max_retries: defaults::JOB_MAX_RETRIES,
            retention: defaults::JOB_RETENTION_COUNT,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl QueueSettings {
    /// Create settings from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `REEL_QUEUE_ENABLED` | `true` | Enable/disable dispatch |
    /// | `REEL_MAX_CONCURRENT_JOBS` | `2` | Max concurrently running jobs |
    /// | `REEL_POLL_INTERVAL_MS` | `1000` | Idle wake-up interval |
    /// | `REEL_JOB_MAX_RETRIES` | `3` | Default MaxRetries for new jobs |
    /// | `REEL_JOB_RETENTION` | `500` | Terminal jobs kept as history |
    /// | `REEL_STAGE_TIMEOUT_SECS` | `1800` | Per-stage timeout |
    ///
    /// Backoff variables are read by [`BackoffPolicy::from_env`].
    pub fn from_env() -> Self {
        let is_enabled = std::env::var("REEL_QUEUE_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("REEL_MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("REEL_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let max_retries = std::env::var("REEL_JOB_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::JOB_MAX_RETRIES)
            .max(0);

        let retention = std::env::var("REEL_JOB_RETENTION")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_RETENTION_COUNT);

        let stage_timeout_secs = std::env::var("REEL_STAGE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::STAGE_TIMEOUT_SECS)
            .max(1);

        Self {
            configuration: QueueConfiguration {
                max_concurrent_jobs,
                is_enabled,
            },
            poll_interval: Duration::from_millis(poll_interval_ms),
            stage_timeout: Duration::from_secs(stage_timeout_secs),
            max_retries,
            retention,
            backoff: BackoffPolicy::from_env(),
        }
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.configuration.max_concurrent_jobs = max;
        self
    }

    /// Enable or disable dispatch.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.configuration.is_enabled = enabled;
        self
    }

    /// Set the idle poll interval in milliseconds.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval = Duration::from_millis(ms);
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Build a queue carrying these settings' retention and retry defaults.
    pub fn build_queue(&self, store: Arc<dyn JobStore>) -> JobQueue {
        JobQueue::new(store)
            .with_retention(self.retention)
            .with_default_max_retries(self.max_retries)
    }
}

/// Event emitted by the supervisor and its workers.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Dispatch loop started.
    Started,
    /// Dispatch loop stopped after draining running jobs.
    Stopped,
    /// Dynamic configuration replaced.
    ConfigurationChanged(QueueConfiguration),
    /// A worker picked up a job.
    JobStarted {
        job_id: Uuid,
        worker_id: String,
        attempt: i32,
    },
    /// Stage progress, as overall percent.
    JobProgress {
        job_id: Uuid,
        stage: Stage,
        percent: i32,
        message: Option<String>,
    },
    /// A failed attempt was scheduled for retry.
    JobRetrying {
        job_id: Uuid,
        retry_count: i32,
        delay: Duration,
        error: String,
    },
    JobCompleted {
        job_id: Uuid,
        output_path: Option<String>,
    },
    JobFailed {
        job_id: Uuid,
        error: String,
    },
    JobCancelled {
        job_id: Uuid,
    },
}

/// Owns the dynamic configuration and the loop that hands ready jobs to
/// workers, keeping at most `max_concurrent_jobs` running.
pub struct QueueSupervisor {
    queue: Arc<JobQueue>,
    runner: JobRunner,
    settings: QueueSettings,
    config: watch::Sender<QueueConfiguration>,
    event_tx: broadcast::Sender<SupervisorEvent>,
}

impl QueueSupervisor {
    pub fn new(
        queue: Arc<JobQueue>,
        resolver: Arc<ProviderResolver>,
        executor: Arc<dyn StageExecutor>,
        settings: QueueSettings,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let mut configuration = settings.configuration;
        configuration.max_concurrent_jobs = configuration.max_concurrent_jobs.max(1);
        let (config, _) = watch::channel(configuration);
        let runner = JobRunner::new(
            queue.clone(),
            executor,
            resolver,
            settings.backoff,
            settings.stage_timeout,
            event_tx.clone(),
        );
        Self {
            queue,
            runner,
            settings,
            config,
            event_tx,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn get_configuration(&self) -> QueueConfiguration {
        *self.config.borrow()
    }

    /// Replace the dynamic configuration.
    ///
    /// Lowering `max_concurrent_jobs` only throttles future dispatch; jobs
    /// already running are left alone.
    pub fn update_configuration(&self, configuration: QueueConfiguration) -> Result<()> {
        configuration.validate()?;
        let previous = self.config.send_replace(configuration);
        info!(
            subsystem = "jobs",
            component = "supervisor",
            op = "configure",
            max_concurrent = configuration.max_concurrent_jobs,
            enabled = configuration.is_enabled,
            previous_max_concurrent = previous.max_concurrent_jobs,
            previous_enabled = previous.is_enabled,
            "Queue configuration updated"
        );
        let _ = self
            .event_tx
            .send(SupervisorEvent::ConfigurationChanged(configuration));
        Ok(())
    }

    /// Get a receiver for supervisor events.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }

    /// Start the dispatch loop and return a handle for control.
    pub fn start(self) -> SupervisorHandle {
        let shutdown = CancellationToken::new();
        let supervisor = Arc::new(self);
        let task = tokio::spawn(supervisor.clone().run(shutdown.clone()));
        SupervisorHandle {
            supervisor,
            shutdown,
            task,
        }
    }

    /// Dispatch loop.
    ///
    /// Claims ready jobs while below the concurrency limit, then sleeps until
    /// a job is enqueued or becomes due, a worker finishes, the configuration
    /// changes, or the poll interval elapses.
    #[instrument(skip_all, fields(subsystem = "jobs", component = "supervisor"))]
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut config_rx = self.config.subscribe();
        let mut tasks: JoinSet<usize> = JoinSet::new();
        let mut busy: BTreeSet<usize> = BTreeSet::new();

        let initial = *config_rx.borrow();
        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            max_concurrent = initial.max_concurrent_jobs,
            enabled = initial.is_enabled,
            "Queue supervisor started"
        );
        let _ = self.event_tx.send(SupervisorEvent::Started);

        loop {
            let config = *config_rx.borrow_and_update();

            if config.is_enabled {
                while tasks.len() < config.max_concurrent_jobs {
                    let slot = (1..).find(|n| !busy.contains(n)).unwrap_or(busy.len() + 1);
                    let worker_id = format!("worker-{slot}");
                    let Some(claimed) = self.queue.claim_next(&worker_id).await else {
                        break;
                    };
                    busy.insert(slot);
                    let runner = self.runner.clone();
                    tasks.spawn(async move {
                        hold_slot(slot, runner.run(claimed, &worker_id)).await
                    });
                }
                debug!(
                    running = tasks.len(),
                    pending = self.queue.pending_count(),
                    "Dispatch pass finished"
                );
            }

            let idle_wait = self.idle_wait(&config, tasks.len());

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Queue supervisor received shutdown signal");
                    break;
                }
                _ = self.queue.wait_for_job() => {}
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(slot) => {
                            busy.remove(&slot);
                        }
                        Err(e) => error!(error = ?e, "Job task failed"),
                    }
                }
                _ = sleep(idle_wait) => {}
            }
        }

        if !tasks.is_empty() {
            info!(running = tasks.len(), "Waiting for running jobs to finish");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = ?e, "Job task failed");
            }
        }

        match self.queue.snapshot().await {
            Ok(jobs) => debug!(jobs, "Final queue snapshot written"),
            Err(e) => error!(error = %e, "Failed to write final queue snapshot"),
        }

        let _ = self.event_tx.send(SupervisorEvent::Stopped);
        info!("Queue supervisor stopped");
    }

    /// How long to sleep when nothing signals the loop.
    fn idle_wait(&self, config: &QueueConfiguration, running: usize) -> Duration {
        let poll = self.settings.poll_interval.max(Duration::from_millis(1));
        if !config.is_enabled || running >= config.max_concurrent_jobs {
            return poll;
        }
        self.queue
            .next_retry_at()
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .map_or(poll, |until| until.min(poll))
    }
}

/// Run a job on `slot` and hand the slot back once the run ends, panic or not.
async fn hold_slot<F>(slot: usize, run: F) -> usize
where
    F: Future<Output = JobStatus>,
{
    if AssertUnwindSafe(run).catch_unwind().await.is_err() {
        error!(worker_slot = slot, "Job task panicked");
    }
    slot
}

/// Handle for controlling a running supervisor.
pub struct SupervisorHandle {
    supervisor: Arc<QueueSupervisor>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn queue(&self) -> &Arc<JobQueue> {
        self.supervisor.queue()
    }

    pub fn get_configuration(&self) -> QueueConfiguration {
        self.supervisor.get_configuration()
    }

    pub fn update_configuration(&self, configuration: QueueConfiguration) -> Result<()> {
        self.supervisor.update_configuration(configuration)
    }

    /// Get a receiver for supervisor events.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.supervisor.events()
    }

    /// Stop dispatching, wait for running jobs to finish, and write a final
    /// snapshot.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Supervisor task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crash() -> JobStatus {
        panic!("worker bug outside the stage guard");
    }

    #[tokio::test]
    async fn test_panicking_job_task_returns_its_slot() {
        let mut tasks: JoinSet<usize> = JoinSet::new();
        tasks.spawn(hold_slot(3, async { crash() }));
        tasks.spawn(hold_slot(4, async { JobStatus::Completed }));

        let mut freed: Vec<usize> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            freed.push(joined.unwrap());
        }
        freed.sort_unstable();
        assert_eq!(freed, vec![3, 4]);
    }

    #[test]
    fn test_queue_settings_default() {
        let settings = QueueSettings::default();
        assert_eq!(settings.configuration.max_concurrent_jobs, 2);
        assert!(settings.configuration.is_enabled);
        assert_eq!(settings.poll_interval, Duration::from_millis(1000));
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retention, 500);
    }

    #[test]
    fn test_queue_settings_builder() {
        let settings = QueueSettings::default()
            .with_max_concurrent(8)
            .with_enabled(false)
            .with_poll_interval(50)
            .with_max_retries(1)
            .with_retention(10)
            .with_stage_timeout(Duration::from_secs(30));

        assert_eq!(settings.configuration.max_concurrent_jobs, 8);
        assert!(!settings.configuration.is_enabled);
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.retention, 10);
        assert_eq!(settings.stage_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_queue_settings_from_env_clamps() {
        std::env::set_var("REEL_MAX_CONCURRENT_JOBS", "0");
        std::env::set_var("REEL_QUEUE_ENABLED", "false");
        let settings = QueueSettings::from_env();
        assert_eq!(settings.configuration.max_concurrent_jobs, 1);
        assert!(!settings.configuration.is_enabled);
        std::env::remove_var("REEL_MAX_CONCURRENT_JOBS");
        std::env::remove_var("REEL_QUEUE_ENABLED");
    }

    #[test]
    fn test_event_clone_and_debug() {
        let event = SupervisorEvent::JobRetrying {
            job_id: Uuid::nil(),
            retry_count: 2,
            delay: Duration::from_secs(4),
            error: "voice: 503".into(),
        };
        let copy = event.clone();
        let debug = format!("{copy:?}");
        assert!(debug.contains("JobRetrying"));
        assert!(debug.contains("voice: 503"));
    }
}
