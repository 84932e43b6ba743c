//! In-process priority job queue.
//!
//! Pending jobs sit in an ordered ready set keyed by
//! `(priority, ready_at, sequence)`: lower priority values are served first,
//! then the job that became claimable earliest, with the sequence number
//! breaking exact ties in admission order. `ready_at` is a retried job's
//! `next_retry_at`, so a retry queues behind equal-priority jobs enqueued
//! during its backoff.
//!
//! All state lives behind one short-lived `std::sync::Mutex`; no `.await`
//! happens while it is held. Snapshots go to the [`JobStore`] afterwards,
//! serialized through a separate async lock so the store always ends up
//! with each job's latest state.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use reel_core::{
    defaults, new_v7, Error, Job, JobId, JobSpec, JobStatus, JobStore, QueueStats, Result, Stage,
};

use crate::backoff::BackoffPolicy;
use crate::store::MemoryJobStore;

/// A job handed to a worker, with the token cancellation is signalled on.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub cancel: CancellationToken,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to Pending until `next_retry_at`.
    Retrying {
        retry_count: i32,
        delay: Duration,
        next_retry_at: DateTime<Utc>,
    },
    /// Terminal failure.
    Failed,
    /// Cancellation had been requested; the failure ends the job as Cancelled.
    Cancelled,
}

type ReadyKey = (i32, DateTime<Utc>, u64, JobId);

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    ready: BTreeSet<ReadyKey>,
    ready_keys: HashMap<JobId, ReadyKey>,
    tokens: HashMap<JobId, CancellationToken>,
    next_seq: u64,
}

impl QueueState {
    fn admit(&mut self, id: JobId, priority: i32, ready_at: DateTime<Utc>) {
        let key = (priority, ready_at, self.next_seq, id);
        self.next_seq += 1;
        self.ready.insert(key);
        self.ready_keys.insert(id, key);
    }

    fn withdraw(&mut self, id: &JobId) {
        if let Some(key) = self.ready_keys.remove(id) {
            self.ready.remove(&key);
        }
    }

    /// Move a running or pending job into a terminal status.
    fn finish(&mut self, id: &JobId, status: JobStatus) -> Option<Job> {
        self.withdraw(id);
        self.tokens.remove(id);
        let job = self.jobs.get_mut(id)?;
        job.status = status;
        job.completed_at = Some(Utc::now());
        job.worker_id = None;
        job.next_retry_at = None;
        Some(job.clone())
    }

    fn running(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }
}

/// Priority queue of generation jobs with retry bookkeeping.
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    store: Arc<dyn JobStore>,
    persist_lock: tokio::sync::Mutex<()>,
    retention: usize,
    default_max_retries: i32,
}

impl JobQueue {
    /// Create an empty queue that snapshots into `store`.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            store,
            persist_lock: tokio::sync::Mutex::new(()),
            retention: defaults::JOB_RETENTION_COUNT,
            default_max_retries: defaults::JOB_MAX_RETRIES,
        }
    }

    /// Read-only view over a set of job records, for offline inspection.
    ///
    /// Records are admitted as-is: Running jobs stay Running and nothing is
    /// written anywhere.
    pub fn inspect(jobs: Vec<Job>) -> Self {
        let queue = Self::new(Arc::new(MemoryJobStore::new())).with_retention(usize::MAX);
        queue.admit_loaded(jobs, false);
        queue
    }

    /// Number of terminal jobs kept as history.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// MaxRetries applied by [`JobQueue::enqueue`].
    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries.max(0);
        self
    }

    pub fn default_max_retries(&self) -> i32 {
        self.default_max_retries
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Caller operations
    // =========================================================================

    /// Admit a new job with the queue's default MaxRetries.
    pub async fn enqueue(
        &self,
        spec: JobSpec,
        priority: i32,
        correlation_id: Option<String>,
    ) -> Result<JobId> {
        self.enqueue_with_retries(spec, priority, correlation_id, self.default_max_retries)
            .await
    }

    /// Admit a new job with an explicit MaxRetries.
    pub async fn enqueue_with_retries(
        &self,
        spec: JobSpec,
        priority: i32,
        correlation_id: Option<String>,
        max_retries: i32,
    ) -> Result<JobId> {
        spec.validate()?;
        if !(defaults::JOB_PRIORITY_MIN..=defaults::JOB_PRIORITY_MAX).contains(&priority) {
            return Err(Error::InvalidInput(format!(
                "priority must be between {} and {}, got {priority}",
                defaults::JOB_PRIORITY_MIN,
                defaults::JOB_PRIORITY_MAX
            )));
        }
        if max_retries < 0 {
            return Err(Error::InvalidInput(format!(
                "max_retries must not be negative, got {max_retries}"
            )));
        }

        let id = new_v7();
        let job = Job::new(id, spec, priority, max_retries, correlation_id);
        {
            let mut state = self.lock();
            let ready_at = job.ready_at();
            state.jobs.insert(id, job);
            state.admit(id, priority, ready_at);
        }

        info!(
            subsystem = "jobs",
            component = "queue",
            op = "enqueue",
            job_id = %id,
            priority,
            max_retries,
            "Job enqueued"
        );

        self.persist(id).await;
        self.notify.notify_one();
        Ok(id)
    }

    /// Request cancellation.
    ///
    /// Pending jobs are cancelled immediately. Running jobs are flagged and
    /// their token is cancelled; the worker finishes the transition at its
    /// next stage boundary. Returns false for unknown or terminal jobs and
    /// for a Running job already flagged.
    pub async fn cancel(&self, id: JobId) -> bool {
        let cancelled_now = {
            let mut state = self.lock();
            let Some(status) = state.jobs.get(&id).map(|j| j.status) else {
                return false;
            };
            match status {
                JobStatus::Pending => {
                    if let Some(job) = state.jobs.get_mut(&id) {
                        job.progress_message = Some("Cancelled".to_string());
                    }
                    state.finish(&id, JobStatus::Cancelled);
                    true
                }
                JobStatus::Running => {
                    let Some(job) = state.jobs.get_mut(&id) else {
                        return false;
                    };
                    if job.cancel_requested {
                        return false;
                    }
                    job.cancel_requested = true;
                    if let Some(token) = state.tokens.get(&id) {
                        token.cancel();
                    }
                    false
                }
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => return false,
            }
        };

        if cancelled_now {
            info!(
                subsystem = "jobs",
                component = "queue",
                op = "cancel",
                job_id = %id,
                "Pending job cancelled"
            );
            self.persist(id).await;
            self.evict_history().await;
        } else {
            info!(
                subsystem = "jobs",
                component = "queue",
                op = "cancel",
                job_id = %id,
                "Cancellation requested for running job"
            );
            self.persist(id).await;
        }
        true
    }

    /// Snapshot of one job.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Like [`get`](Self::get), failing with [`Error::JobNotFound`] for an
    /// unknown id.
    pub fn require(&self, id: JobId) -> Result<Job> {
        self.get(id).ok_or(Error::JobNotFound(id))
    }

    /// Snapshot of up to `limit` jobs.
    ///
    /// Without a filter, and for terminal or Running filters, jobs are ordered
    /// by EnqueuedAt descending. A Pending filter lists jobs in dispatch order.
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        let state = self.lock();
        if status == Some(JobStatus::Pending) {
            return state
                .ready
                .iter()
                .filter_map(|(_, _, _, id)| state.jobs.get(id))
                .take(limit)
                .cloned()
                .collect();
        }

        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .collect();
        jobs.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at).then(b.id.cmp(&a.id)));
        jobs.into_iter().take(limit).cloned().collect()
    }

    /// Counts per status and average wait/run times.
    pub fn statistics(&self) -> QueueStats {
        summarize(self.lock().jobs.values())
    }

    pub fn running_count(&self) -> usize {
        self.lock().running()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().ready.len()
    }

    // =========================================================================
    // Worker operations
    // =========================================================================

    /// Atomically claim the highest-priority ready job for `worker_id`.
    pub async fn claim_next(&self, worker_id: &str) -> Option<ClaimedJob> {
        let claimed = {
            let mut state = self.lock();
            let now = Utc::now();
            let key = state
                .ready
                .iter()
                .find(|(_, _, _, id)| state.jobs.get(id).is_some_and(|j| j.is_ready(now)))
                .copied()?;
            let id = key.3;
            state.withdraw(&id);

            let token = CancellationToken::new();
            state.tokens.insert(id, token.clone());

            let job = state.jobs.get_mut(&id)?;
            job.status = JobStatus::Running;
            job.worker_id = Some(worker_id.to_string());
            job.started_at.get_or_insert(now);
            job.next_retry_at = None;
            job.progress_percent = 0;
            job.current_stage = None;
            job.progress_message = None;
            job.cancel_requested = false;

            ClaimedJob {
                job: job.clone(),
                cancel: token,
            }
        };

        debug!(
            subsystem = "jobs",
            component = "queue",
            op = "claim",
            job_id = %claimed.job.id,
            worker_id,
            priority = claimed.job.priority,
            retry_count = claimed.job.retry_count,
            "Job claimed"
        );

        self.persist(claimed.job.id).await;
        Some(claimed)
    }

    /// Record stage progress on a running job.
    ///
    /// `stage_percent` is mapped into the stage's band of overall progress.
    /// Returns false when the job is not running.
    pub fn update_progress(
        &self,
        id: JobId,
        stage: Stage,
        stage_percent: i32,
        message: Option<&str>,
    ) -> bool {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return false;
        };
        if job.status != JobStatus::Running {
            return false;
        }
        job.current_stage = Some(stage);
        job.progress_percent = stage.overall_percent(stage_percent);
        job.progress_message = Some(message.unwrap_or(stage.label()).to_string());

        trace!(
            job_id = %id,
            stage = stage.as_str(),
            percent = job.progress_percent,
            "Job progress"
        );
        true
    }

    /// Finish a running job successfully.
    ///
    /// A job whose cancellation was requested ends as Cancelled instead.
    /// Returns the resulting status, or `None` when the job was not running.
    pub async fn complete(&self, id: JobId, output_path: Option<String>) -> Option<JobStatus> {
        let status = {
            let mut state = self.lock();
            let job = state.jobs.get_mut(&id)?;
            if job.status != JobStatus::Running {
                return None;
            }
            if job.cancel_requested {
                job.progress_message = Some("Cancelled".to_string());
                state.finish(&id, JobStatus::Cancelled);
                JobStatus::Cancelled
            } else {
                job.progress_percent = 100;
                job.progress_message = Some("Completed".to_string());
                job.output_path = output_path;
                job.last_error = None;
                state.finish(&id, JobStatus::Completed);
                JobStatus::Completed
            }
        };

        self.persist(id).await;
        self.evict_history().await;
        Some(status)
    }

    /// Record a failed attempt on a running job.
    ///
    /// Retryable failures with retries left send the job back to Pending
    /// with a backoff; anything else is terminal. Returns `None` when the
    /// job was not running.
    pub async fn fail(
        &self,
        id: JobId,
        error: &str,
        retryable: bool,
        backoff: &BackoffPolicy,
    ) -> Option<FailureOutcome> {
        let outcome = {
            let mut state = self.lock();
            let job = state.jobs.get_mut(&id)?;
            if job.status != JobStatus::Running {
                return None;
            }
            job.last_error = Some(error.to_string());

            if job.cancel_requested {
                job.progress_message = Some("Cancelled".to_string());
                state.finish(&id, JobStatus::Cancelled);
                FailureOutcome::Cancelled
            } else if retryable && job.retry_count < job.max_retries {
                job.retry_count += 1;
                let delay = backoff.delay(job.retry_count);
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                job.status = JobStatus::Pending;
                job.next_retry_at = Some(next_retry_at);
                job.worker_id = None;
                job.progress_message = Some(format!("Retrying in {}s", delay.as_secs()));
                let (retry_count, priority) = (job.retry_count, job.priority);
                state.tokens.remove(&id);
                state.admit(id, priority, next_retry_at);
                FailureOutcome::Retrying {
                    retry_count,
                    delay,
                    next_retry_at,
                }
            } else {
                job.progress_message = Some("Failed".to_string());
                state.finish(&id, JobStatus::Failed);
                FailureOutcome::Failed
            }
        };

        self.persist(id).await;
        match outcome {
            FailureOutcome::Retrying { .. } => self.notify.notify_one(),
            FailureOutcome::Failed | FailureOutcome::Cancelled => {
                self.evict_history().await;
            }
        }
        Some(outcome)
    }

    /// Finish a running job as Cancelled after the worker observed the flag.
    pub async fn mark_cancelled(&self, id: JobId) -> bool {
        {
            let mut state = self.lock();
            let Some(job) = state.jobs.get_mut(&id) else {
                return false;
            };
            if job.status != JobStatus::Running {
                return false;
            }
            job.cancel_requested = true;
            job.progress_message = Some("Cancelled".to_string());
            state.finish(&id, JobStatus::Cancelled);
        }
        self.persist(id).await;
        self.evict_history().await;
        true
    }

    /// Cancellation token of a running job.
    pub fn cancellation_token(&self, id: JobId) -> Option<CancellationToken> {
        self.lock().tokens.get(&id).cloned()
    }

    /// Earliest backoff expiry among pending jobs not yet ready.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        let state = self.lock();
        let now = Utc::now();
        state
            .ready_keys
            .keys()
            .filter_map(|id| state.jobs.get(id))
            .filter_map(|j| j.next_retry_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Wait until a job may have become claimable.
    pub async fn wait_for_job(&self) {
        self.notify.notified().await;
    }

    // =========================================================================
    // Persistence and history
    // =========================================================================

    /// Reload jobs from the store after a restart.
    ///
    /// Pending and Running jobs are requeued as Pending (a Running job that
    /// had been flagged for cancellation becomes Cancelled); terminal jobs
    /// are kept as history. Returns the number of requeued jobs.
    pub async fn restore(&self) -> Result<usize> {
        let loaded = self.store.load_all().await?;
        let total = loaded.len();
        let (touched, requeued) = self.admit_loaded(loaded, true);

        for id in &touched {
            self.persist(*id).await;
        }
        self.evict_history().await;

        info!(
            subsystem = "jobs",
            component = "queue",
            op = "restore",
            loaded = total,
            requeued,
            "Restored job snapshot"
        );
        if requeued > 0 {
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    /// Insert loaded records; returns the ids whose state changed and the
    /// number of records admitted as Pending.
    fn admit_loaded(&self, mut jobs: Vec<Job>, requeue: bool) -> (Vec<JobId>, usize) {
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));

        let mut touched = Vec::new();
        let mut admitted = 0;
        let mut state = self.lock();
        for mut job in jobs {
            if state.jobs.contains_key(&job.id) {
                continue;
            }
            let id = job.id;

            if requeue && job.status == JobStatus::Running {
                if job.cancel_requested {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    job.progress_message = Some("Cancelled".to_string());
                } else {
                    warn!(
                        subsystem = "jobs",
                        component = "queue",
                        job_id = %id,
                        "Requeueing job that was running at shutdown"
                    );
                    job.status = JobStatus::Pending;
                    job.progress_percent = 0;
                    job.current_stage = None;
                    job.progress_message = None;
                }
                job.worker_id = None;
                touched.push(id);
            }

            let admit = job.status == JobStatus::Pending;
            let (priority, ready_at) = (job.priority, job.ready_at());
            state.jobs.insert(id, job);
            if admit {
                state.admit(id, priority, ready_at);
                admitted += 1;
            }
        }
        (touched, admitted)
    }

    /// Write every job to the store.
    pub async fn snapshot(&self) -> Result<usize> {
        let _guard = self.persist_lock.lock().await;
        let jobs: Vec<Job> = self.lock().jobs.values().cloned().collect();
        for job in &jobs {
            self.store.save(job).await?;
        }
        debug!(
            subsystem = "jobs",
            component = "queue",
            op = "snapshot",
            jobs = jobs.len(),
            "Queue snapshot written"
        );
        Ok(jobs.len())
    }

    async fn persist(&self, id: JobId) {
        let _guard = self.persist_lock.lock().await;
        let Some(job) = self.get(id) else {
            return;
        };
        if let Err(e) = self.store.save(&job).await {
            error!(
                subsystem = "jobs",
                component = "queue",
                op = "persist",
                job_id = %id,
                error = %e,
                "Failed to snapshot job"
            );
        }
    }

    /// Drop the oldest terminal jobs beyond the retention count.
    async fn evict_history(&self) -> Vec<JobId> {
        let evicted: Vec<JobId> = {
            let mut state = self.lock();
            let mut terminal: Vec<(DateTime<Utc>, JobId)> = state
                .jobs
                .values()
                .filter(|j| j.status.is_terminal())
                .map(|j| (j.completed_at.unwrap_or(j.enqueued_at), j.id))
                .collect();
            if terminal.len() <= self.retention {
                return Vec::new();
            }
            terminal.sort();
            let excess = terminal.len() - self.retention;
            let ids: Vec<JobId> = terminal.into_iter().take(excess).map(|(_, id)| id).collect();
            for id in &ids {
                state.jobs.remove(id);
                state.tokens.remove(id);
            }
            ids
        };

        debug!(
            subsystem = "jobs",
            component = "queue",
            op = "evict",
            evicted = evicted.len(),
            "Evicted job history"
        );

        let _guard = self.persist_lock.lock().await;
        if let Err(e) = self.store.remove(&evicted).await {
            error!(
                subsystem = "jobs",
                component = "queue",
                op = "evict",
                error = %e,
                "Failed to remove evicted jobs from store"
            );
        }
        evicted
    }
}

/// Counts and averages over a set of jobs.
///
/// Wait time is measured from enqueue to first start; duration from first
/// start to the terminal transition.
pub fn summarize<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> QueueStats {
    let mut stats = QueueStats::default();
    let (mut wait_sum, mut wait_n) = (0.0, 0u32);
    let (mut run_sum, mut run_n) = (0.0, 0u32);

    for job in jobs {
        match job.status {
            JobStatus::Pending => stats.pending += 1,
            JobStatus::Running => stats.running += 1,
            JobStatus::Completed => stats.completed += 1,
            JobStatus::Failed => stats.failed += 1,
            JobStatus::Cancelled => stats.cancelled += 1,
        }
        if let Some(wait) = job.wait_time() {
            wait_sum += seconds(wait);
            wait_n += 1;
        }
        if let Some(run) = job.run_time() {
            run_sum += seconds(run);
            run_n += 1;
        }
    }

    stats.avg_wait_secs = (wait_n > 0).then(|| wait_sum / f64::from(wait_n));
    stats.avg_duration_secs = (run_n > 0).then(|| run_sum / f64::from(run_n));
    stats
}

fn seconds(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}
