//! Per-job execution: runs one claimed job through the stage pipeline.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

use reel_core::{logging, JobId, JobStatus, Stage};
use reel_providers::ProviderResolver;

use crate::backoff::BackoffPolicy;
use crate::queue::{ClaimedJob, FailureOutcome, JobQueue};
use crate::stage::{StageContext, StageExecutor, StageResult};
use crate::supervisor::SupervisorEvent;

/// Everything a worker needs to execute a job, cheap to clone into a task.
#[derive(Clone)]
pub struct JobRunner {
    queue: Arc<JobQueue>,
    executor: Arc<dyn StageExecutor>,
    resolver: Arc<ProviderResolver>,
    backoff: BackoffPolicy,
    stage_timeout: Duration,
    event_tx: broadcast::Sender<SupervisorEvent>,
}

impl JobRunner {
    pub fn new(
        queue: Arc<JobQueue>,
        executor: Arc<dyn StageExecutor>,
        resolver: Arc<ProviderResolver>,
        backoff: BackoffPolicy,
        stage_timeout: Duration,
        event_tx: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            queue,
            executor,
            resolver,
            backoff,
            stage_timeout,
            event_tx,
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Execute a claimed job to its next resting state.
    ///
    /// Returns the job's status afterwards: Completed, Failed, Cancelled, or
    /// Pending when a retry was scheduled.
    #[instrument(
        name = "job",
        skip_all,
        fields(
            job_id = %claimed.job.id,
            worker_id = %worker_id,
            correlation_id = tracing::field::Empty,
            stage = tracing::field::Empty,
        )
    )]
    pub async fn run(&self, claimed: ClaimedJob, worker_id: &str) -> JobStatus {
        let ClaimedJob { job, cancel } = claimed;
        let start = Instant::now();
        let job_id = job.id;

        if let Some(ref correlation_id) = job.correlation_id {
            Span::current().record(logging::CORRELATION_ID, correlation_id.as_str());
        }

        info!(
            priority = job.priority,
            retry_count = job.retry_count,
            "Processing job"
        );
        self.emit(SupervisorEvent::JobStarted {
            job_id,
            worker_id: worker_id.to_string(),
            attempt: job.retry_count + 1,
        });

        let mut outputs: HashMap<Stage, JsonValue> = HashMap::new();

        for stage in Stage::ALL {
            if cancel.is_cancelled() {
                return self.cancelled(job_id, start).await;
            }

            Span::current().record(logging::STAGE, stage.as_str());
            self.queue.update_progress(job_id, stage, 0, None);
            self.emit(SupervisorEvent::JobProgress {
                job_id,
                stage,
                percent: stage.overall_percent(0),
                message: Some(stage.label().to_string()),
            });

            let ctx = self.context(job.clone(), stage, cancel.clone(), outputs.clone());
            let stage_start = Instant::now();
            let result = self.execute_stage(stage, ctx).await;

            match result {
                StageResult::Success(output) => {
                    debug!(
                        duration_ms = stage_start.elapsed().as_millis() as u64,
                        "Stage completed"
                    );
                    if let Some(output) = output {
                        outputs.insert(stage, output);
                    }
                    self.queue.update_progress(job_id, stage, 100, None);
                }
                StageResult::Cancelled => return self.cancelled(job_id, start).await,
                StageResult::Failed(error) => {
                    return self.failed(job_id, stage, &error, false, start).await
                }
                StageResult::Retry(error) => {
                    return self.failed(job_id, stage, &error, true, start).await
                }
            }
        }

        if cancel.is_cancelled() {
            return self.cancelled(job_id, start).await;
        }

        let output_path = outputs
            .get(&Stage::Render)
            .and_then(|v| v.get("output_path"))
            .and_then(JsonValue::as_str)
            .map(String::from);

        match self.queue.complete(job_id, output_path.clone()).await {
            Some(JobStatus::Completed) => {
                info!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    output_path = output_path.as_deref().unwrap_or("(none)"),
                    "Job completed successfully"
                );
                self.emit(SupervisorEvent::JobCompleted {
                    job_id,
                    output_path,
                });
                JobStatus::Completed
            }
            Some(JobStatus::Cancelled) => {
                info!("Job cancelled before completion");
                self.emit(SupervisorEvent::JobCancelled { job_id });
                JobStatus::Cancelled
            }
            _ => self.current_status(job_id),
        }
    }

    fn context(
        &self,
        job: reel_core::Job,
        stage: Stage,
        cancel: CancellationToken,
        previous: HashMap<Stage, JsonValue>,
    ) -> StageContext {
        let job_id = job.id;
        let queue = self.queue.clone();
        let event_tx = self.event_tx.clone();

        StageContext::new(job, stage, self.resolver.clone(), cancel)
            .with_previous(previous)
            .with_progress_callback(move |percent, message| {
                if queue.update_progress(job_id, stage, percent, message) {
                    let _ = event_tx.send(SupervisorEvent::JobProgress {
                        job_id,
                        stage,
                        percent: stage.overall_percent(percent),
                        message: message.map(String::from),
                    });
                }
            })
    }

    /// Run one stage under the stage timeout, turning a panic into a failure.
    ///
    /// Provider calls the timeout cut short are reported as failed attempts.
    async fn execute_stage(&self, stage: Stage, ctx: StageContext) -> StageResult {
        let in_flight = ctx.in_flight();
        let call = AssertUnwindSafe(self.executor.execute(ctx)).catch_unwind();
        match tokio::time::timeout(self.stage_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!("Stage executor panicked");
                StageResult::Failed(format!("stage {stage} panicked"))
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.stage_timeout.as_secs(),
                    "Stage exceeded timeout"
                );
                let dropped: Vec<_> = in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain(..)
                    .collect();
                for resolution in dropped {
                    warn!(
                        provider = %resolution.provider,
                        "Provider call abandoned by stage timeout"
                    );
                    self.resolver.report(&resolution, false, self.stage_timeout);
                }
                StageResult::Retry(format!(
                    "stage {stage} exceeded timeout of {}s",
                    self.stage_timeout.as_secs()
                ))
            }
        }
    }

    async fn failed(
        &self,
        job_id: JobId,
        stage: Stage,
        error: &str,
        retryable: bool,
        start: Instant,
    ) -> JobStatus {
        let message = format!("{stage}: {error}");
        let duration_ms = start.elapsed().as_millis() as u64;

        match self
            .queue
            .fail(job_id, &message, retryable, &self.backoff)
            .await
        {
            Some(FailureOutcome::Retrying {
                retry_count, delay, ..
            }) => {
                warn!(
                    retry_count,
                    backoff_ms = delay.as_millis() as u64,
                    duration_ms,
                    error = %message,
                    "Stage failed, job will be retried"
                );
                self.emit(SupervisorEvent::JobRetrying {
                    job_id,
                    retry_count,
                    delay,
                    error: message,
                });
                JobStatus::Pending
            }
            Some(FailureOutcome::Failed) => {
                warn!(duration_ms, retryable, error = %message, "Job failed");
                self.emit(SupervisorEvent::JobFailed {
                    job_id,
                    error: message,
                });
                JobStatus::Failed
            }
            Some(FailureOutcome::Cancelled) => {
                info!(error = %message, "Job cancelled after stage failure");
                self.emit(SupervisorEvent::JobCancelled { job_id });
                JobStatus::Cancelled
            }
            None => self.current_status(job_id),
        }
    }

    async fn cancelled(&self, job_id: JobId, start: Instant) -> JobStatus {
        if self.queue.mark_cancelled(job_id).await {
            info!(
                duration_ms = start.elapsed().as_millis() as u64,
                "Job cancelled at stage boundary"
            );
            self.emit(SupervisorEvent::JobCancelled { job_id });
            JobStatus::Cancelled
        } else {
            self.current_status(job_id)
        }
    }

    fn current_status(&self, job_id: JobId) -> JobStatus {
        let status = self.queue.get(job_id).map(|j| j.status);
        warn!(?status, "Job changed state outside its worker");
        status.unwrap_or(JobStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reel_core::{Error, JobSpec};
    use reel_providers::{
        BreakerSettings, CircuitBreaker, EnvCredentials, ProviderHealthTracker, ProviderSettings,
    };
    use serde_json::json;

    use crate::store::MemoryJobStore;

    fn resolver() -> Arc<ProviderResolver> {
        Arc::new(ProviderResolver::new(
            Arc::new(CircuitBreaker::new(
                BreakerSettings::default(),
                Arc::new(ProviderHealthTracker::default()),
            )),
            Arc::new(EnvCredentials::local_only()),
            ProviderSettings::default(),
        ))
    }

    fn spec() -> JobSpec {
        JobSpec {
            brief: json!({ "topic": "volcanoes" }),
            plan: json!({}),
            voice: json!({}),
            render: json!({}),
        }
    }

    fn runner(
        queue: Arc<JobQueue>,
        executor: impl StageExecutor + 'static,
    ) -> (JobRunner, broadcast::Receiver<SupervisorEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let runner = JobRunner::new(
            queue,
            Arc::new(executor),
            resolver(),
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(1)),
            Duration::from_secs(5),
            tx,
        );
        (runner, rx)
    }

    async fn claimed(queue: &JobQueue) -> ClaimedJob {
        queue.enqueue(spec(), 10, Some("corr-1".into())).await.unwrap();
        queue.claim_next("worker-1").await.unwrap()
    }

    struct Rendering;

    #[async_trait]
    impl StageExecutor for Rendering {
        async fn execute(&self, ctx: StageContext) -> StageResult {
            ctx.report_progress(50, None);
            match ctx.stage {
                Stage::Script => StageResult::Success(Some(json!({ "text": "hi" }))),
                Stage::Render => {
                    let script = ctx.output_of(Stage::Script).cloned();
                    assert_eq!(script, Some(json!({ "text": "hi" })));
                    StageResult::Success(Some(json!({ "output_path": "out/v.mp4" })))
                }
                _ => StageResult::Success(None),
            }
        }
    }

    struct FailAt(Stage, bool);

    #[async_trait]
    impl StageExecutor for FailAt {
        async fn execute(&self, ctx: StageContext) -> StageResult {
            if ctx.stage == self.0 {
                StageResult::from_error(if self.1 {
                    Error::transient("503 from provider")
                } else {
                    Error::permanent("malformed script")
                })
            } else {
                StageResult::Success(None)
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl StageExecutor for Panics {
        async fn execute(&self, _ctx: StageContext) -> StageResult {
            panic!("executor bug");
        }
    }

    struct Sleepy;

    /// Resolves the stage's provider, then hangs inside the call.
    struct HangsInCall;

    #[async_trait]
    impl StageExecutor for HangsInCall {
        async fn execute(&self, ctx: StageContext) -> StageResult {
            let resolution = match ctx.resolve_provider(&ctx.requested_provider()) {
                Ok(resolution) => resolution,
                Err(e) => return StageResult::from_error(e),
            };
            let result = ctx
                .call(&resolution, async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<Option<JsonValue>, Error>(None)
                })
                .await;
            StageResult::from(result)
        }
    }

    #[async_trait]
    impl StageExecutor for Sleepy {
        async fn execute(&self, _ctx: StageContext) -> StageResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StageResult::Success(None)
        }
    }

    #[tokio::test]
    async fn test_successful_run_sets_output_path() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new())));
        let (runner, mut rx) = runner(queue.clone(), Rendering);
        let job = claimed(&queue).await;
        let id = job.job.id;

        assert_eq!(runner.run(job, "worker-1").await, JobStatus::Completed);
        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_path.as_deref(), Some("out/v.mp4"));
        assert_eq!(job.progress_percent, 100);

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SupervisorEvent::JobStarted { attempt, .. } => {
                    assert_eq!(attempt, 1);
                    saw_started = true;
                }
                SupervisorEvent::JobCompleted { output_path, .. } => {
                    assert_eq!(output_path.as_deref(), Some("out/v.mp4"));
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_completed);
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_retry() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new())));
        let (runner, _rx) = runner(queue.clone(), FailAt(Stage::Voice, true));
        let job = claimed(&queue).await;
        let id = job.job.id;

        assert_eq!(runner.run(job, "worker-1").await, JobStatus::Pending);
        let job = queue.get(id).unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(job.last_error.unwrap().starts_with("voice:"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new())));
        let (runner, _rx) = runner(queue.clone(), FailAt(Stage::Script, false));
        let job = claimed(&queue).await;
        let id = job.job.id;

        assert_eq!(runner.run(job, "worker-1").await, JobStatus::Failed);
        let job = queue.get(id).unwrap();
        assert_eq!(job.retry_count, 0);
        assert!(job.last_error.unwrap().contains("malformed script"));
    }

    #[tokio::test]
    async fn test_cancel_before_run_is_observed() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new())));
        let (runner, _rx) = runner(queue.clone(), Rendering);
        let job = claimed(&queue).await;
        let id = job.job.id;
        assert!(queue.cancel(id).await);

        assert_eq!(runner.run(job, "worker-1").await, JobStatus::Cancelled);
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Cancelled);
        assert!(queue.get(id).unwrap().output_path.is_none());
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_job() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new())));
        let (runner, _rx) = runner(queue.clone(), Panics);
        let job = claimed(&queue).await;
        let id = job.job.id;

        assert_eq!(runner.run(job, "worker-1").await, JobStatus::Failed);
        assert!(queue.get(id).unwrap().last_error.unwrap().contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_is_retryable() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new())));
        let (runner, _rx) = runner(queue.clone(), Sleepy);
        let job = claimed(&queue).await;
        let id = job.job.id;

        assert_eq!(runner.run(job, "worker-1").await, JobStatus::Pending);
        let job = queue.get(id).unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(job.last_error.unwrap().contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_reports_provider_failure() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new())));
        let resolver = Arc::new(ProviderResolver::new(
            Arc::new(CircuitBreaker::new(
                BreakerSettings::default(),
                Arc::new(ProviderHealthTracker::default()),
            )),
            Arc::new(EnvCredentials::local_only()),
            ProviderSettings::default().with_timeout("ollama", Duration::from_secs(120)),
        ));
        let (tx, _rx) = broadcast::channel(64);
        let runner = JobRunner::new(
            queue.clone(),
            Arc::new(HangsInCall),
            resolver.clone(),
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(1)),
            Duration::from_secs(5),
            tx,
        );
        let job = claimed(&queue).await;

        assert_eq!(runner.run(job, "worker-1").await, JobStatus::Pending);
        let health = resolver.get_health("ollama").unwrap();
        assert_eq!(health.total_attempts, 1);
        assert_eq!(health.consecutive_failures, 1);
    }
}
