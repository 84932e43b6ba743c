//! Stage executor seam.
//!
//! The generation work itself (script writing, synthesis, visuals,
//! rendering) lives outside this crate behind [`StageExecutor`]. The worker
//! calls it once per stage with a [`StageContext`] carrying the job, the
//! provider resolver, the cancellation token, and a progress callback.
//!
//! Provider calls go through [`StageContext::call`]. The context remembers
//! every resolution whose call has not reported yet, and when the stage
//! timeout drops the executor the worker reports those as failed attempts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use reel_core::{Error, Job, JobSpec, Result, Stage};
use reel_providers::{ProviderKind, ProviderRequest, ProviderResolver, Resolution};

/// Progress callback type for stage executors: stage-local percent and an
/// optional label.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Provider kind a stage calls out to, if any.
pub fn provider_kind(stage: Stage) -> Option<ProviderKind> {
    match stage {
        Stage::Script => Some(ProviderKind::Llm),
        Stage::Voice => Some(ProviderKind::Tts),
        Stage::Visuals => Some(ProviderKind::Image),
        Stage::Render => None,
    }
}

/// Resolutions handed out by a [`StageContext`] whose calls have not reported.
pub type InFlightCalls = Arc<Mutex<Vec<Resolution>>>;

/// Context provided to a stage executor.
pub struct StageContext {
    /// The job being processed, as claimed.
    pub job: Job,
    /// The stage to execute.
    pub stage: Stage,
    resolver: Arc<ProviderResolver>,
    cancel: CancellationToken,
    in_flight: InFlightCalls,
    previous: HashMap<Stage, JsonValue>,
    progress_callback: Option<ProgressCallback>,
}

impl StageContext {
    pub fn new(
        job: Job,
        stage: Stage,
        resolver: Arc<ProviderResolver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            stage,
            resolver,
            cancel,
            in_flight: Arc::default(),
            previous: HashMap::new(),
            progress_callback: None,
        }
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Outputs of the stages that already ran for this attempt.
    pub fn with_previous(mut self, previous: HashMap<Stage, JsonValue>) -> Self {
        self.previous = previous;
        self
    }

    /// Report stage-local progress (0-100).
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent.clamp(0, 100), message);
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.job.spec
    }

    /// The [`JobSpec`] section this stage consumes.
    pub fn stage_spec(&self) -> &JsonValue {
        match self.stage {
            Stage::Script => &self.job.spec.brief,
            Stage::Voice => &self.job.spec.voice,
            Stage::Visuals => &self.job.spec.plan,
            Stage::Render => &self.job.spec.render,
        }
    }

    /// Output of an earlier stage in this attempt.
    pub fn output_of(&self, stage: Stage) -> Option<&JsonValue> {
        self.previous.get(&stage)
    }

    pub fn resolver(&self) -> &Arc<ProviderResolver> {
        &self.resolver
    }

    /// Resolve a provider for this stage's provider kind.
    ///
    /// `request` is usually read from the stage spec's `"provider"` field.
    /// The resolution counts as in flight until [`call`](Self::call) reports it.
    pub fn resolve_provider(&self, request: &ProviderRequest) -> Result<Resolution> {
        let kind = provider_kind(self.stage).ok_or_else(|| {
            Error::InvalidInput(format!("stage {} does not use a provider", self.stage))
        })?;
        let resolution = self.resolver.resolve_kind(request, kind)?;
        self.lock_in_flight().push(resolution.clone());
        Ok(resolution)
    }

    /// Run a provider call for `resolution` under the provider timeout and
    /// report its outcome.
    pub async fn call<T, F>(&self, resolution: &Resolution, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = self.resolver.call(resolution, call).await;
        let mut in_flight = self.lock_in_flight();
        if let Some(pos) = in_flight.iter().position(|r| r == resolution) {
            in_flight.remove(pos);
        }
        result
    }

    /// Shared view of the resolutions still waiting on a reported call.
    pub fn in_flight(&self) -> InFlightCalls {
        self.in_flight.clone()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Vec<Resolution>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provider request named in the stage spec (`"provider"`), or Auto.
    pub fn requested_provider(&self) -> ProviderRequest {
        self.stage_spec()
            .get("provider")
            .and_then(JsonValue::as_str)
            .map(ProviderRequest::parse)
            .unwrap_or(ProviderRequest::Auto)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token to forward into executors that can abort mid-call.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Result of executing one stage.
#[derive(Debug)]
pub enum StageResult {
    /// Stage finished, with optional output for later stages. The render
    /// stage reports the final artifact under `"output_path"`.
    Success(Option<JsonValue>),
    /// Stage failed; the job fails without retry.
    Failed(String),
    /// Stage failed transiently; the job may be retried.
    Retry(String),
    /// Stage observed cancellation and stopped.
    Cancelled,
}

impl StageResult {
    /// Classify an error from a stage's own code.
    pub fn from_error(error: Error) -> Self {
        match error {
            Error::Cancelled => StageResult::Cancelled,
            e if e.is_retryable() => StageResult::Retry(e.to_string()),
            e => StageResult::Failed(e.to_string()),
        }
    }
}

impl From<Result<Option<JsonValue>>> for StageResult {
    fn from(result: Result<Option<JsonValue>>) -> Self {
        match result {
            Ok(output) => StageResult::Success(output),
            Err(e) => StageResult::from_error(e),
        }
    }
}

/// Trait for stage executors.
///
/// Executors resolve providers with [`StageContext::resolve_provider`] and
/// make the external call with [`StageContext::call`].
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Execute one stage of a job.
    async fn execute(&self, ctx: StageContext) -> StageResult;
}

/// No-op executor for testing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpExecutor;

impl NoOpExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageExecutor for NoOpExecutor {
    async fn execute(&self, ctx: StageContext) -> StageResult {
        ctx.report_progress(50, Some("Processing..."));
        ctx.report_progress(100, Some("Done"));
        StageResult::Success(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_providers::{
        BreakerSettings, CircuitBreaker, EnvCredentials, ProviderHealthTracker, ProviderSettings,
    };
    use serde_json::json;

    fn resolver() -> Arc<ProviderResolver> {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerSettings::default(),
            Arc::new(ProviderHealthTracker::default()),
        ));
        Arc::new(ProviderResolver::new(
            breaker,
            Arc::new(EnvCredentials::local_only()),
            ProviderSettings::default(),
        ))
    }

    fn job() -> Job {
        let spec = JobSpec {
            brief: json!({ "topic": "tides", "provider": "Ollama" }),
            plan: json!({ "scenes": 3 }),
            voice: json!({ "provider": "pro" }),
            render: json!({ "format": "mp4" }),
        };
        Job::new(reel_core::new_v7(), spec, 10, 3, None)
    }

    fn ctx(stage: Stage) -> StageContext {
        StageContext::new(job(), stage, resolver(), CancellationToken::new())
    }

    #[test]
    fn test_stage_spec_sections() {
        assert_eq!(ctx(Stage::Script).stage_spec()["topic"], "tides");
        assert_eq!(ctx(Stage::Visuals).stage_spec()["scenes"], 3);
        assert_eq!(ctx(Stage::Render).stage_spec()["format"], "mp4");
    }

    #[test]
    fn test_requested_provider() {
        assert_eq!(
            ctx(Stage::Script).requested_provider(),
            ProviderRequest::Provider("ollama".into())
        );
        assert_eq!(
            ctx(Stage::Voice).requested_provider(),
            ProviderRequest::Tier("pro".into())
        );
        assert_eq!(ctx(Stage::Visuals).requested_provider(), ProviderRequest::Auto);
    }

    #[tokio::test]
    async fn test_resolve_provider_uses_stage_chain() {
        let c = ctx(Stage::Voice);
        let res = c.resolve_provider(&c.requested_provider()).unwrap();
        assert_eq!(res.provider, "piper");

        let render = ctx(Stage::Render);
        assert!(matches!(
            render.resolve_provider(&ProviderRequest::Auto),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_progress_callback_clamps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let c = ctx(Stage::Script).with_progress_callback(move |pct, msg| {
            sink.lock().unwrap().push((pct, msg.map(String::from)));
        });
        c.report_progress(140, Some("over"));
        c.report_progress(-5, None);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(100, Some("over".to_string())), (0, None)]
        );
    }

    #[tokio::test]
    async fn test_call_settles_in_flight_resolution() {
        let c = ctx(Stage::Script);
        let res = c.resolve_provider(&c.requested_provider()).unwrap();
        assert_eq!(res.provider, "ollama");
        assert_eq!(*c.in_flight().lock().unwrap(), vec![res.clone()]);

        let text = c
            .call(&res, async { Ok::<_, Error>("script".to_string()) })
            .await
            .unwrap();
        assert_eq!(text, "script");
        assert!(c.in_flight().lock().unwrap().is_empty());
        assert_eq!(c.resolver().get_health("ollama").unwrap().total_attempts, 1);
    }

    #[test]
    fn test_previous_outputs() {
        let mut previous = HashMap::new();
        previous.insert(Stage::Script, json!({ "text": "hello" }));
        let c = ctx(Stage::Voice).with_previous(previous);
        assert_eq!(c.output_of(Stage::Script).unwrap()["text"], "hello");
        assert!(c.output_of(Stage::Visuals).is_none());
    }

    #[test]
    fn test_cancellation_visible() {
        let token = CancellationToken::new();
        let c = StageContext::new(job(), Stage::Script, resolver(), token.clone());
        assert!(!c.is_cancelled());
        token.cancel();
        assert!(c.is_cancelled());
    }

    #[test]
    fn test_result_from_error() {
        assert!(matches!(
            StageResult::from_error(Error::transient("503")),
            StageResult::Retry(_)
        ));
        assert!(matches!(
            StageResult::from_error(Error::permanent("bad json")),
            StageResult::Failed(_)
        ));
        assert!(matches!(
            StageResult::from_error(Error::NoProviderAvailable { tried: vec![] }),
            StageResult::Failed(_)
        ));
        assert!(matches!(
            StageResult::from_error(Error::Cancelled),
            StageResult::Cancelled
        ));
        assert!(matches!(
            StageResult::from(Ok(Some(json!(1)))),
            StageResult::Success(Some(_))
        ));
    }

    #[tokio::test]
    async fn test_noop_executor() {
        let result = NoOpExecutor::new().execute(ctx(Stage::Render)).await;
        assert!(matches!(result, StageResult::Success(None)));
    }
}
