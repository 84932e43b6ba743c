//! Provider resolution over a fallback chain.
//!
//! Resolution and outcome reporting are separate calls: [`ProviderResolver::resolve`]
//! picks the provider for one attempt, and the caller reports how the attempt
//! went through [`ProviderResolver::report`] (or lets
//! [`ProviderResolver::call`] time and report it). A stage that fails before
//! touching the network therefore leaves health and breaker state alone.
//!
//! Each [`Resolution`] carries the breaker [`Admission`] it was granted, so an
//! attempt that reports long after the breaker moved on cannot stand in for
//! the half-open probe.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use reel_core::{
    CircuitBreakerStatus, Error, ProviderCredentials, ProviderHealthMetrics, Result,
};

use crate::breaker::{Admission, CircuitBreaker};
use crate::config::{normalize_provider, ProviderKind, ProviderSettings};

/// Tier names accepted in place of a concrete provider.
const TIER_NAMES: &[&str] = &["free", "balanced", "pro", "pro_if_available", "proifavailable"];

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ProviderRequest {
    /// No preference; walk the chain.
    Auto,
    /// A quality tier; walk the chain.
    Tier(String),
    /// A concrete provider, tried before the chain.
    Provider(String),
}

impl FromStr for ProviderRequest {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match normalize_provider(s) {
            None => Self::Auto,
            Some(name) if name == "auto" => Self::Auto,
            Some(name) if TIER_NAMES.contains(&name.as_str()) => Self::Tier(name),
            Some(name) => Self::Provider(name),
        })
    }
}

impl ProviderRequest {
    /// Parse a provider-or-tier string.
    pub fn parse(s: &str) -> Self {
        match s.parse() {
            Ok(request) => request,
            Err(never) => match never {},
        }
    }

    fn provider(&self) -> Option<&str> {
        match self {
            Self::Provider(name) => Some(name.as_str()),
            Self::Auto | Self::Tier(_) => None,
        }
    }
}

/// The provider chosen for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub provider: String,
    /// A candidate ahead of this one was skipped.
    pub is_fallback: bool,
    /// Chosen although its success rate marks it degraded.
    pub degraded: bool,
    /// Breaker grant for this attempt.
    pub admission: Admission,
}

/// Picks providers for attempts and routes outcomes to the breaker.
pub struct ProviderResolver {
    breaker: Arc<CircuitBreaker>,
    credentials: Arc<dyn ProviderCredentials>,
    settings: ProviderSettings,
}

impl ProviderResolver {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        credentials: Arc<dyn ProviderCredentials>,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            breaker,
            credentials,
            settings,
        }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Resolve against the configured fallback chain for a provider kind.
    pub fn resolve_kind(&self, request: &ProviderRequest, kind: ProviderKind) -> Result<Resolution> {
        self.resolve(request, self.settings.chain(kind))
    }

    /// Resolve using the resolver's own credential store.
    pub fn resolve<S: AsRef<str>>(
        &self,
        request: &ProviderRequest,
        chain: &[S],
    ) -> Result<Resolution> {
        self.resolve_with(request, chain, self.credentials.as_ref())
    }

    /// Walk the requested provider, then the chain, and return the first
    /// candidate that is configured, enabled, and admitted by its breaker.
    ///
    /// Degraded candidates are passed over while a healthy one remains and
    /// reconsidered in chain order afterwards.
    pub fn resolve_with<S: AsRef<str>>(
        &self,
        request: &ProviderRequest,
        chain: &[S],
        credentials: &dyn ProviderCredentials,
    ) -> Result<Resolution> {
        let mut candidates: Vec<String> = Vec::with_capacity(chain.len() + 1);
        for name in request
            .provider()
            .into_iter()
            .chain(chain.iter().map(|s| s.as_ref()))
            .filter_map(normalize_provider)
        {
            if !candidates.contains(&name) {
                candidates.push(name);
            }
        }

        let tracker = self.breaker.tracker();
        let mut degraded = Vec::new();

        for (idx, name) in candidates.iter().enumerate() {
            if self.settings.is_disabled(name) {
                debug!(provider = %name, "Skipping disabled provider");
                continue;
            }
            if !credentials.is_configured(name) {
                debug!(provider = %name, "Skipping unconfigured provider");
                continue;
            }
            if tracker.is_degraded(name) {
                debug!(provider = %name, "Deferring degraded provider");
                degraded.push(idx);
                continue;
            }
            let Some(admission) = self.breaker.admit(name) else {
                debug!(provider = %name, "Skipping provider with open circuit");
                continue;
            };
            return Ok(self.chosen(&candidates, idx, false, admission));
        }

        for idx in degraded {
            if let Some(admission) = self.breaker.admit(&candidates[idx]) {
                return Ok(self.chosen(&candidates, idx, true, admission));
            }
        }

        warn!(tried = ?candidates, "No provider available");
        Err(Error::NoProviderAvailable { tried: candidates })
    }

    fn chosen(
        &self,
        candidates: &[String],
        idx: usize,
        degraded: bool,
        admission: Admission,
    ) -> Resolution {
        let resolution = Resolution {
            provider: candidates[idx].clone(),
            is_fallback: idx > 0,
            degraded,
            admission,
        };
        if resolution.is_fallback {
            warn!(
                provider = %resolution.provider,
                preferred = %candidates[0],
                degraded,
                "Falling back to alternate provider"
            );
        } else {
            debug!(provider = %resolution.provider, "Resolved provider");
        }
        resolution
    }

    /// Report how the attempt for a resolution went.
    pub fn report(
        &self,
        resolution: &Resolution,
        success: bool,
        latency: Duration,
    ) -> Option<ProviderHealthMetrics> {
        self.breaker
            .report_admitted(&resolution.provider, &resolution.admission, success, latency)
    }

    /// Report an outcome for a provider without a resolution in hand, such as
    /// one replayed from another process.
    pub fn report_outcome(
        &self,
        provider: &str,
        success: bool,
        latency: Duration,
    ) -> Option<ProviderHealthMetrics> {
        self.breaker.report_outcome(provider, success, latency)
    }

    /// Timeout for one call to the provider.
    pub fn timeout_for(&self, provider: &str) -> Duration {
        self.settings.timeout_for(provider)
    }

    /// Run one external call under the provider's timeout and report its
    /// outcome. A timeout is reported as a failure and surfaces as a
    /// retryable error.
    pub async fn call<T, F>(&self, resolution: &Resolution, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let provider = resolution.provider.as_str();
        let timeout = self.timeout_for(provider);
        let start = Instant::now();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient(format!(
                "{provider} did not respond within {}s",
                timeout.as_secs_f64()
            ))),
        };
        let latency = start.elapsed();

        if let Err(ref e) = outcome {
            warn!(provider, error = %e, latency_ms = latency.as_millis() as u64, "Provider call failed");
        }
        self.report(resolution, outcome.is_ok(), latency);
        outcome
    }

    pub fn get_health(&self, provider: &str) -> Option<ProviderHealthMetrics> {
        self.breaker.tracker().get_health(provider)
    }

    pub fn get_status(&self, provider: &str) -> CircuitBreakerStatus {
        self.breaker.get_status(provider)
    }
}
