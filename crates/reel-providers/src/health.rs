//! Rolling per-provider health bookkeeping.
//!
//! Success rate and latency are exponentially weighted moving averages:
//! `avg = alpha * sample + (1 - alpha) * avg`, seeded by the first sample.
//! The newest attempt always moves the average, so the rate responds to
//! recent behaviour without a fixed window to size. Consecutive failures are
//! tracked separately and are what the circuit breaker acts on; the success
//! rate only feeds the resolver's degraded-provider preference.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, trace};

use reel_core::{defaults, ProviderHealthMetrics};

use crate::config::normalize_provider;

/// Tuning for the health averages and the degraded verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSettings {
    /// Weight of the newest sample, in (0, 1].
    pub alpha: f64,
    /// Success rate (percent) below which a provider is degraded.
    pub degraded_success_rate: f64,
    /// Attempts required before the degraded verdict applies.
    pub min_samples: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            alpha: defaults::HEALTH_EWMA_ALPHA,
            degraded_success_rate: defaults::HEALTH_DEGRADED_SUCCESS_RATE,
            min_samples: defaults::HEALTH_MIN_SAMPLES,
        }
    }
}

/// Per-provider success, failure and latency tracker.
pub struct ProviderHealthTracker {
    metrics: RwLock<HashMap<String, ProviderHealthMetrics>>,
    settings: HealthSettings,
}

impl Default for ProviderHealthTracker {
    fn default() -> Self {
        Self::new(HealthSettings::default())
    }
}

impl ProviderHealthTracker {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            settings: HealthSettings {
                alpha: settings.alpha.clamp(f64::EPSILON, 1.0),
                ..settings
            },
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Record the outcome of one provider attempt.
    ///
    /// Returns the updated metrics, or `None` when the provider name is blank
    /// (ignored).
    pub fn record_attempt(
        &self,
        provider: &str,
        success: bool,
        latency: Duration,
    ) -> Option<ProviderHealthMetrics> {
        let name = normalize_provider(provider)?;
        let latency_secs = latency.as_secs_f64();
        let sample = if success { 100.0 } else { 0.0 };
        let alpha = self.settings.alpha;

        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let entry = metrics
            .entry(name.clone())
            .or_insert_with(|| ProviderHealthMetrics {
                provider: name.clone(),
                success_rate_percent: sample,
                average_latency_secs: latency_secs,
                consecutive_failures: 0,
                total_attempts: 0,
                total_failures: 0,
                last_updated: Utc::now(),
            });

        if entry.total_attempts > 0 {
            entry.success_rate_percent =
                alpha * sample + (1.0 - alpha) * entry.success_rate_percent;
            entry.average_latency_secs =
                alpha * latency_secs + (1.0 - alpha) * entry.average_latency_secs;
        }

        entry.total_attempts += 1;
        if success {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
            entry.total_failures += 1;
        }
        entry.last_updated = Utc::now();

        trace!(
            provider = %name,
            success,
            latency_ms = latency.as_millis() as u64,
            success_rate = entry.success_rate_percent,
            consecutive_failures = entry.consecutive_failures,
            "Recorded provider attempt"
        );

        Some(entry.clone())
    }

    /// Current metrics, or `None` if the provider was never attempted.
    pub fn get_health(&self, provider: &str) -> Option<ProviderHealthMetrics> {
        let name = normalize_provider(provider)?;
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
    }

    /// Metrics for every attempted provider, sorted by name.
    pub fn all_health(&self) -> Vec<ProviderHealthMetrics> {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = metrics.values().cloned().collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Whether the provider has enough history and a poor success rate.
    pub fn is_degraded(&self, provider: &str) -> bool {
        self.get_health(provider).is_some_and(|m| {
            m.total_attempts >= self.settings.min_samples
                && m.success_rate_percent < self.settings.degraded_success_rate
        })
    }

    /// Forget a provider's history. Returns whether anything was removed.
    pub fn reset(&self, provider: &str) -> bool {
        let Some(name) = normalize_provider(provider) else {
            return false;
        };
        let removed = self
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name)
            .is_some();
        if removed {
            debug!(provider = %name, "Provider health reset");
        }
        removed
    }
}
