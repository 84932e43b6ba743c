//! Per-provider circuit breaker.
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     consecutive failures >= threshold
//! Open     → HalfOpen: cool-down elapsed (checked lazily in allow_attempt)
//! HalfOpen → Closed:   probe succeeds (cool-down resets to base)
//! HalfOpen → Open:     probe fails (cool-down doubles, capped)
//! ```
//!
//! HalfOpen admits a single probe. If the probe's outcome is never reported
//! (the caller resolved a provider but never reached the network), the probe
//! lease lapses after one cool-down and a new probe is admitted, so the
//! breaker cannot wedge and the endpoint sees at most one probe per window.
//!
//! Every grant carries an [`Admission`] stamped with the breaker's current
//! generation. The generation advances on each state change and on each new
//! probe lease, so an outcome reported through [`CircuitBreaker::report_admitted`]
//! for an attempt granted in an earlier generation only updates health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use reel_core::{defaults, CircuitBreakerStatus, CircuitState, ProviderHealthMetrics};

use crate::config::normalize_provider;
use crate::health::ProviderHealthTracker;

/// Breaker thresholds and cool-down timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Initial time spent Open before a probe.
    pub cooldown: Duration,
    /// Cap for the cool-down after repeated failed probes.
    pub max_cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::BREAKER_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(defaults::BREAKER_COOLDOWN_SECS),
            max_cooldown: Duration::from_secs(defaults::BREAKER_MAX_COOLDOWN_SECS),
        }
    }
}

impl BreakerSettings {
    /// Create settings from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `REEL_BREAKER_FAILURE_THRESHOLD` | `3` | Consecutive failures to open |
    /// | `REEL_BREAKER_COOLDOWN_SECS` | `60` | Open duration before a probe |
    /// | `REEL_BREAKER_MAX_COOLDOWN_SECS` | `600` | Cap for doubled cool-downs |
    pub fn from_env() -> Self {
        let base = Self::default();
        let env = |var: &str| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        let failure_threshold = env("REEL_BREAKER_FAILURE_THRESHOLD")
            .map(|v| v.clamp(1, u64::from(u32::MAX)) as u32)
            .unwrap_or(base.failure_threshold);
        let cooldown = env("REEL_BREAKER_COOLDOWN_SECS")
            .map(Duration::from_secs)
            .unwrap_or(base.cooldown);
        let max_cooldown = env("REEL_BREAKER_MAX_COOLDOWN_SECS")
            .map(Duration::from_secs)
            .unwrap_or(base.max_cooldown)
            .max(cooldown);

        Self {
            failure_threshold,
            cooldown,
            max_cooldown,
        }
    }
}

/// Identity of one attempt granted by [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    generation: u64,
    probe: bool,
}

impl Admission {
    /// Whether this attempt is the HalfOpen probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    entered: Instant,
    entered_at: DateTime<Utc>,
    cooldown: Duration,
    opened_threshold: Option<u32>,
    probe_granted: Option<Instant>,
    generation: u64,
    times_opened: u64,
}

impl BreakerEntry {
    fn closed(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            entered: Instant::now(),
            entered_at: Utc::now(),
            cooldown,
            opened_threshold: None,
            probe_granted: None,
            generation: 0,
            times_opened: 0,
        }
    }

    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.entered = Instant::now();
        self.entered_at = Utc::now();
        self.probe_granted = None;
        self.generation += 1;
    }

    fn grant_probe(&mut self, now: Instant) -> Admission {
        self.generation += 1;
        self.probe_granted = Some(now);
        Admission {
            generation: self.generation,
            probe: true,
        }
    }

    fn status(&self, provider: &str) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            provider: provider.to_string(),
            state: self.state,
            state_entered_at: self.entered_at,
            failure_threshold: self.opened_threshold,
            cooldown: self.cooldown,
            times_opened: self.times_opened,
        }
    }
}

/// Circuit breakers for every provider, driven by reported outcomes.
///
/// Owns the [`ProviderHealthTracker`]: outcomes reported here are forwarded
/// to it before the breaker transitions, so health and breaker state are
/// always updated together.
pub struct CircuitBreaker {
    settings: BreakerSettings,
    tracker: Arc<ProviderHealthTracker>,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings, tracker: Arc<ProviderHealthTracker>) -> Self {
        Self {
            settings,
            tracker,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// The health tracker this breaker feeds.
    pub fn tracker(&self) -> &Arc<ProviderHealthTracker> {
        &self.tracker
    }

    /// Whether one attempt against the provider may proceed now.
    ///
    /// Grants the HalfOpen probe as a side effect, so only call this for a
    /// provider that is about to be used.
    pub fn allow_attempt(&self, provider: &str) -> bool {
        self.admit(provider).is_some()
    }

    /// Like [`allow_attempt`](Self::allow_attempt), returning the identity of
    /// the granted attempt for [`report_admitted`](Self::report_admitted).
    pub fn admit(&self, provider: &str) -> Option<Admission> {
        let name = normalize_provider(provider)?;
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(name.clone())
            .or_insert_with(|| BreakerEntry::closed(self.settings.cooldown));

        match entry.state {
            CircuitState::Closed => Some(Admission {
                generation: entry.generation,
                probe: false,
            }),
            CircuitState::Open => {
                if now.duration_since(entry.entered) < entry.cooldown {
                    return None;
                }
                entry.enter(CircuitState::HalfOpen);
                let admission = entry.grant_probe(now);
                info!(
                    provider = %name,
                    breaker_state = %entry.state,
                    "Circuit cool-down elapsed, admitting probe"
                );
                Some(admission)
            }
            CircuitState::HalfOpen => match entry.probe_granted {
                None => Some(entry.grant_probe(now)),
                Some(granted) if now.duration_since(granted) >= entry.cooldown => {
                    warn!(
                        provider = %name,
                        "Half-open probe never reported back, admitting a new probe"
                    );
                    Some(entry.grant_probe(now))
                }
                Some(_) => None,
            },
        }
    }

    /// Report the outcome of an attempt whose admission was not kept; it is
    /// attributed to the breaker's current state.
    pub fn report_outcome(
        &self,
        provider: &str,
        success: bool,
        latency: Duration,
    ) -> Option<ProviderHealthMetrics> {
        self.record(provider, None, success, latency)
    }

    /// Report the outcome of an admitted attempt. Outcomes from an earlier
    /// generation update health but leave the breaker state alone.
    pub fn report_admitted(
        &self,
        provider: &str,
        admission: &Admission,
        success: bool,
        latency: Duration,
    ) -> Option<ProviderHealthMetrics> {
        self.record(provider, Some(admission), success, latency)
    }

    fn record(
        &self,
        provider: &str,
        admission: Option<&Admission>,
        success: bool,
        latency: Duration,
    ) -> Option<ProviderHealthMetrics> {
        let name = normalize_provider(provider)?;
        let metrics = self.tracker.record_attempt(&name, success, latency)?;

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(name.clone())
            .or_insert_with(|| BreakerEntry::closed(self.settings.cooldown));

        if let Some(admission) = admission {
            if admission.generation != entry.generation {
                debug!(
                    provider = %name,
                    breaker_state = %entry.state,
                    success,
                    "Outcome from an earlier breaker generation, health only"
                );
                return Some(metrics);
            }
        }

        match (entry.state, success) {
            (CircuitState::Closed, false)
                if metrics.consecutive_failures >= self.settings.failure_threshold =>
            {
                entry.cooldown = self.settings.cooldown;
                self.open(&name, entry, metrics.consecutive_failures);
            }
            (CircuitState::HalfOpen, true) => {
                entry.enter(CircuitState::Closed);
                entry.cooldown = self.settings.cooldown;
                info!(
                    provider = %name,
                    breaker_state = %entry.state,
                    "Probe succeeded, circuit closed"
                );
            }
            (CircuitState::HalfOpen, false) => {
                entry.cooldown = (entry.cooldown * 2).min(self.settings.max_cooldown);
                self.open(&name, entry, metrics.consecutive_failures);
            }
            // Late outcomes of attempts admitted before the circuit opened
            // only update health.
            (CircuitState::Open, _) | (CircuitState::Closed, _) => {}
        }

        Some(metrics)
    }

    fn open(&self, name: &str, entry: &mut BreakerEntry, consecutive_failures: u32) {
        entry.enter(CircuitState::Open);
        entry.opened_threshold = Some(self.settings.failure_threshold);
        entry.times_opened += 1;
        warn!(
            provider = %name,
            breaker_state = %entry.state,
            consecutive_failures,
            cooldown_secs = entry.cooldown.as_secs_f64(),
            "Circuit opened"
        );
    }

    /// Current breaker state (Closed for providers never seen).
    pub fn state(&self, provider: &str) -> CircuitState {
        self.get_status(provider).state
    }

    /// Dashboard view of one provider's breaker.
    pub fn get_status(&self, provider: &str) -> CircuitBreakerStatus {
        let name = normalize_provider(provider).unwrap_or_default();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&name) {
            Some(entry) => entry.status(&name),
            None => BreakerEntry::closed(self.settings.cooldown).status(&name),
        }
    }

    /// Status of every provider the breaker has seen, sorted by name.
    pub fn all_statuses(&self) -> Vec<CircuitBreakerStatus> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = entries
            .iter()
            .map(|(name, entry)| entry.status(name))
            .collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Close the circuit and forget the provider's health history.
    pub fn reset(&self, provider: &str) {
        let Some(name) = normalize_provider(provider) else {
            return;
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);
        self.tracker.reset(&name);
        debug!(provider = %name, "Circuit breaker reset");
    }
}
