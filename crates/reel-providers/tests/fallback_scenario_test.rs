//! End-to-end breaker and fallback behaviour across the resolver.
//!
//! This test suite validates:
//! - A provider failing `threshold` consecutive calls opens its circuit
//! - Resolution falls back to the next chain entry while the circuit is open
//! - After the cool-down exactly one probe reaches the original provider
//! - A successful probe restores the original provider as first choice
//! - A slow call admitted before the circuit opened cannot decide the probe
//! - The resolver never hands out unconfigured or circuit-open providers

use std::sync::Arc;
use std::time::Duration;

use reel_core::{CircuitState, Error};
use reel_providers::{
    BreakerSettings, CircuitBreaker, EnvCredentials, HealthSettings, ProviderHealthTracker,
    ProviderRequest, ProviderResolver, ProviderSettings,
};

const COOLDOWN: Duration = Duration::from_secs(60);

fn build_resolver(credentials: EnvCredentials) -> ProviderResolver {
    build_resolver_with(credentials, HealthSettings::default())
}

fn build_resolver_with(credentials: EnvCredentials, health: HealthSettings) -> ProviderResolver {
    let tracker = Arc::new(ProviderHealthTracker::new(health));
    let breaker = Arc::new(CircuitBreaker::new(
        BreakerSettings {
            failure_threshold: 3,
            cooldown: COOLDOWN,
            max_cooldown: COOLDOWN * 8,
        },
        tracker,
    ));
    ProviderResolver::new(breaker, Arc::new(credentials), ProviderSettings::default())
}

/// Resolve one provider and run a call against it that fails when the
/// chosen provider is in `down`.
async fn attempt(resolver: &ProviderResolver, chain: &[&str], down: &[&str]) -> String {
    let choice = resolver
        .resolve(&ProviderRequest::Auto, chain)
        .expect("a provider should be available");
    let provider = choice.provider.clone();
    let is_down = down.contains(&provider.as_str());
    let _ = resolver
        .call(&choice, async move {
            if is_down {
                Err(Error::transient("503 service unavailable"))
            } else {
                Ok(())
            }
        })
        .await;
    provider
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_probes_after_cooldown() {
    let resolver = build_resolver(EnvCredentials::local_only().with_key("elevenlabs"));
    let chain = ["elevenlabs", "piper"];

    // Three consecutive failures against the preferred provider.
    for _ in 0..3 {
        assert_eq!(attempt(&resolver, &chain, &["elevenlabs"]).await, "elevenlabs");
    }
    assert_eq!(resolver.get_status("elevenlabs").state, CircuitState::Open);

    // While open, every call falls back to the next entry.
    for _ in 0..5 {
        assert_eq!(attempt(&resolver, &chain, &["elevenlabs"]).await, "piper");
    }

    // After the cool-down, one probe goes to the original provider...
    tokio::time::advance(COOLDOWN).await;
    let probe = resolver.resolve(&ProviderRequest::Auto, &chain).unwrap();
    assert_eq!(probe.provider, "elevenlabs");
    assert_eq!(resolver.get_status("elevenlabs").state, CircuitState::HalfOpen);

    // ...and concurrent resolutions keep falling back until it reports.
    let other = resolver.resolve(&ProviderRequest::Auto, &chain).unwrap();
    assert_eq!(other.provider, "piper");
    assert!(other.is_fallback);

    resolver.report(&probe, true, Duration::from_millis(250));
    assert_eq!(resolver.get_status("elevenlabs").state, CircuitState::Closed);
    assert_eq!(
        resolver
            .get_health("elevenlabs")
            .unwrap()
            .consecutive_failures,
        0
    );
    assert_eq!(attempt(&resolver, &chain, &[]).await, "elevenlabs");
}

#[tokio::test(start_paused = true)]
async fn test_flapping_provider_probed_once_per_window() {
    // Keep the degraded verdict out of the way so only the breaker decides.
    let resolver = build_resolver_with(
        EnvCredentials::local_only().with_key("stability"),
        HealthSettings {
            min_samples: u64::MAX,
            ..HealthSettings::default()
        },
    );
    let chain = ["stability", "stock"];

    for _ in 0..3 {
        attempt(&resolver, &chain, &["stability"]).await;
    }

    let mut probes = 0;
    // Walk forward in 10s steps over several windows; the provider keeps failing.
    for _ in 0..60 {
        tokio::time::advance(Duration::from_secs(10)).await;
        if attempt(&resolver, &chain, &["stability"]).await == "stability" {
            probes += 1;
        }
    }

    // 600s elapsed with cool-downs of 60, 120, 240 (then 480): three probes.
    assert_eq!(probes, 3);
    assert_eq!(resolver.get_status("stability").state, CircuitState::Open);
    assert_eq!(resolver.get_status("stability").times_opened, 4);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_provider_loses_priority_without_opening() {
    let resolver = build_resolver(EnvCredentials::local_only().with_key("openai"));
    let chain = ["openai", "ollama"];

    // Alternating outcomes never reach three in a row but drag the rate down.
    for success in [true, false, false, true, false, false] {
        resolver.report_outcome("openai", success, Duration::from_millis(10));
    }
    assert_eq!(resolver.get_status("openai").state, CircuitState::Closed);

    let choice = resolver.resolve(&ProviderRequest::Auto, &chain).unwrap();
    assert_eq!(choice.provider, "ollama");
    assert!(choice.is_fallback);
}

#[tokio::test(start_paused = true)]
async fn test_resolver_never_returns_unconfigured_or_open() {
    let resolver = build_resolver(EnvCredentials::local_only().with_key("openai"));
    let chain = ["anthropic", "openai", "gemini", "ollama"];

    for _ in 0..3 {
        resolver.report_outcome("openai", false, Duration::from_millis(1));
    }

    for _ in 0..10 {
        let choice = resolver.resolve(&ProviderRequest::Auto, &chain).unwrap();
        assert_eq!(choice.provider, "ollama");
        assert_ne!(resolver.get_status(&choice.provider).state, CircuitState::Open);
    }

    for _ in 0..3 {
        resolver.report_outcome("ollama", false, Duration::from_millis(1));
    }
    let err = resolver.resolve(&ProviderRequest::Auto, &chain).unwrap_err();
    assert!(matches!(err, Error::NoProviderAvailable { ref tried } if tried.len() == 4));
}

#[tokio::test(start_paused = true)]
async fn test_slow_failure_landing_during_half_open_window() {
    let resolver = build_resolver_with(
        EnvCredentials::local_only().with_key("openai"),
        HealthSettings {
            min_samples: u64::MAX,
            ..HealthSettings::default()
        },
    );
    let chain = ["openai", "ollama"];

    // One call goes out and hangs until the provider timeout.
    let slow = resolver.resolve(&ProviderRequest::Auto, &chain).unwrap();
    assert_eq!(slow.provider, "openai");

    // Meanwhile three quick failures open the circuit.
    for _ in 0..3 {
        assert_eq!(attempt(&resolver, &chain, &["openai"]).await, "openai");
    }
    assert_eq!(resolver.get_status("openai").state, CircuitState::Open);

    tokio::time::advance(COOLDOWN).await;
    let probe = resolver.resolve(&ProviderRequest::Auto, &chain).unwrap();
    assert_eq!(probe.provider, "openai");

    // The hung call finally times out while the probe is in flight.
    resolver.report(&slow, false, Duration::from_secs(120));
    assert_eq!(resolver.get_status("openai").state, CircuitState::HalfOpen);
    assert_eq!(resolver.get_status("openai").cooldown, COOLDOWN);

    resolver.report(&probe, true, Duration::from_millis(300));
    let status = resolver.get_status("openai");
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.cooldown, COOLDOWN);
    assert_eq!(status.times_opened, 1);
    assert_eq!(attempt(&resolver, &chain, &[]).await, "openai");
}
