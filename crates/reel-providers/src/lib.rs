//! # reel-providers
//!
//! Resilience layer for the external generation backends (LLM, TTS, image).
//!
//! This crate provides:
//! - Rolling per-provider health metrics ([`ProviderHealthTracker`])
//! - Per-provider circuit breakers with half-open probing ([`CircuitBreaker`])
//! - Fallback-chain resolution honouring credentials, disablement, breaker
//!   state and degraded health ([`ProviderResolver`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reel_providers::{
//!     BreakerSettings, CircuitBreaker, EnvCredentials, ProviderHealthTracker, ProviderKind,
//!     ProviderRequest, ProviderResolver, ProviderSettings,
//! };
//!
//! # async fn example() -> reel_core::Result<()> {
//! let settings = ProviderSettings::from_env();
//! let credentials = Arc::new(EnvCredentials::from_env(&settings));
//! let tracker = Arc::new(ProviderHealthTracker::default());
//! let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::from_env(), tracker));
//! let resolver = ProviderResolver::new(breaker, credentials, settings);
//!
//! let choice = resolver.resolve_kind(&ProviderRequest::parse("openai"), ProviderKind::Llm)?;
//! let script = resolver
//!     .call(&choice, async { Ok("generated script".to_string()) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod health;
pub mod resolver;

pub use breaker::{Admission, BreakerSettings, CircuitBreaker};
pub use config::{
    normalize_provider, EnvCredentials, ProviderKind, ProviderSettings, LOCAL_PROVIDERS,
};
pub use health::{HealthSettings, ProviderHealthTracker};
pub use resolver::{ProviderRequest, ProviderResolver, Resolution};
