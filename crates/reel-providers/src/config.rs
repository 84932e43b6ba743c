//! Provider settings, fallback chains, and environment-backed credentials.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use reel_core::{defaults, ProviderCredentials};

/// Canonical form of a provider name: trimmed and lowercased.
///
/// Returns `None` for blank names, which every component ignores.
pub fn normalize_provider(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}

// ---------------------------------------------------------------------------
// Provider kinds and default chains
// ---------------------------------------------------------------------------

/// The kind of external backend a stage needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Script generation.
    Llm,
    /// Voice synthesis.
    Tts,
    /// Visual generation.
    Image,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::Llm, ProviderKind::Tts, ProviderKind::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Image => "image",
        }
    }

    /// Built-in fallback order: premium providers first, local last.
    pub fn default_chain(&self) -> Vec<String> {
        let chain: &[&str] = match self {
            Self::Llm => &["openai", "anthropic", "gemini", "ollama", "rule_based"],
            Self::Tts => &["elevenlabs", "playht", "azure_tts", "piper", "system_tts"],
            Self::Image => &["stability", "openai_images", "local_sd", "stock"],
        };
        chain.iter().map(|s| s.to_string()).collect()
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Providers that run locally and need no credentials.
pub const LOCAL_PROVIDERS: &[&str] = &[
    "ollama",
    "rule_based",
    "piper",
    "system_tts",
    "local_sd",
    "stock",
];

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Static provider configuration: timeouts, disablement, and fallback chains.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Timeout applied to calls whose provider has no override.
    pub default_timeout: Duration,
    /// Per-provider timeout overrides.
    pub timeouts: HashMap<String, Duration>,
    /// Providers explicitly disabled by the operator.
    pub disabled: HashSet<String>,
    /// Fallback chain per provider kind.
    pub chains: HashMap<ProviderKind, Vec<String>>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(defaults::PROVIDER_TIMEOUT_SECS),
            timeouts: HashMap::new(),
            disabled: HashSet::new(),
            chains: ProviderKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_chain()))
                .collect(),
        }
    }
}

impl ProviderSettings {
    /// Create settings from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `REEL_PROVIDER_TIMEOUT_SECS` | `120` | Default external-call timeout |
    /// | `REEL_PROVIDER_TIMEOUT_<NAME>_SECS` | - | Per-provider timeout override |
    /// | `REEL_DISABLED_PROVIDERS` | empty | Comma-separated disabled providers |
    /// | `REEL_CHAIN_LLM` / `REEL_CHAIN_TTS` / `REEL_CHAIN_IMAGE` | built-in | Fallback chains |
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(secs) = env_u64("REEL_PROVIDER_TIMEOUT_SECS") {
            settings.default_timeout = Duration::from_secs(secs.max(1));
        }

        if let Ok(list) = std::env::var("REEL_DISABLED_PROVIDERS") {
            settings.disabled = parse_list(&list).into_iter().collect();
        }

        for kind in ProviderKind::ALL {
            let var = format!("REEL_CHAIN_{}", kind.as_str().to_ascii_uppercase());
            if let Ok(list) = std::env::var(&var) {
                let chain = parse_list(&list);
                if !chain.is_empty() {
                    settings.chains.insert(kind, chain);
                }
            }
        }

        let known: HashSet<String> = settings.chains.values().flatten().cloned().collect();
        for provider in known {
            let var = format!("REEL_PROVIDER_TIMEOUT_{}_SECS", provider.to_ascii_uppercase());
            if let Some(secs) = env_u64(&var) {
                settings
                    .timeouts
                    .insert(provider, Duration::from_secs(secs.max(1)));
            }
        }

        debug!(
            default_timeout_secs = settings.default_timeout.as_secs(),
            disabled = ?settings.disabled,
            "Loaded provider settings"
        );
        settings
    }

    /// Override the timeout for one provider.
    pub fn with_timeout(mut self, provider: &str, timeout: Duration) -> Self {
        if let Some(name) = normalize_provider(provider) {
            self.timeouts.insert(name, timeout);
        }
        self
    }

    /// Mark a provider as disabled.
    pub fn with_disabled(mut self, provider: &str) -> Self {
        if let Some(name) = normalize_provider(provider) {
            self.disabled.insert(name);
        }
        self
    }

    /// Replace the fallback chain for a provider kind.
    pub fn with_chain(mut self, kind: ProviderKind, chain: &[&str]) -> Self {
        let chain = chain.iter().filter_map(|p| normalize_provider(p)).collect();
        self.chains.insert(kind, chain);
        self
    }

    pub fn timeout_for(&self, provider: &str) -> Duration {
        normalize_provider(provider)
            .and_then(|name| self.timeouts.get(&name).copied())
            .unwrap_or(self.default_timeout)
    }

    pub fn is_disabled(&self, provider: &str) -> bool {
        normalize_provider(provider).is_some_and(|name| self.disabled.contains(&name))
    }

    /// Fallback chain for a provider kind (empty if none configured).
    pub fn chain(&self, kind: ProviderKind) -> &[String] {
        self.chains.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Credential presence read from `<NAME>_API_KEY` environment variables.
///
/// Local providers are always configured.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    keyed: HashSet<String>,
    local: HashSet<String>,
}

impl EnvCredentials {
    /// Check every provider named in the settings' chains for an API key.
    pub fn from_env(settings: &ProviderSettings) -> Self {
        let mut creds = Self::local_only();
        for provider in settings.chains.values().flatten() {
            if creds.local.contains(provider) {
                continue;
            }
            let var = format!("{}_API_KEY", provider.to_ascii_uppercase());
            let present = std::env::var(&var).is_ok_and(|v| !v.trim().is_empty());
            if present {
                creds.keyed.insert(provider.clone());
            }
            debug!(provider = %provider, configured = present, "Checked provider credentials");
        }
        creds
    }

    /// Only the built-in local providers.
    pub fn local_only() -> Self {
        Self {
            keyed: HashSet::new(),
            local: LOCAL_PROVIDERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Treat a provider as having credentials.
    pub fn with_key(mut self, provider: &str) -> Self {
        if let Some(name) = normalize_provider(provider) {
            self.keyed.insert(name);
        }
        self
    }
}

impl ProviderCredentials for EnvCredentials {
    fn is_configured(&self, provider: &str) -> bool {
        normalize_provider(provider)
            .is_some_and(|name| self.local.contains(&name) || self.keyed.contains(&name))
    }
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_list(list: &str) -> Vec<String> {
    list.split(',').filter_map(normalize_provider).collect()
}
