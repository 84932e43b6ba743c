//! Seams between the queue core and its external collaborators.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Job, JobId};

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Best-effort snapshot storage for job records.
///
/// The queue writes a job after every state change and reloads all jobs on
/// startup; implementations only need last-writer-wins upserts.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace one job record.
    async fn save(&self, job: &Job) -> Result<()>;

    /// Remove job records (evicted history). Unknown ids are ignored.
    async fn remove(&self, ids: &[JobId]) -> Result<()>;

    /// Load every stored job record.
    async fn load_all(&self) -> Result<Vec<Job>>;
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Answers whether a provider can be used at all (credentials present, not
/// explicitly disabled).
pub trait ProviderCredentials: Send + Sync {
    fn is_configured(&self, provider: &str) -> bool;
}

impl<F> ProviderCredentials for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_configured(&self, provider: &str) -> bool {
        self(provider)
    }
}
