//! Connection pool for the snapshot store.
//!
//! Queue snapshots are written one job at a time behind the queue's persist
//! lock, so the pool stays small: one connection for writes plus headroom
//! for restore and status counts.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use reel_core::{Error, Result};

/// Pool sizing for [`connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// How long a snapshot write waits for a connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 2,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolSettings {
    /// Read pool sizing from the environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `REEL_DB_MAX_CONNECTIONS` | `2` | Pool size cap (at least 1) |
    /// | `REEL_DB_ACQUIRE_TIMEOUT_SECS` | `10` | Wait for a free connection |
    pub fn from_env() -> Self {
        let base = Self::default();
        let env = |var: &str| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        Self {
            max_connections: env("REEL_DB_MAX_CONNECTIONS")
                .map(|n| n.clamp(1, u64::from(u32::MAX)) as u32)
                .unwrap_or(base.max_connections),
            acquire_timeout: env("REEL_DB_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.acquire_timeout),
        }
    }
}

/// Open a pool against `database_url`.
pub async fn connect(database_url: &str, settings: PoolSettings) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        max_connections = settings.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Snapshot database connected"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_settings_from_env() {
        std::env::set_var("REEL_DB_MAX_CONNECTIONS", "0");
        std::env::set_var("REEL_DB_ACQUIRE_TIMEOUT_SECS", " 7 ");
        let settings = PoolSettings::from_env();
        assert_eq!(settings.max_connections, 1);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(7));

        std::env::set_var("REEL_DB_MAX_CONNECTIONS", "many");
        std::env::remove_var("REEL_DB_ACQUIRE_TIMEOUT_SECS");
        assert_eq!(PoolSettings::from_env(), PoolSettings::default());
        std::env::remove_var("REEL_DB_MAX_CONNECTIONS");
    }
}
