//! PostgreSQL snapshot store for queue jobs.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use reel_core::{Error, Job, JobId, JobStore, Result};

/// PostgreSQL implementation of [`JobStore`].
///
/// Each job is one row in `reel_job_snapshot`; the full record is kept as
/// JSONB in `payload`, with status and priority copied out for operators.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Count stored jobs, grouped by status.
    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM reel_job_snapshot
             GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("status"), row.get("count")))
            .collect())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_value(job)?;

        sqlx::query(
            "INSERT INTO reel_job_snapshot (id, status, priority, payload, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
             SET status = EXCLUDED.status,
                 priority = EXCLUDED.priority,
                 payload = EXCLUDED.payload,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn remove(&self, ids: &[JobId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let result = sqlx::query("DELETE FROM reel_job_snapshot WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "jobs",
            op = "remove",
            requested = ids.len(),
            removed = result.rows_affected(),
            "Removed job snapshots"
        );
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, payload FROM reel_job_snapshot ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.get("id");
            let payload: JsonValue = row.get("payload");
            match serde_json::from_value::<Job>(payload) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(
                    subsystem = "database",
                    component = "jobs",
                    job_id = %id,
                    error = %e,
                    "Skipping unreadable job snapshot"
                ),
            }
        }
        Ok(jobs)
    }
}
