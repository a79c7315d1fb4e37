//! Durable at-least-once session job queue (SQLite via sqlx), the handoff point to the
//! external LLM worker. Ordering across different buffer keys is unspecified; per-key
//! ordering doesn't need queue-level help because `SessionBuffer`'s gate already
//! guarantees at most one outstanding job per key.

use crate::error::InfraError;
use crate::model::SessionJob;
use crate::Result;
use anyhow::Context as _;
use sqlx::{Row, SqlitePool};

pub struct SessionQueue {
    pool: SqlitePool,
}

impl SessionQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_jobs (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                session_key INTEGER NOT NULL,
                gate_token TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                trace_started_at INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                claimed_at INTEGER,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create session_jobs table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_session_jobs_unclaimed ON session_jobs(claimed_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Enqueues `job`, returning the generated job id. On failure the caller (the
    /// dispatcher) must release the session buffer's gate token to avoid stalling the key.
    pub async fn enqueue(&self, job: &SessionJob) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO session_jobs
                (id, bot_id, group_id, user_id, session_id, session_key, gate_token,
                 trace_id, trace_started_at, enqueued_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&job.bot_id)
        .bind(&job.group_id)
        .bind(&job.user_id)
        .bind(&job.session_id)
        .bind(job.key as i64)
        .bind(&job.gate_token)
        .bind(&job.trace_id)
        .bind(job.trace_started_at)
        .bind(job.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| InfraError::EnqueueFailed(e.to_string()))?;

        Ok(id)
    }

    /// Marks the oldest unclaimed job as claimed and returns it, for a worker poll loop.
    pub async fn claim_next(&self) -> Result<Option<(String, SessionJob)>> {
        let row = sqlx::query(
            r#"
            SELECT id, bot_id, group_id, user_id, session_id, session_key, gate_token,
                   trace_id, trace_started_at, enqueued_at
            FROM session_jobs
            WHERE claimed_at IS NULL
            ORDER BY enqueued_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to query next session job")?;

        let Some(row) = row else { return Ok(None) };
        let id: String = row.try_get("id")?;

        let updated = sqlx::query("UPDATE session_jobs SET claimed_at = ? WHERE id = ? AND claimed_at IS NULL")
            .bind(now_ms())
            .bind(&id)
            .execute(&self.pool)
            .await
            .context("failed to claim session job")?;

        if updated.rows_affected() == 0 {
            // Another worker claimed it first between the select and the update.
            return Ok(None);
        }

        let job = SessionJob {
            bot_id: row.try_get("bot_id")?,
            group_id: row.try_get("group_id")?,
            user_id: row.try_get("user_id")?,
            session_id: row.try_get("session_id")?,
            key: row.try_get::<i64, _>("session_key")? as u32,
            gate_token: row.try_get("gate_token")?,
            trace_id: row.try_get("trace_id")?,
            trace_started_at: row.try_get("trace_started_at")?,
            enqueued_at: row.try_get("enqueued_at")?,
        };

        Ok(Some((id, job)))
    }

    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE session_jobs SET completed_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to mark session job completed")?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
