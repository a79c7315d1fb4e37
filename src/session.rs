//! External session repository: resolves the `SessionId` for a `(bot, group, user, key)`
//! tuple, creating a fresh session on first reference and rotating on reset. The
//! dispatcher never mints a `SessionId` itself (spec §3) — it always asks this repository.

use crate::model::SessionKey;
use crate::Result;
use anyhow::Context as _;
use sqlx::{Row, SqlitePool};

/// Outcome of a `reset_all` sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetAllOutcome {
    pub users: u32,
    pub archived: u32,
    pub failed: u32,
}

pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_key INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create sessions table")?;

        // Partial unique index: at most one active session per (bot, group, user, key).
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active
            ON sessions(bot_id, group_id, user_id, session_key)
            WHERE status = 'active'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create sessions active index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_group ON sessions(bot_id, group_id, status)")
            .execute(&self.pool)
            .await
            .context("failed to create sessions group index")?;

        Ok(())
    }

    /// Returns the active session for `(bot_id, group_id, user_id, key)`, creating one if
    /// none exists. Race-safe: a concurrent creator loses the unique-index race and simply
    /// re-reads the winner's row.
    pub async fn resolve_or_create(
        &self,
        bot_id: &str,
        group_id: &str,
        user_id: &str,
        key: SessionKey,
    ) -> Result<String> {
        if let Some(id) = self.active_session_id(bot_id, group_id, user_id, key).await? {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let inserted = sqlx::query(
            r#"
            INSERT INTO sessions (id, bot_id, group_id, user_id, session_key, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'active', ?, ?)
            ON CONFLICT(bot_id, group_id, user_id, session_key) WHERE status = 'active' DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(bot_id)
        .bind(group_id)
        .bind(user_id)
        .bind(key as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to create session")?;

        if inserted.rows_affected() == 1 {
            return Ok(id);
        }

        // Lost the race to a concurrent creator; its row is now the active one.
        self.active_session_id(bot_id, group_id, user_id, key)
            .await?
            .context("session row missing immediately after a lost insert race")
            .map_err(|e| e.into())
    }

    async fn active_session_id(
        &self,
        bot_id: &str,
        group_id: &str,
        user_id: &str,
        key: SessionKey,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM sessions
            WHERE bot_id = ? AND group_id = ? AND user_id = ? AND session_key = ? AND status = 'active'
            "#,
        )
        .bind(bot_id)
        .bind(group_id)
        .bind(user_id)
        .bind(key as i64)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query active session")?;

        Ok(match row {
            Some(row) => Some(row.try_get("id")?),
            None => None,
        })
    }

    /// Archives any active session for `(bot_id, group_id, user_id, key)` and returns a
    /// freshly created replacement.
    pub async fn reset(&self, bot_id: &str, group_id: &str, user_id: &str, key: SessionKey) -> Result<String> {
        sqlx::query(
            r#"
            UPDATE sessions SET status = 'archived', updated_at = ?
            WHERE bot_id = ? AND group_id = ? AND user_id = ? AND session_key = ? AND status = 'active'
            "#,
        )
        .bind(now_ms())
        .bind(bot_id)
        .bind(group_id)
        .bind(user_id)
        .bind(key as i64)
        .execute(&self.pool)
        .await
        .context("failed to archive session on reset")?;

        self.resolve_or_create(bot_id, group_id, user_id, key).await
    }

    /// Rotates every active session in `(bot_id, group_id)`, isolating per-user failures.
    pub async fn reset_all(&self, bot_id: &str, group_id: &str) -> Result<ResetAllOutcome> {
        let rows = sqlx::query(
            r#"SELECT DISTINCT user_id, session_key FROM sessions WHERE bot_id = ? AND group_id = ? AND status = 'active'"#,
        )
        .bind(bot_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to enumerate active sessions for reset-all")?;

        let mut outcome = ResetAllOutcome {
            users: rows.len() as u32,
            ..Default::default()
        };

        for row in rows {
            let user_id: String = match row.try_get("user_id") {
                Ok(v) => v,
                Err(_) => {
                    outcome.failed += 1;
                    continue;
                }
            };
            let key: i64 = row.try_get::<i64, _>("session_key").unwrap_or(0);
            match self.reset(bot_id, group_id, &user_id, key as u32).await {
                Ok(_) => outcome.archived += 1,
                Err(err) => {
                    tracing::warn!(bot_id, group_id, user_id = %user_id, error = %err, "reset-all failed for user");
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SessionRepository::new(pool.clone());
        repo.initialize().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn resolve_or_create_is_idempotent_while_active() {
        let pool = test_pool().await;
        let repo = SessionRepository::new(pool);
        let a = repo.resolve_or_create("bot-1", "g1", "u1", 0).await.unwrap();
        let b = repo.resolve_or_create("bot-1", "g1", "u1", 0).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_sessions() {
        let pool = test_pool().await;
        let repo = SessionRepository::new(pool);
        let a = repo.resolve_or_create("bot-1", "g1", "u1", 0).await.unwrap();
        let b = repo.resolve_or_create("bot-1", "g1", "u1", 1).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn reset_rotates_to_a_fresh_session() {
        let pool = test_pool().await;
        let repo = SessionRepository::new(pool);
        let before = repo.resolve_or_create("bot-1", "g1", "u1", 0).await.unwrap();
        let after = repo.reset("bot-1", "g1", "u1", 0).await.unwrap();
        assert_ne!(before, after);
        let current = repo.resolve_or_create("bot-1", "g1", "u1", 0).await.unwrap();
        assert_eq!(after, current);
    }

    #[tokio::test]
    async fn reset_all_rotates_every_active_user() {
        let pool = test_pool().await;
        let repo = SessionRepository::new(pool);
        repo.resolve_or_create("bot-1", "g1", "u1", 0).await.unwrap();
        repo.resolve_or_create("bot-1", "g1", "u2", 0).await.unwrap();
        let outcome = repo.reset_all("bot-1", "g1").await.unwrap();
        assert_eq!(outcome.users, 2);
        assert_eq!(outcome.archived, 2);
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn reset_all_with_no_sessions_is_a_no_op() {
        let pool = test_pool().await;
        let repo = SessionRepository::new(pool);
        let outcome = repo.reset_all("bot-1", "g1").await.unwrap();
        assert_eq!(outcome, ResetAllOutcome::default());
    }
}
