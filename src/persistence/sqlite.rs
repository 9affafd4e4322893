use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::{PendingMutation, PendingStore, PersistedEntry, StoreResult, expiry_for};
use crate::{config::SqliteStoreConfig, executor::EntryKey};

/// SQLite-backed store. Timestamps are stored as epoch milliseconds so the
/// due and expiry indexes order numerically.
pub struct SqlitePendingStore {
    pool: SqlitePool,
}

impl SqlitePendingStore {
    pub async fn connect(config: &SqliteStoreConfig) -> StoreResult<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(
                sqlx::sqlite::SqliteConnectOptions::new()
                    .filename(&config.path)
                    .create_if_missing(config.create_if_missing)
                    .journal_mode(if config.wal_mode {
                        sqlx::sqlite::SqliteJournalMode::Wal
                    } else {
                        sqlx::sqlite::SqliteJournalMode::Delete
                    })
                    .busy_timeout(Duration::from_millis(config.busy_timeout_ms)),
            )
            .await?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[async_trait]
impl PendingStore for SqlitePendingStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations_sqlx/sqlite")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_batch(&self, mutations: &[PendingMutation], ttl: Duration) -> StoreResult<usize> {
        if mutations.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for mutation in mutations {
            match mutation {
                PendingMutation::Upsert {
                    key,
                    due_at,
                    attempt,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO pending_deletions (
                            chat_id, message_id, due_at, expires_at, attempt, updated_at
                        )
                        VALUES (?, ?, ?, ?, ?, ?)
                        ON CONFLICT (chat_id, message_id) DO UPDATE SET
                            due_at = excluded.due_at,
                            expires_at = excluded.expires_at,
                            attempt = excluded.attempt,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(key.chat_id)
                    .bind(key.message_id)
                    .bind(due_at.timestamp_millis())
                    .bind(expiry_for(*due_at, ttl).timestamp_millis())
                    .bind(i64::from(*attempt))
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                PendingMutation::Delete { key } => {
                    sqlx::query(
                        "DELETE FROM pending_deletions WHERE chat_id = ? AND message_id = ?",
                    )
                    .bind(key.chat_id)
                    .bind(key.message_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(mutations.len())
    }

    async fn load_pending(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PersistedEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT chat_id, message_id, due_at, expires_at, attempt, updated_at
            FROM pending_deletions
            WHERE expires_at > ?
            ORDER BY due_at ASC, chat_id ASC, message_id ASC
            LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let attempt: i64 = row.get("attempt");
                PersistedEntry {
                    key: EntryKey::new(row.get("chat_id"), row.get("message_id")),
                    due_at: from_millis(row.get("due_at")),
                    expires_at: from_millis(row.get("expires_at")),
                    attempt: u32::try_from(attempt.max(0)).unwrap_or(u32::MAX),
                    updated_at: from_millis(row.get("updated_at")),
                }
            })
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM pending_deletions WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
