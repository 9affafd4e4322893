//! Best-effort durable mirror of pending deletions.
//!
//! The scheduler never waits on the store: mutations go through a bounded
//! queue and are written in batches by a background worker. The mirror is
//! read once, at start, to rehydrate the wheel after a restart.

mod memory;
#[cfg(feature = "database-sqlite")]
mod sqlite;
mod worker;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use memory::InMemoryPendingStore;
use serde::{Deserialize, Serialize};
#[cfg(feature = "database-sqlite")]
pub use sqlite::SqlitePendingStore;
use thiserror::Error;
pub use worker::{PersistenceQueue, PersistenceSettings, start_flush_worker};

use crate::{
    config::{PersistenceConfig, StoreKind},
    executor::EntryKey,
};

/// A change to the mirrored state of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingMutation {
    /// Insert or replace the record for `key`.
    Upsert {
        key: EntryKey,
        due_at: DateTime<Utc>,
        attempt: u32,
    },
    /// Forget `key`. Deleting a missing record is not an error.
    Delete { key: EntryKey },
}

impl PendingMutation {
    pub fn key(&self) -> EntryKey {
        match self {
            PendingMutation::Upsert { key, .. } | PendingMutation::Delete { key } => *key,
        }
    }
}

/// A mirrored entry as read back from a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: EntryKey,
    /// Wall-clock due time.
    pub due_at: DateTime<Utc>,
    /// After this the record is ignored and eventually purged.
    pub expires_at: DateTime<Utc>,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "database-sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database-sqlite")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable store for pending deletions.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Create tables and indexes if they do not exist.
    async fn ensure_schema(&self) -> StoreResult<()>;

    /// Apply mutations in order, atomically where the backend allows.
    ///
    /// Upserted records expire `ttl` after their due time. Returns the
    /// number of mutations applied.
    async fn apply_batch(&self, mutations: &[PendingMutation], ttl: Duration) -> StoreResult<usize>;

    /// Unexpired records, earliest due first, at most `limit`.
    async fn load_pending(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PersistedEntry>>;

    /// Remove records that expired at or before `now`. Returns the count removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Store name for logs.
    fn name(&self) -> &'static str;
}

/// Build the store selected by configuration.
pub async fn create_store(config: &PersistenceConfig) -> StoreResult<Arc<dyn PendingStore>> {
    match config.store {
        StoreKind::Memory => Ok(Arc::new(InMemoryPendingStore::new())),
        #[cfg(feature = "database-sqlite")]
        StoreKind::Sqlite => Ok(Arc::new(SqlitePendingStore::connect(&config.sqlite).await?)),
        #[cfg(not(feature = "database-sqlite"))]
        StoreKind::Sqlite => Err(StoreError::Unavailable(
            "SQLite store requires the 'database-sqlite' feature".into(),
        )),
    }
}

/// `due_at + ttl`, saturating.
pub(crate) fn expiry_for(due_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| due_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
