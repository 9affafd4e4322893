use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{PendingMutation, PendingStore, PersistedEntry, StoreResult, expiry_for};
use crate::executor::EntryKey;

/// Process-local store.
///
/// Outlives a scheduler restart when shared, which is enough for tests and
/// for deployments that only need to survive a reload.
#[derive(Default)]
pub struct InMemoryPendingStore {
    records: RwLock<HashMap<EntryKey, PersistedEntry>>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, key: EntryKey) -> Option<PersistedEntry> {
        self.records.read().await.get(&key).cloned()
    }

    /// Insert a record directly, bypassing the mutation path.
    pub async fn insert(&self, entry: PersistedEntry) {
        self.records.write().await.insert(entry.key, entry);
    }
}

#[async_trait]
impl PendingStore for InMemoryPendingStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn apply_batch(&self, mutations: &[PendingMutation], ttl: Duration) -> StoreResult<usize> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        for mutation in mutations {
            match mutation {
                PendingMutation::Upsert {
                    key,
                    due_at,
                    attempt,
                } => {
                    records.insert(
                        *key,
                        PersistedEntry {
                            key: *key,
                            due_at: *due_at,
                            expires_at: expiry_for(*due_at, ttl),
                            attempt: *attempt,
                            updated_at: now,
                        },
                    );
                }
                PendingMutation::Delete { key } => {
                    records.remove(key);
                }
            }
        }
        Ok(mutations.len())
    }

    async fn load_pending(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PersistedEntry>> {
        let records = self.records.read().await;
        let mut pending: Vec<PersistedEntry> = records
            .values()
            .filter(|entry| entry.expires_at > now)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.key.cmp(&b.key)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, entry| entry.expires_at > now);
        Ok((before - records.len()) as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
