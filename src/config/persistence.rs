//! Persistence side-channel configuration.
//!
//! ```toml
//! [persistence]
//! enabled = true
//! store = "sqlite"
//! ttl_hours = 24
//! restore_limit = 20000
//!
//! [persistence.sqlite]
//! path = "chat-reaper.db"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, default_true};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    /// Mirror pending entries to a durable store and restore them on start.
    #[serde(default)]
    pub enabled: bool,

    /// Which store backs the mirror.
    #[serde(default)]
    pub store: StoreKind,

    /// Records older than this past their due time are ignored and purged.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Maximum records rehydrated on start, earliest due first.
    #[serde(default = "default_restore_limit")]
    pub restore_limit: usize,

    /// Mutations buffered before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Mutations written per store call while running.
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,

    /// Mutations written per store call while draining on shutdown.
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,

    /// Minimum time between expired-record purges.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// SQLite store settings, used when `store = "sqlite"`.
    #[serde(default)]
    pub sqlite: SqliteStoreConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store: StoreKind::default(),
            ttl_hours: default_ttl_hours(),
            restore_limit: default_restore_limit(),
            queue_capacity: default_queue_capacity(),
            flush_batch_size: default_flush_batch_size(),
            drain_batch_size: default_drain_batch_size(),
            purge_interval_secs: default_purge_interval_secs(),
            sqlite: SqliteStoreConfig::default(),
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=168).contains(&self.ttl_hours) {
            return Err(ConfigError::Validation(format!(
                "persistence.ttl_hours must be between 1 and 168, got {}",
                self.ttl_hours
            )));
        }
        if self.restore_limit > 200_000 {
            return Err(ConfigError::Validation(format!(
                "persistence.restore_limit must be at most 200000, got {}",
                self.restore_limit
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "persistence.queue_capacity must be at least 1".into(),
            ));
        }
        if self.flush_batch_size == 0 || self.drain_batch_size == 0 {
            return Err(ConfigError::Validation(
                "persistence batch sizes must be at least 1".into(),
            ));
        }
        if self.purge_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "persistence.purge_interval_secs must be at least 1".into(),
            ));
        }
        if self.enabled && self.store == StoreKind::Sqlite {
            if self.sqlite.path.is_empty() {
                return Err(ConfigError::Validation(
                    "persistence.sqlite.path cannot be empty".into(),
                ));
            }
            #[cfg(not(feature = "database-sqlite"))]
            return Err(ConfigError::Validation(
                "persistence.store = \"sqlite\" requires the 'database-sqlite' feature. \
                 Rebuild with: cargo build --features database-sqlite"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Sqlite,
    /// Process-local map. Survives engine restarts, not process restarts.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteStoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// Create the database file if it doesn't exist.
    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    /// Enable WAL mode for better concurrency.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
            create_if_missing: true,
            wal_mode: true,
            busy_timeout_ms: default_busy_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_restore_limit() -> usize {
    20_000
}

fn default_queue_capacity() -> usize {
    200_000
}

fn default_flush_batch_size() -> usize {
    500
}

fn default_drain_batch_size() -> usize {
    1000
}

fn default_purge_interval_secs() -> u64 {
    300
}

fn default_sqlite_path() -> String {
    "chat-reaper.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_connections() -> u32 {
    4
}
