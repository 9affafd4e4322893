//! Batch delete executor.
//!
//! Takes the due entries of one chat, issues the platform calls, and sorts
//! every entry into exactly one of three outcomes: deleted, permanently
//! failed, or retry after a delay. Whether the platform supports batch
//! deletion is learned on the fly and remembered.

use std::{
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    config::EngineConfig,
    platform::{ChatPlatform, PlatformError, is_already_gone},
};

/// Hard cap of the platform's batch delete call.
pub const PLATFORM_BATCH_LIMIT: usize = 100;

/// No retry is scheduled sooner than this.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Identity of a scheduled deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub chat_id: i64,
    pub message_id: i64,
}

impl EntryKey {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

/// A pending deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub key: EntryKey,
    pub due_at: Instant,
    /// Delete attempts already made.
    pub attempt: u32,
}

/// An entry the executor wants tried again after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDirective {
    pub entry: ScheduledEntry,
    pub delay: Duration,
}

/// Outcome of one [`DeleteExecutor::process`] call.
///
/// Every input entry lands in exactly one list.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub deleted: Vec<ScheduledEntry>,
    pub failed: Vec<ScheduledEntry>,
    pub retry: Vec<RetryDirective>,
}

impl ExecutionResult {
    pub fn len(&self) -> usize {
        self.deleted.len() + self.failed.len() + self.retry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn absorb(&mut self, other: ExecutionResult) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
        self.retry.extend(other.retry);
    }
}

/// Whether the platform's batch delete is usable.
///
/// Moves out of `Unknown` at most once and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchCapability {
    Unknown = 0,
    Supported = 1,
    Unsupported = 2,
}

impl BatchCapability {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BatchCapability::Supported,
            2 => BatchCapability::Unsupported,
            _ => BatchCapability::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_batch_size: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            retry_base_delay: config.retry_base_delay(),
            retry_max_delay: config.retry_max_delay(),
        }
    }
}

pub struct DeleteExecutor {
    config: ExecutorConfig,
    capability: AtomicU8,
}

impl DeleteExecutor {
    pub fn new(mut config: ExecutorConfig) -> Self {
        config.max_batch_size = config.max_batch_size.clamp(1, PLATFORM_BATCH_LIMIT);
        config.retry_max_delay = config.retry_max_delay.max(MIN_RETRY_DELAY);
        Self {
            config,
            capability: AtomicU8::new(BatchCapability::Unknown as u8),
        }
    }

    pub fn capability(&self) -> BatchCapability {
        BatchCapability::from_u8(self.capability.load(Ordering::Acquire))
    }

    /// Record a capability verdict. Only the first verdict sticks.
    fn settle_capability(&self, verdict: BatchCapability) {
        let _ = self.capability.compare_exchange(
            BatchCapability::Unknown as u8,
            verdict as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Retry delay for an entry that has made `attempt` attempts.
    ///
    /// `base * 2^attempt`, raised to the platform's advertised wait if any,
    /// clamped to `[500ms, retry_max_delay]`.
    pub fn compute_backoff(&self, attempt: u32, advertised: Option<Duration>) -> Duration {
        let ceiling = self.config.retry_max_delay;
        let exponential = self.config.retry_base_delay.as_secs_f64() * 2f64.powi(attempt.min(32) as i32);
        let mut delay = Duration::from_secs_f64(exponential.min(ceiling.as_secs_f64()));
        if let Some(wait) = advertised {
            delay = delay.max(wait);
        }
        delay.clamp(MIN_RETRY_DELAY, ceiling)
    }

    /// Every entry becomes a retry with its own backoff.
    pub fn retry_all(&self, entries: &[ScheduledEntry], advertised: Option<Duration>) -> ExecutionResult {
        ExecutionResult {
            retry: entries
                .iter()
                .map(|entry| RetryDirective {
                    entry: *entry,
                    delay: self.compute_backoff(entry.attempt, advertised),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Delete the given entries of one chat. Never fails; problems become
    /// failed or retry outcomes.
    pub async fn process(
        &self,
        platform: &dyn ChatPlatform,
        chat_id: i64,
        entries: &[ScheduledEntry],
    ) -> ExecutionResult {
        let mut result = ExecutionResult::default();
        for chunk in entries.chunks(self.config.max_batch_size) {
            let outcome = if self.capability() == BatchCapability::Unsupported {
                self.delete_one_by_one(platform, chat_id, chunk).await
            } else {
                self.delete_chunk(platform, chat_id, chunk).await
            };
            result.absorb(outcome);
        }
        result
    }

    async fn delete_chunk(
        &self,
        platform: &dyn ChatPlatform,
        chat_id: i64,
        chunk: &[ScheduledEntry],
    ) -> ExecutionResult {
        let message_ids: Vec<i64> = chunk.iter().map(|e| e.key.message_id).collect();

        match platform.delete_messages(chat_id, &message_ids).await {
            Ok(()) => {
                self.settle_capability(BatchCapability::Supported);
                ExecutionResult {
                    deleted: chunk.to_vec(),
                    ..Default::default()
                }
            }
            Err(PlatformError::Unsupported) => {
                if self.capability() == BatchCapability::Unknown {
                    tracing::info!(
                        platform = platform.name(),
                        "Batch delete unavailable, switching to single deletes"
                    );
                }
                self.settle_capability(BatchCapability::Unsupported);
                self.delete_one_by_one(platform, chat_id, chunk).await
            }
            Err(PlatformError::BadRequest(description)) => {
                tracing::debug!(
                    chat_id,
                    message_count = chunk.len(),
                    error = %description,
                    "Batch delete rejected, retrying messages one by one"
                );
                self.delete_one_by_one(platform, chat_id, chunk).await
            }
            Err(PlatformError::Forbidden(description)) => {
                tracing::warn!(
                    chat_id,
                    message_count = chunk.len(),
                    error = %description,
                    "Batch delete forbidden, dropping messages"
                );
                ExecutionResult {
                    failed: chunk.to_vec(),
                    ..Default::default()
                }
            }
            Err(PlatformError::RateLimited { retry_after }) => {
                tracing::debug!(
                    chat_id,
                    message_count = chunk.len(),
                    retry_after_secs = retry_after.as_secs_f64(),
                    "Batch delete rate limited"
                );
                self.retry_all(chunk, Some(retry_after))
            }
            Err(PlatformError::Transient {
                message,
                retry_after,
            }) => {
                tracing::debug!(
                    chat_id,
                    message_count = chunk.len(),
                    error = %message,
                    "Batch delete failed transiently"
                );
                self.retry_all(chunk, retry_after)
            }
        }
    }

    async fn delete_one_by_one(
        &self,
        platform: &dyn ChatPlatform,
        chat_id: i64,
        chunk: &[ScheduledEntry],
    ) -> ExecutionResult {
        let mut result = ExecutionResult::default();

        for (position, entry) in chunk.iter().enumerate() {
            match platform.delete_message(chat_id, entry.key.message_id).await {
                Ok(()) => result.deleted.push(*entry),
                Err(PlatformError::BadRequest(description)) if is_already_gone(&description) => {
                    result.deleted.push(*entry)
                }
                Err(PlatformError::RateLimited { retry_after }) => {
                    // The chat is throttled; the rest of the chunk waits too
                    result.absorb(self.retry_all(&chunk[position..], Some(retry_after)));
                    break;
                }
                Err(PlatformError::Transient { retry_after, .. }) => {
                    result.retry.push(RetryDirective {
                        entry: *entry,
                        delay: self.compute_backoff(entry.attempt, retry_after),
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        chat_id,
                        message_id = entry.key.message_id,
                        error = %error,
                        "Message delete refused"
                    );
                    result.failed.push(*entry);
                }
            }
        }

        result
    }
}
