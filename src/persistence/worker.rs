//! Bounded mutation queue and its flush worker.
//!
//! ## Behaviour
//! - `push()` never waits; a full queue drops the mutation and counts it
//! - The worker writes whatever is queued in one store call, up to
//!   `flush_batch_size` mutations
//! - On cancellation the worker drains the queue in `drain_batch_size`
//!   batches, stopping at the first store error
//! - The worker hands its receiver back when it exits, so unflushed
//!   mutations survive into the next run

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, Receiver, Sender, error::TrySendError},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{PendingMutation, PendingStore};
use crate::{config::PersistenceConfig, observability::metrics};

/// Drops between two overflow warnings.
const DROP_WARN_EVERY: u64 = 500;

/// Runtime settings for the queue and worker.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub queue_capacity: usize,
    pub flush_batch_size: usize,
    pub drain_batch_size: usize,
    pub ttl: Duration,
    pub purge_interval: Duration,
    pub restore_limit: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self::from(&PersistenceConfig::default())
    }
}

impl From<&PersistenceConfig> for PersistenceSettings {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            flush_batch_size: config.flush_batch_size.max(1),
            drain_batch_size: config.drain_batch_size.max(1),
            ttl: config.ttl(),
            purge_interval: config.purge_interval(),
            restore_limit: config.restore_limit,
        }
    }
}

/// Non-blocking producer side of the persistence channel.
pub struct PersistenceQueue {
    sender: Sender<PendingMutation>,
    /// Present while no worker is running.
    receiver: Mutex<Option<Receiver<PendingMutation>>>,
    capacity: usize,
    dropped_count: AtomicU64,
}

impl PersistenceQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            capacity,
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Queue a mutation, dropping it if the queue is full.
    pub fn push(&self, mutation: PendingMutation) {
        match self.sender.try_send(mutation) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::record_persistence_drop();
                let count = self.dropped_count.fetch_add(1, Ordering::Relaxed);
                if count.is_multiple_of(DROP_WARN_EVERY) {
                    tracing::warn!(
                        dropped_count = count + 1,
                        capacity = self.capacity,
                        "Persistence queue full: dropping mutations (store may be slow/unavailable)"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                // Receiver lost with a failed worker
                metrics::record_persistence_drop();
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Mutations dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Mutations waiting to be written.
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn take_receiver(&self) -> Option<Receiver<PendingMutation>> {
        self.receiver.lock().take()
    }

    pub(crate) fn restore_receiver(&self, receiver: Receiver<PendingMutation>) {
        *self.receiver.lock() = Some(receiver);
    }
}

/// Spawn the flush worker. It runs until `shutdown` is cancelled, drains,
/// then returns the receiver.
pub fn start_flush_worker(
    mut receiver: Receiver<PendingMutation>,
    store: Arc<dyn PendingStore>,
    settings: PersistenceSettings,
    shutdown: CancellationToken,
) -> JoinHandle<Receiver<PendingMutation>> {
    tokio::spawn(async move {
        let mut batch = Vec::with_capacity(settings.flush_batch_size);
        let mut next_purge = Instant::now();

        tracing::debug!(store = store.name(), "Persistence worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => {
                    let Some(first) = received else {
                        break;
                    };
                    batch.push(first);
                    take_available(&mut receiver, &mut batch, settings.flush_batch_size);
                    flush_batch(store.as_ref(), &mut batch, settings.ttl).await;
                }
                _ = tokio::time::sleep_until(next_purge) => {
                    purge_expired(store.as_ref()).await;
                    next_purge = Instant::now() + settings.purge_interval;
                }
            }
        }

        loop {
            take_available(&mut receiver, &mut batch, settings.drain_batch_size);
            if batch.is_empty() {
                break;
            }
            if !flush_batch(store.as_ref(), &mut batch, settings.ttl).await {
                tracing::warn!(
                    remaining = receiver.len(),
                    "Stopping persistence drain after store error"
                );
                break;
            }
        }

        tracing::info!("Persistence worker shutting down");
        receiver
    })
}

/// Move queued mutations into `batch` without waiting, up to `max` total.
fn take_available(receiver: &mut Receiver<PendingMutation>, batch: &mut Vec<PendingMutation>, max: usize) {
    while batch.len() < max {
        match receiver.try_recv() {
            Ok(mutation) => batch.push(mutation),
            Err(_) => break,
        }
    }
}

/// Write `batch` and clear it. Returns whether the write succeeded.
async fn flush_batch(store: &dyn PendingStore, batch: &mut Vec<PendingMutation>, ttl: Duration) -> bool {
    let count = batch.len();
    tracing::debug!(count, "Flushing persistence batch");

    let success = match store.apply_batch(batch, ttl).await {
        Ok(written) => {
            tracing::debug!(written, total = count, "Persistence flush successful");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, count, store = store.name(), "Persistence flush failed");
            false
        }
    };

    metrics::record_persistence_flush(count, success);
    batch.clear();
    success
}

async fn purge_expired(store: &dyn PendingStore) {
    match store.purge_expired(Utc::now()).await {
        Ok(0) => {}
        Ok(purged) => tracing::info!(purged, "Purged expired pending deletions"),
        Err(e) => tracing::error!(error = %e, "Failed to purge expired pending deletions"),
    }
}
