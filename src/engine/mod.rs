//! Scheduling engine.
//!
//! [`DeleteScheduler`] owns the pending-entry index and the timing wheel.
//! A tick loop pulls due entries out of the wheel, groups them by chat, and
//! hands each group to the [`DeleteExecutor`] on its own task, bounded by a
//! semaphore. Results are then applied back under the engine lock: finished
//! entries leave the index and retries go back into the wheel.
//!
//! Index, wheel and counters share one lock that is never held across an
//! await. Persistence mutations are queued after the lock is released.

mod metrics;
mod wheel;

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
pub use metrics::MetricsSnapshot;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Semaphore, mpsc::Receiver},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use self::{metrics::EngineMetrics, wheel::TimingWheel};
use crate::{
    config::{ConfigError, EngineConfig, PersistenceConfig},
    executor::{
        DeleteExecutor, EntryKey, ExecutionResult, ExecutorConfig, RetryDirective, ScheduledEntry,
    },
    observability,
    persistence::{
        PendingMutation, PendingStore, PersistenceQueue, PersistenceSettings, start_flush_worker,
    },
    platform::ChatPlatform,
};

/// What kind of message a schedule request refers to. Only affects counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    BotContent,
    Sticker,
    Other,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::BotContent => "bot_content",
            ScheduleKind::Sticker => "sticker",
            ScheduleKind::Other => "other",
        }
    }
}

/// Deferred message deletion service.
///
/// Cheap to clone; clones share one engine. Construct one per process at the
/// composition root and pass it to whatever needs to schedule deletions.
#[derive(Clone)]
pub struct DeleteScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: EngineConfig,
    executor: DeleteExecutor,
    persistence: Option<Persistence>,
    state: Mutex<EngineState>,
    platform: RwLock<Option<Arc<dyn ChatPlatform>>>,
    dispatch_permits: Semaphore,
    dispatches: TaskTracker,
    shutting_down: AtomicBool,
    /// Serializes `start` and `shutdown`. `Some` while running.
    lifecycle: tokio::sync::Mutex<Option<BackgroundTasks>>,
}

struct Persistence {
    store: Arc<dyn PendingStore>,
    queue: PersistenceQueue,
    settings: PersistenceSettings,
}

struct EngineState {
    index: HashMap<EntryKey, ScheduledEntry>,
    wheel: TimingWheel,
    metrics: EngineMetrics,
}

struct BackgroundTasks {
    shutdown: CancellationToken,
    tick_loop: JoinHandle<()>,
    metrics_loop: JoinHandle<()>,
    flush_worker: Option<FlushWorker>,
}

struct FlushWorker {
    shutdown: CancellationToken,
    handle: JoinHandle<Receiver<PendingMutation>>,
}

impl DeleteScheduler {
    /// Validate configuration and build an idle scheduler.
    ///
    /// A store is required when persistence is enabled and ignored otherwise.
    pub fn new(
        engine: &EngineConfig,
        persistence: &PersistenceConfig,
        store: Option<Arc<dyn PendingStore>>,
    ) -> Result<Self, ConfigError> {
        engine.validate()?;
        persistence.validate()?;

        let persistence = match (persistence.enabled, store) {
            (false, _) => None,
            (true, Some(store)) => Some(Persistence {
                store,
                queue: PersistenceQueue::new(persistence.queue_capacity),
                settings: PersistenceSettings::from(persistence),
            }),
            (true, None) => {
                return Err(ConfigError::Validation(
                    "persistence is enabled but no store was provided".into(),
                ));
            }
        };

        let tick = engine.tick_interval();
        let slot_count =
            TimingWheel::slot_count_for(engine.delete_delay(), engine.retry_max_delay(), tick);

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config: engine.clone(),
                executor: DeleteExecutor::new(ExecutorConfig::from(engine)),
                persistence,
                state: Mutex::new(EngineState {
                    index: HashMap::new(),
                    wheel: TimingWheel::new(Instant::now(), tick, slot_count),
                    metrics: EngineMetrics::default(),
                }),
                platform: RwLock::new(None),
                dispatch_permits: Semaphore::new(engine.worker_concurrency),
                dispatches: TaskTracker::new(),
                shutting_down: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Bind the platform and start the background loops.
    ///
    /// When already running only the platform handle is replaced. With
    /// persistence enabled, pending records are restored into the wheel
    /// before the first tick. Store failures are logged, never returned.
    pub async fn start(&self, platform: Arc<dyn ChatPlatform>) {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        let platform_name = platform.name();
        *inner.platform.write() = Some(platform);

        if lifecycle.is_some() {
            tracing::debug!(platform = platform_name, "Delete scheduler already running, platform handle refreshed");
            return;
        }

        inner.shutting_down.store(false, Ordering::Release);
        inner.dispatches.reopen();

        let flush_worker = match &inner.persistence {
            Some(persistence) => {
                inner.restore(persistence).await;
                match persistence.queue.take_receiver() {
                    Some(receiver) => {
                        let shutdown = CancellationToken::new();
                        let handle = start_flush_worker(
                            receiver,
                            Arc::clone(&persistence.store),
                            persistence.settings.clone(),
                            shutdown.clone(),
                        );
                        Some(FlushWorker { shutdown, handle })
                    }
                    None => {
                        tracing::warn!("Persistence queue has no receiver, mutations will not be written");
                        None
                    }
                }
            }
            None => None,
        };

        let shutdown = CancellationToken::new();
        let tick_loop = tokio::spawn(run_tick_loop(Arc::clone(inner), shutdown.clone()));
        let metrics_loop = tokio::spawn(run_metrics_loop(Arc::clone(inner), shutdown.clone()));

        *lifecycle = Some(BackgroundTasks {
            shutdown,
            tick_loop,
            metrics_loop,
            flush_worker,
        });

        tracing::info!(
            platform = platform_name,
            tick_ms = inner.config.tick_interval_ms,
            slots = inner.state.lock().wheel.slot_count(),
            worker_concurrency = inner.config.worker_concurrency,
            persistence = inner.persistence.is_some(),
            "Delete scheduler started"
        );
    }

    /// Schedule `message_id` in `chat_id` for deletion after `delay`
    /// (the configured default when `None`).
    ///
    /// Returns `false` if the message is already pending, the scheduler is
    /// shutting down, or the delay does not fit the clock. Entries accepted before [`start`](Self::start) wait in
    /// the wheel until the tick loop runs.
    pub fn schedule(
        &self,
        chat_id: i64,
        message_id: i64,
        delay: Option<Duration>,
        kind: ScheduleKind,
    ) -> bool {
        let inner = &self.inner;
        let key = EntryKey::new(chat_id, message_id);
        let delay = delay.unwrap_or_else(|| inner.config.delete_delay());
        let Some(due_at) = Instant::now().checked_add(delay) else {
            tracing::warn!(
                chat_id,
                message_id,
                delay_secs = delay.as_secs(),
                "Delete delay out of range, request ignored"
            );
            return false;
        };

        let entry = {
            let mut state = inner.state.lock();
            if inner.shutting_down.load(Ordering::Acquire) {
                return false;
            }
            if state.index.contains_key(&key) {
                state.metrics.record_duplicate();
                drop(state);
                observability::metrics::record_schedule(kind.as_str(), false);
                return false;
            }

            let entry = ScheduledEntry {
                key,
                due_at,
                attempt: 0,
            };
            state.index.insert(key, entry);
            state.wheel.insert(entry);
            state.metrics.record_scheduled(kind);
            entry
        };

        observability::metrics::record_schedule(kind.as_str(), true);
        inner.persist_upsert(&entry);
        true
    }

    /// Stop intake, cancel the loops, wait for in-flight deletes, drain the
    /// persistence queue, then forget every pending entry.
    ///
    /// Counters are kept. A later [`start`](Self::start) begins from an empty
    /// wheel (plus whatever persistence restores).
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        inner.shutting_down.store(true, Ordering::Release);

        if let Some(tasks) = lifecycle.take() {
            tasks.shutdown.cancel();
            for (name, handle) in [("tick", tasks.tick_loop), ("metrics", tasks.metrics_loop)] {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, task = name, "Background loop ended abnormally");
                }
            }

            inner.dispatches.close();
            inner.dispatches.wait().await;

            if let Some(worker) = tasks.flush_worker {
                worker.shutdown.cancel();
                match worker.handle.await {
                    Ok(receiver) => {
                        if let Some(persistence) = &inner.persistence {
                            persistence.queue.restore_receiver(receiver);
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Persistence worker failed, unflushed mutations are lost");
                    }
                }
            }
        }

        {
            let mut state = inner.state.lock();
            state.index.clear();
            state.wheel.clear();
        }
        *inner.platform.write() = None;

        tracing::info!("Delete scheduler stopped");
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.snapshot()
    }

    /// Copy of the pending entry for a message, if any.
    pub fn pending_entry(&self, chat_id: i64, message_id: i64) -> Option<ScheduledEntry> {
        self.inner
            .state
            .lock()
            .index
            .get(&EntryKey::new(chat_id, message_id))
            .copied()
    }
}

impl SchedulerInner {
    fn snapshot(&self) -> MetricsSnapshot {
        let dropped = self
            .persistence
            .as_ref()
            .map_or(0, |p| p.queue.dropped_count());
        let state = self.state.lock();
        state.metrics.snapshot(state.index.len(), dropped)
    }

    fn persist_upsert(&self, entry: &ScheduledEntry) {
        if let Some(persistence) = &self.persistence {
            persistence.queue.push(PendingMutation::Upsert {
                key: entry.key,
                due_at: wall_clock(entry.due_at),
                attempt: entry.attempt,
            });
        }
    }

    fn persist_all(&self, mutations: Vec<PendingMutation>) {
        if let Some(persistence) = &self.persistence {
            for mutation in mutations {
                persistence.queue.push(mutation);
            }
        }
    }

    /// Rehydrate the wheel from the store.
    async fn restore(&self, persistence: &Persistence) {
        let store = &persistence.store;
        if let Err(e) = store.ensure_schema().await {
            tracing::error!(error = %e, store = store.name(), "Failed to prepare persistence store, skipping restore");
            return;
        }

        let now_wall = Utc::now();
        let records = match store
            .load_pending(now_wall, persistence.settings.restore_limit)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, store = store.name(), "Failed to load pending deletions");
                return;
            }
        };

        let now = Instant::now();
        let mut restored = 0usize;
        {
            let mut state = self.state.lock();
            for record in records {
                if state.index.contains_key(&record.key) {
                    continue;
                }
                // Past-due records fire on the next tick
                let delay = (record.due_at - now_wall).to_std().unwrap_or(Duration::ZERO);
                let entry = ScheduledEntry {
                    key: record.key,
                    due_at: now + delay,
                    attempt: record.attempt,
                };
                state.index.insert(entry.key, entry);
                state.wheel.insert(entry);
                state.metrics.record_restored();
                restored += 1;
            }
        }

        tracing::info!(restored, store = store.name(), "Restored pending deletions");
    }

    /// Pull due entries from the wheel and spawn one dispatch per chat.
    fn dispatch_due(self: &Arc<Self>, now: Instant) {
        let due = self.state.lock().wheel.advance(now);
        if due.is_empty() {
            return;
        }

        let Some(platform) = self.platform.read().clone() else {
            let mut state = self.state.lock();
            for entry in due {
                state.wheel.insert(entry);
            }
            return;
        };

        let mut groups: HashMap<i64, Vec<ScheduledEntry>> = HashMap::new();
        for entry in due {
            groups.entry(entry.key.chat_id).or_default().push(entry);
        }

        for (chat_id, mut entries) in groups {
            entries.sort_by_key(|e| (e.due_at, e.key.message_id));
            let inner = Arc::clone(self);
            let platform = Arc::clone(&platform);
            self.dispatches.spawn(async move {
                inner.dispatch_group(platform, chat_id, entries).await;
            });
        }
    }

    async fn dispatch_group(
        &self,
        platform: Arc<dyn ChatPlatform>,
        chat_id: i64,
        entries: Vec<ScheduledEntry>,
    ) {
        let result = match self.dispatch_permits.acquire().await {
            Ok(_permit) => {
                let outcome = AssertUnwindSafe(self.executor.process(
                    platform.as_ref(),
                    chat_id,
                    &entries,
                ))
                .catch_unwind()
                .await;

                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!(
                            chat_id,
                            message_count = entries.len(),
                            "Delete executor panicked, scheduling retries"
                        );
                        self.executor.retry_all(&entries, None)
                    }
                }
            }
            Err(_) => self.executor.retry_all(&entries, None),
        };

        self.apply_result(result);
    }

    fn apply_result(&self, result: ExecutionResult) {
        let now = Instant::now();
        let max_attempts = self.config.max_retry_attempts;
        let deleted = result.deleted.len();
        let failed = result.failed.len();
        let mut retried = 0usize;
        let mut exhausted = 0usize;
        let mut mutations = Vec::with_capacity(result.len());

        {
            let mut state = self.state.lock();

            for entry in result.deleted {
                state.index.remove(&entry.key);
                let drift = now.saturating_duration_since(entry.due_at);
                state.metrics.record_deleted(drift);
                observability::metrics::record_delete_drift(drift.as_secs_f64());
                mutations.push(PendingMutation::Delete { key: entry.key });
            }

            for entry in result.failed {
                state.index.remove(&entry.key);
                state.metrics.record_failed();
                mutations.push(PendingMutation::Delete { key: entry.key });
            }

            for RetryDirective { entry, delay } in result.retry {
                // Gone from the index means a shutdown cleared it
                if !state.index.contains_key(&entry.key) {
                    continue;
                }

                let attempt = entry.attempt + 1;
                if attempt > max_attempts {
                    state.index.remove(&entry.key);
                    state.metrics.record_failed();
                    mutations.push(PendingMutation::Delete { key: entry.key });
                    exhausted += 1;
                    continue;
                }

                // Retry delays never exceed the configured ceiling
                let next = ScheduledEntry {
                    key: entry.key,
                    due_at: now.checked_add(delay).unwrap_or(now),
                    attempt,
                };
                state.index.insert(next.key, next);
                state.wheel.insert(next);
                mutations.push(PendingMutation::Upsert {
                    key: next.key,
                    due_at: wall_clock(next.due_at),
                    attempt,
                });
                retried += 1;
            }
        }

        self.persist_all(mutations);

        observability::metrics::record_delete_outcome("deleted", deleted);
        observability::metrics::record_delete_outcome("failed", failed);
        observability::metrics::record_delete_outcome("retry", retried);
        observability::metrics::record_delete_outcome("exhausted", exhausted);

        if retried > 0 {
            tracing::debug!(retried, "Entries scheduled for retry");
        }
        if exhausted > 0 {
            tracing::warn!(exhausted, max_attempts, "Entries dropped after exhausting retries");
        }
    }

    fn log_metrics(&self) {
        let snapshot = self.snapshot();
        observability::metrics::record_pending(snapshot.pending);
        tracing::info!(
            scheduled = snapshot.scheduled,
            bot_content_scheduled = snapshot.bot_content_scheduled,
            sticker_scheduled = snapshot.sticker_scheduled,
            deleted = snapshot.deleted,
            failed = snapshot.failed,
            duplicate = snapshot.duplicate,
            restored = snapshot.restored,
            pending = snapshot.pending,
            persistence_dropped = snapshot.persistence_dropped,
            avg_drift_ms = snapshot.avg_drift_ms,
            "Delete scheduler metrics"
        );
    }
}

async fn run_tick_loop(inner: Arc<SchedulerInner>, shutdown: CancellationToken) {
    let tick = inner.config.tick_interval();
    let mut next_tick = Instant::now() + tick;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(next_tick) => {}
        }

        let now = Instant::now();
        inner.dispatch_due(now);

        let following = next_tick_after(next_tick, now, tick);
        if following > next_tick + tick {
            let lag = now.saturating_duration_since(next_tick);
            tracing::debug!(lag_ms = lag.as_millis() as u64, "Tick loop behind schedule, resynchronizing");
        }
        next_tick = following;
    }
}

/// Deadline after the tick that was due at `scheduled` ran at `now`.
///
/// Short lag keeps the fixed cadence. More than three ticks behind restarts
/// it from `now`, since the wheel advance already caught up every slot.
fn next_tick_after(scheduled: Instant, now: Instant, tick: Duration) -> Instant {
    if now.saturating_duration_since(scheduled) > tick * 3 {
        now + tick
    } else {
        scheduled + tick
    }
}

async fn run_metrics_loop(inner: Arc<SchedulerInner>, shutdown: CancellationToken) {
    let period = inner.config.metrics_log_interval();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => inner.log_metrics(),
        }
    }
}

/// Wall-clock time corresponding to a monotonic instant.
fn wall_clock(at: Instant) -> DateTime<Utc> {
    let now = Instant::now();
    let wall = Utc::now();
    if at >= now {
        TimeDelta::from_std(at - now)
            .ok()
            .and_then(|ahead| wall.checked_add_signed(ahead))
            .unwrap_or(wall)
    } else {
        TimeDelta::from_std(now - at)
            .ok()
            .and_then(|behind| wall.checked_sub_signed(behind))
            .unwrap_or(wall)
    }
}
