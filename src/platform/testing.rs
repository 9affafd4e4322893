//! Scripted platform for exercising the executor and scheduler.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{ChatPlatform, PlatformError};

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub at: Instant,
    pub chat_id: i64,
    pub message_ids: Vec<i64>,
    pub batch: bool,
}

/// Replays queued outcomes, then falls back to a fixed outcome.
///
/// Defaults to success for both operations.
#[derive(Default)]
pub(crate) struct ScriptedPlatform {
    batch_script: Mutex<VecDeque<Result<(), PlatformError>>>,
    single_script: Mutex<VecDeque<Result<(), PlatformError>>>,
    batch_fallback: Mutex<Option<PlatformError>>,
    single_fallback: Mutex<Option<PlatformError>>,
    panic_on_batch: AtomicBool,
    hold: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, outcome: Result<(), PlatformError>) -> &Self {
        self.batch_script.lock().push_back(outcome);
        self
    }

    pub fn push_single(&self, outcome: Result<(), PlatformError>) -> &Self {
        self.single_script.lock().push_back(outcome);
        self
    }

    pub fn fail_batch_with(&self, error: PlatformError) -> &Self {
        *self.batch_fallback.lock() = Some(error);
        self
    }

    pub fn fail_single_with(&self, error: PlatformError) -> &Self {
        *self.single_fallback.lock() = Some(error);
        self
    }

    pub fn panic_on_batch(&self, enabled: bool) {
        self.panic_on_batch.store(enabled, Ordering::SeqCst);
    }

    /// Keep every call open for `duration` before it resolves.
    pub fn hold_calls_for(&self, duration: Duration) -> &Self {
        *self.hold.lock() = Some(duration);
        self
    }

    /// Most calls that were open at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn batch_calls(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.batch).collect()
    }

    pub fn single_calls(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| !c.batch).collect()
    }

    fn record(&self, chat_id: i64, message_ids: &[i64], batch: bool) {
        self.calls.lock().push(RecordedCall {
            at: Instant::now(),
            chat_id,
            message_ids: message_ids.to_vec(),
            batch,
        });
    }

    async fn hold(&self) {
        let open = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(open, Ordering::SeqCst);
        let hold = *self.hold.lock();
        if let Some(duration) = hold {
            tokio::time::sleep(duration).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn next_outcome(
        script: &Mutex<VecDeque<Result<(), PlatformError>>>,
        fallback: &Mutex<Option<PlatformError>>,
    ) -> Result<(), PlatformError> {
        if let Some(outcome) = script.lock().pop_front() {
            return outcome;
        }
        match fallback.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChatPlatform for ScriptedPlatform {
    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), PlatformError> {
        self.record(chat_id, &[message_id], false);
        self.hold().await;
        Self::next_outcome(&self.single_script, &self.single_fallback)
    }

    async fn delete_messages(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<(), PlatformError> {
        self.record(chat_id, message_ids, true);
        self.hold().await;
        if self.panic_on_batch.load(Ordering::SeqCst) {
            panic!("scripted batch panic");
        }
        Self::next_outcome(&self.batch_script, &self.batch_fallback)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
