use std::time::Duration;

use serde::Serialize;

use super::ScheduleKind;

/// Counters owned by the scheduler and only touched under its lock.
#[derive(Debug, Default)]
pub(crate) struct EngineMetrics {
    scheduled: u64,
    bot_content_scheduled: u64,
    sticker_scheduled: u64,
    deleted: u64,
    failed: u64,
    duplicate: u64,
    restored: u64,
    drift_total: Duration,
    drift_samples: u64,
}

impl EngineMetrics {
    pub fn record_scheduled(&mut self, kind: ScheduleKind) {
        self.scheduled += 1;
        match kind {
            ScheduleKind::BotContent => self.bot_content_scheduled += 1,
            ScheduleKind::Sticker => self.sticker_scheduled += 1,
            ScheduleKind::Other => {}
        }
    }

    pub fn record_duplicate(&mut self) {
        self.duplicate += 1;
    }

    pub fn record_restored(&mut self) {
        self.restored += 1;
    }

    pub fn record_deleted(&mut self, drift: Duration) {
        self.deleted += 1;
        self.drift_total += drift;
        self.drift_samples += 1;
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn snapshot(&self, pending: usize, persistence_dropped: u64) -> MetricsSnapshot {
        let avg_drift_ms = if self.drift_samples == 0 {
            0.0
        } else {
            let avg = self.drift_total.as_secs_f64() * 1000.0 / self.drift_samples as f64;
            (avg * 100.0).round() / 100.0
        };

        MetricsSnapshot {
            scheduled: self.scheduled,
            bot_content_scheduled: self.bot_content_scheduled,
            sticker_scheduled: self.sticker_scheduled,
            deleted: self.deleted,
            failed: self.failed,
            duplicate: self.duplicate,
            restored: self.restored,
            pending,
            persistence_dropped,
            avg_drift_ms,
        }
    }
}

/// Point-in-time copy of the scheduler's counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Entries accepted through `schedule`. Restored entries count only
    /// under `restored`.
    pub scheduled: u64,
    pub bot_content_scheduled: u64,
    pub sticker_scheduled: u64,
    pub deleted: u64,
    pub failed: u64,
    pub duplicate: u64,
    pub restored: u64,
    /// Entries currently in the wheel or in flight.
    pub pending: usize,
    /// Persistence mutations lost to a full queue.
    pub persistence_dropped: u64,
    /// Mean lateness of successful deletes, in milliseconds, two decimals.
    pub avg_drift_ms: f64,
}
