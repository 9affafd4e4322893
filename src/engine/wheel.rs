//! Hashed timing wheel.
//!
//! Slot for a due time is `floor((due - epoch) / tick) mod slots`. The wheel
//! keeps an absolute cursor (ticks since epoch) for the next slot to visit.
//! An entry whose slot the cursor has already passed goes into the cursor's
//! slot instead, so it is seen on the next advance rather than a full
//! revolution later.

use std::time::Duration;

use tokio::time::Instant;

use crate::executor::ScheduledEntry;

/// Minimum slot count regardless of configured span.
const MIN_SLOTS: usize = 512;

/// Upper slot count. Longer delays take extra revolutions instead.
const MAX_SLOTS: usize = 1 << 16;

/// Headroom added to the longest expected delay when sizing the wheel.
const SPAN_MARGIN: Duration = Duration::from_secs(10);

pub(crate) struct TimingWheel {
    slots: Vec<Vec<ScheduledEntry>>,
    epoch: Instant,
    tick: Duration,
    cursor: u64,
    len: usize,
}

impl TimingWheel {
    pub fn new(epoch: Instant, tick: Duration, slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count.max(1)).map(|_| Vec::new()).collect(),
            epoch,
            tick,
            cursor: 0,
            len: 0,
        }
    }

    /// Enough slots that one revolution covers the default delay plus the
    /// longest retry, so most entries are visited only once.
    pub fn slot_count_for(delete_delay: Duration, retry_max_delay: Duration, tick: Duration) -> usize {
        let span = delete_delay + retry_max_delay + SPAN_MARGIN;
        let ticks = span.as_nanos().div_ceil(tick.as_nanos().max(1)) + 1;
        usize::try_from(ticks)
            .unwrap_or(MAX_SLOTS)
            .clamp(MIN_SLOTS, MAX_SLOTS)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn absolute_tick(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.epoch).as_nanos();
        u64::try_from(elapsed / self.tick.as_nanos().max(1)).unwrap_or(u64::MAX)
    }

    fn slot_index(&self, absolute: u64) -> usize {
        (absolute % self.slots.len() as u64) as usize
    }

    pub fn insert(&mut self, entry: ScheduledEntry) {
        let absolute = self.absolute_tick(entry.due_at).max(self.cursor);
        let index = self.slot_index(absolute);
        self.slots[index].push(entry);
        self.len += 1;
    }

    /// Visit every slot from the cursor up to `now`'s slot and return the
    /// entries due by `now + tick / 2`.
    ///
    /// Entries that are not yet due are re-inserted at their real slot.
    /// A lagging cursor catches up in one call; at most one full revolution
    /// is visited since that already covers every slot.
    pub fn advance(&mut self, now: Instant) -> Vec<ScheduledEntry> {
        let target = self.absolute_tick(now);
        if self.cursor > target {
            return Vec::new();
        }

        let slot_count = self.slots.len() as u64;
        let span = (target - self.cursor + 1).min(slot_count);
        let threshold = now + self.tick / 2;

        let mut due = Vec::new();
        let mut deferred = Vec::new();
        for offset in 0..span {
            let index = self.slot_index(self.cursor + offset);
            for entry in std::mem::take(&mut self.slots[index]) {
                if entry.due_at <= threshold {
                    due.push(entry);
                } else {
                    deferred.push(entry);
                }
            }
        }

        self.len -= due.len() + deferred.len();
        self.cursor = target + 1;
        for entry in deferred {
            self.insert(entry);
        }

        due
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EntryKey;

    const TICK: Duration = Duration::from_millis(200);

    fn entry(message_id: i64, due_at: Instant) -> ScheduledEntry {
        ScheduledEntry {
            key: EntryKey::new(1, message_id),
            due_at,
            attempt: 0,
        }
    }

    fn ids(entries: &[ScheduledEntry]) -> Vec<i64> {
        let mut ids: Vec<i64> = entries.iter().map(|e| e.key.message_id).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_slot_count_minimum() {
        let count = TimingWheel::slot_count_for(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        assert_eq!(count, 512);
    }

    #[test]
    fn test_slot_count_covers_span() {
        // (35 + 35 + 10) s at 100 ms = 800 ticks, plus one
        let count = TimingWheel::slot_count_for(
            Duration::from_secs(35),
            Duration::from_secs(35),
            Duration::from_millis(100),
        );
        assert_eq!(count, 801);
    }

    #[test]
    fn test_slot_count_is_capped() {
        let count = TimingWheel::slot_count_for(
            Duration::from_secs(7 * 24 * 3600),
            Duration::from_secs(3600),
            Duration::from_millis(50),
        );
        assert_eq!(count, MAX_SLOTS);
    }

    #[test]
    fn test_entry_fires_on_its_tick() {
        let epoch = Instant::now();
        let mut wheel = TimingWheel::new(epoch, TICK, 512);
        wheel.insert(entry(1, epoch + Duration::from_millis(1000)));

        for tick in 0..5 {
            let now = epoch + TICK * tick;
            assert!(wheel.advance(now).is_empty(), "fired early at tick {tick}");
        }
        let fired = wheel.advance(epoch + TICK * 5);
        assert_eq!(ids(&fired), vec![1]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_half_tick_tolerance() {
        let epoch = Instant::now();
        let mut wheel = TimingWheel::new(epoch, TICK, 512);
        // Same slot, one within half a tick of the visit, one beyond it
        wheel.insert(entry(1, epoch + Duration::from_millis(1050)));
        wheel.insert(entry(2, epoch + Duration::from_millis(1150)));

        let fired = wheel.advance(epoch + Duration::from_millis(1000));
        assert_eq!(ids(&fired), vec![1]);
        assert_eq!(wheel.len(), 1);

        let fired = wheel.advance(epoch + Duration::from_millis(1200));
        assert_eq!(ids(&fired), vec![2]);
    }

    #[test]
    fn test_future_revolution_is_reinserted() {
        let epoch = Instant::now();
        let mut wheel = TimingWheel::new(epoch, TICK, 512);
        // Shares slot 3 with an entry one revolution later
        let revolution = TICK * 512;
        wheel.insert(entry(1, epoch + TICK * 3));
        wheel.insert(entry(2, epoch + TICK * 3 + revolution));

        let mut fired = Vec::new();
        for tick in 0..=3 {
            fired.extend(wheel.advance(epoch + TICK * tick));
        }
        assert_eq!(ids(&fired), vec![1]);
        assert_eq!(wheel.len(), 1);

        let fired = wheel.advance(epoch + TICK * 3 + revolution);
        assert_eq!(ids(&fired), vec![2]);
    }

    #[test]
    fn test_lagging_cursor_catches_up() {
        let epoch = Instant::now();
        let mut wheel = TimingWheel::new(epoch, TICK, 512);
        wheel.insert(entry(1, epoch + TICK * 2));
        wheel.insert(entry(2, epoch + TICK * 7));
        wheel.insert(entry(3, epoch + TICK * 30));

        let fired = wheel.advance(epoch + TICK * 10);
        assert_eq!(ids(&fired), vec![1, 2]);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn test_insert_behind_cursor_is_not_stranded() {
        let epoch = Instant::now();
        let mut wheel = TimingWheel::new(epoch, TICK, 512);
        wheel.advance(epoch + TICK * 10);

        // Due time already passed relative to the cursor
        wheel.insert(entry(1, epoch + TICK * 4));
        let fired = wheel.advance(epoch + TICK * 11);
        assert_eq!(ids(&fired), vec![1]);
    }

    #[test]
    fn test_long_stall_sweeps_whole_wheel() {
        let epoch = Instant::now();
        let mut wheel = TimingWheel::new(epoch, TICK, 512);
        wheel.insert(entry(1, epoch + TICK * 5));
        wheel.insert(entry(2, epoch + TICK * 600));
        wheel.insert(entry(3, epoch + TICK * 900));

        let fired = wheel.advance(epoch + TICK * 2000);
        assert_eq!(ids(&fired), vec![1, 2, 3]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_clear() {
        let epoch = Instant::now();
        let mut wheel = TimingWheel::new(epoch, TICK, 512);
        wheel.insert(entry(1, epoch + TICK));
        wheel.insert(entry(2, epoch + TICK * 2));
        wheel.clear();
        assert!(wheel.is_empty());
        assert!(wheel.advance(epoch + TICK * 5).is_empty());
    }
}
