use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, sleep};

use super::{TICK, engine_config, scheduler};
use crate::{
    config::EngineConfig,
    engine::ScheduleKind,
    platform::{PlatformError, testing::ScriptedPlatform},
};

fn transient() -> PlatformError {
    PlatformError::Transient {
        message: "Bad Gateway".into(),
        retry_after: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_deletes_land_within_one_tick_of_due() {
    let platform = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    assert!(scheduler.schedule(-100, 7, None, ScheduleKind::BotContent));
    let due = scheduler.pending_entry(-100, 7).unwrap().due_at;
    assert_eq!(due, Instant::now() + Duration::from_secs(1));

    sleep(Duration::from_secs(3)).await;

    let calls = platform.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].at + TICK / 2 >= due);
    assert!(calls[0].at <= due + TICK);

    let snapshot = scheduler.metrics_snapshot();
    assert_eq!(snapshot.deleted, 1);
    assert_eq!(snapshot.pending, 0);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_keeps_original_due_time() {
    let platform = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    assert!(scheduler.schedule(1, 1, Some(Duration::from_secs(5)), ScheduleKind::Sticker));
    let first = scheduler.pending_entry(1, 1).unwrap();

    sleep(Duration::from_secs(1)).await;
    assert!(!scheduler.schedule(1, 1, Some(Duration::from_secs(30)), ScheduleKind::Sticker));
    assert_eq!(scheduler.pending_entry(1, 1).unwrap().due_at, first.due_at);

    let snapshot = scheduler.metrics_snapshot();
    assert_eq!(snapshot.scheduled, 1);
    assert_eq!(snapshot.sticker_scheduled, 1);
    assert_eq!(snapshot.duplicate, 1);
    assert_eq!(snapshot.pending, 1);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_large_chat_splits_into_three_batches() {
    let platform = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    for message_id in 1..=250 {
        assert!(scheduler.schedule(42, message_id, None, ScheduleKind::BotContent));
    }

    sleep(Duration::from_secs(2)).await;

    let sizes: Vec<usize> = platform
        .batch_calls()
        .iter()
        .map(|call| call.message_ids.len())
        .collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(scheduler.metrics_snapshot().deleted, 250);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_chats_are_dispatched_separately() {
    let platform = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    scheduler.schedule(1, 10, None, ScheduleKind::BotContent);
    scheduler.schedule(2, 10, None, ScheduleKind::BotContent);
    scheduler.schedule(1, 11, None, ScheduleKind::BotContent);

    sleep(Duration::from_secs(2)).await;

    let mut calls = platform.batch_calls();
    calls.sort_by_key(|call| call.chat_id);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].message_ids, vec![10, 11]);
    assert_eq!(calls[1].chat_id, 2);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_defers_retry_by_advertised_wait() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.push_batch(Err(PlatformError::RateLimited {
        retry_after: Duration::from_secs(10),
    }));
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    scheduler.schedule(5, 1, None, ScheduleKind::BotContent);

    sleep(Duration::from_secs(3)).await;
    let pending = scheduler.pending_entry(5, 1).unwrap();
    assert_eq!(pending.attempt, 1);

    sleep(Duration::from_secs(10)).await;
    let calls = platform.batch_calls();
    assert_eq!(calls.len(), 2);
    let gap = calls[1].at - calls[0].at;
    assert!(gap + TICK / 2 >= Duration::from_secs(10));
    assert!(gap <= Duration::from_secs(10) + TICK);
    assert_eq!(scheduler.metrics_snapshot().deleted, 1);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_between_attempts() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.fail_batch_with(transient());
    let engine = EngineConfig {
        max_retry_attempts: 4,
        ..engine_config()
    };
    let scheduler = scheduler(&engine);
    scheduler.start(platform.clone()).await;

    scheduler.schedule(9, 1, None, ScheduleKind::BotContent);
    sleep(Duration::from_secs(20)).await;

    let calls = platform.batch_calls();
    assert_eq!(calls.len(), 5);
    for (attempt, pair) in calls.windows(2).enumerate() {
        let floor = Duration::from_secs_f64(0.5 * 2f64.powi(attempt as i32));
        let gap = pair[1].at - pair[0].at;
        assert!(gap + TICK / 2 >= floor, "attempt {attempt}: gap {gap:?} below {floor:?}");
        assert!(gap <= floor + TICK, "attempt {attempt}: gap {gap:?} above {floor:?}");
    }
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_counts_one_failure() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.fail_batch_with(transient());
    let engine = EngineConfig {
        max_retry_attempts: 2,
        ..engine_config()
    };
    let scheduler = scheduler(&engine);
    scheduler.start(platform.clone()).await;

    scheduler.schedule(3, 1, None, ScheduleKind::BotContent);
    sleep(Duration::from_secs(10)).await;

    assert_eq!(platform.batch_calls().len(), 3);
    let snapshot = scheduler.metrics_snapshot();
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.deleted, 0);
    assert_eq!(snapshot.pending, 0);
    assert!(scheduler.pending_entry(3, 1).is_none());
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_forbidden_is_terminal() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.fail_batch_with(PlatformError::Forbidden("bot was kicked".into()));
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    scheduler.schedule(3, 1, None, ScheduleKind::BotContent);
    scheduler.schedule(3, 2, None, ScheduleKind::BotContent);
    sleep(Duration::from_secs(5)).await;

    assert_eq!(platform.calls().len(), 1);
    let snapshot = scheduler.metrics_snapshot();
    assert_eq!(snapshot.failed, 2);
    assert_eq!(snapshot.pending, 0);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_batch_switches_to_single_deletes() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.fail_batch_with(PlatformError::Unsupported);
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    for message_id in 1..=3 {
        scheduler.schedule(8, message_id, None, ScheduleKind::Other);
    }
    sleep(Duration::from_secs(2)).await;
    assert_eq!(platform.batch_calls().len(), 1);
    assert_eq!(platform.single_calls().len(), 3);

    for message_id in 4..=5 {
        scheduler.schedule(8, message_id, None, ScheduleKind::Other);
    }
    sleep(Duration::from_secs(2)).await;
    assert_eq!(platform.batch_calls().len(), 1);
    assert_eq!(platform.single_calls().len(), 5);

    assert_eq!(scheduler.metrics_snapshot().deleted, 5);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_executor_panic_becomes_retry() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.panic_on_batch(true);
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    scheduler.schedule(4, 1, None, ScheduleKind::BotContent);
    sleep(Duration::from_millis(1300)).await;

    let pending = scheduler.pending_entry(4, 1).unwrap();
    assert_eq!(pending.attempt, 1);

    platform.panic_on_batch(false);
    sleep(Duration::from_secs(3)).await;

    let snapshot = scheduler.metrics_snapshot();
    assert_eq!(snapshot.deleted, 1);
    assert_eq!(snapshot.failed, 0);
    assert_eq!(snapshot.pending, 0);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_entries_scheduled_before_start_fire_after_start() {
    let platform = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());

    assert!(scheduler.schedule(6, 1, None, ScheduleKind::BotContent));
    sleep(Duration::from_secs(3)).await;
    assert!(platform.calls().is_empty());

    scheduler.start(platform.clone()).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(platform.calls().len(), 1);
    assert_eq!(scheduler.metrics_snapshot().deleted, 1);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_schedule_after_shutdown_is_rejected() {
    let platform = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;
    scheduler.schedule(1, 1, Some(Duration::from_secs(30)), ScheduleKind::BotContent);

    scheduler.shutdown().await;

    assert!(!scheduler.schedule(1, 2, None, ScheduleKind::BotContent));
    let snapshot = scheduler.metrics_snapshot();
    assert_eq!(snapshot.scheduled, 1);
    assert_eq!(snapshot.pending, 0);

    sleep(Duration::from_secs(40)).await;
    assert!(platform.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_keeps_one_tick_loop() {
    let first = Arc::new(ScriptedPlatform::new());
    let second = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());
    scheduler.start(first.clone()).await;
    scheduler.start(second.clone()).await;

    scheduler.schedule(2, 2, None, ScheduleKind::BotContent);
    sleep(Duration::from_secs(2)).await;

    assert!(first.calls().is_empty());
    assert_eq!(second.calls().len(), 1);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_shutdown_accepts_again() {
    let platform = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;
    scheduler.shutdown().await;

    scheduler.start(platform.clone()).await;
    assert!(scheduler.schedule(1, 1, None, ScheduleKind::BotContent));
    sleep(Duration::from_secs(2)).await;

    assert_eq!(scheduler.metrics_snapshot().deleted, 1);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_batch_capability_settles_on_success() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.push_batch(Ok(()));
    platform.push_batch(Err(PlatformError::Unsupported));
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;

    scheduler.schedule(1, 1, None, ScheduleKind::BotContent);
    sleep(Duration::from_secs(2)).await;
    scheduler.schedule(1, 2, None, ScheduleKind::BotContent);
    sleep(Duration::from_secs(2)).await;

    // A later Unsupported falls back once but does not downgrade the verdict
    assert_eq!(platform.single_calls().len(), 1);
    scheduler.schedule(1, 3, None, ScheduleKind::BotContent);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(platform.batch_calls().len(), 3);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_concurrency_is_bounded() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.hold_calls_for(Duration::from_secs(1));
    let engine = EngineConfig {
        worker_concurrency: 2,
        ..engine_config()
    };
    let scheduler = scheduler(&engine);
    scheduler.start(platform.clone()).await;

    for chat_id in 1..=5 {
        scheduler.schedule(chat_id, 1, None, ScheduleKind::BotContent);
    }
    sleep(Duration::from_secs(6)).await;

    assert_eq!(platform.batch_calls().len(), 5);
    assert_eq!(platform.peak_in_flight(), 2);
    assert_eq!(scheduler.metrics_snapshot().deleted, 5);
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_tick_loop_catches_up() {
    let platform = Arc::new(ScriptedPlatform::new());
    let scheduler = scheduler(&engine_config());
    scheduler.start(platform.clone()).await;
    sleep(TICK).await;

    scheduler.schedule(1, 1, None, ScheduleKind::BotContent);
    scheduler.schedule(1, 2, None, ScheduleKind::BotContent);
    scheduler.schedule(1, 3, Some(Duration::from_secs(3)), ScheduleKind::BotContent);

    // Jump the clock past every due time without letting the loop run
    let stalled_at = Instant::now();
    tokio::time::advance(Duration::from_secs(5)).await;
    sleep(TICK * 2).await;

    let calls = platform.batch_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].message_ids, vec![1, 2, 3]);
    assert!(calls[0].at >= stalled_at + Duration::from_secs(5));
    assert_eq!(scheduler.metrics_snapshot().pending, 0);

    // The cadence resumes after the stall
    assert!(scheduler.schedule(1, 4, None, ScheduleKind::BotContent));
    let due = scheduler.pending_entry(1, 4).unwrap().due_at;
    sleep(Duration::from_secs(2)).await;

    let calls = platform.batch_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at + TICK / 2 >= due);
    assert!(calls[1].at <= due + TICK);
    scheduler.shutdown().await;
}
