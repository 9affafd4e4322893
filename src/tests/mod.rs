//! Scenario tests that drive the scheduler end to end against a scripted
//! platform, on a paused clock.

mod scheduler;

use std::{sync::Arc, time::Duration};

use crate::{
    config::{EngineConfig, PersistenceConfig, StoreKind},
    engine::DeleteScheduler,
    persistence::PendingStore,
};

pub(crate) const TICK: Duration = Duration::from_millis(200);

/// One-second delay, 200ms ticks, 0.5s retry base.
pub(crate) fn engine_config() -> EngineConfig {
    EngineConfig {
        delete_delay_secs: 1,
        tick_interval_ms: TICK.as_millis() as u64,
        retry_base_delay_secs: 0.5,
        ..Default::default()
    }
}

pub(crate) fn scheduler(engine: &EngineConfig) -> DeleteScheduler {
    DeleteScheduler::new(engine, &PersistenceConfig::default(), None).unwrap()
}

pub(crate) fn persistent_scheduler(
    engine: &EngineConfig,
    store: Arc<dyn PendingStore>,
) -> DeleteScheduler {
    let persistence = PersistenceConfig {
        enabled: true,
        store: StoreKind::Memory,
        ..Default::default()
    };
    DeleteScheduler::new(engine, &persistence, Some(store)).unwrap()
}
