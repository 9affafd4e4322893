//! Deferred chat-message deletion.
//!
//! Messages are scheduled for deletion after a delay, held in a timing wheel,
//! and deleted in per-chat batches through a [`platform::ChatPlatform`]
//! binding. Pending entries can be mirrored to a durable store so a restart
//! picks up where the previous process stopped.

pub mod config;
pub mod engine;
pub mod executor;
pub mod observability;
pub mod persistence;
pub mod platform;
pub mod routes;

#[cfg(test)]
mod tests;

pub use engine::{DeleteScheduler, MetricsSnapshot, ScheduleKind};
