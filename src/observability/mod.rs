//! Observability: structured logging and optional Prometheus metrics.

pub mod metrics;
mod tracing_init;

pub use tracing_init::*;
