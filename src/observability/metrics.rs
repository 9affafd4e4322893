//! Prometheus metrics for the deletion pipeline.
//!
//! Mirrors the in-process counters kept by the scheduler so they can be
//! scraped. Every recording function is a no-op without the `prometheus`
//! feature.

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for the metrics endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_seconds".to_string()),
            &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?
        .install_recorder()
        .map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if config.enabled {
        tracing::warn!(
            "Metrics are enabled in config but the 'prometheus' feature is not compiled. \
            Rebuild with: cargo build --features prometheus"
        );
    }
    Ok(())
}

/// Get the Prometheus handle for rendering metrics.
#[cfg(feature = "prometheus")]
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record a schedule request.
///
/// # Arguments
/// * `kind` - Message kind ("bot_content", "sticker", "other")
/// * `accepted` - Whether the entry was added to the wheel
pub fn record_schedule(kind: &str, accepted: bool) {
    #[cfg(feature = "prometheus")]
    {
        let outcome = if accepted { "accepted" } else { "rejected" };
        counter!("reaper_schedule_requests_total", "kind" => kind.to_string(), "outcome" => outcome)
            .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (kind, accepted);
    }
}

/// Record entries leaving a dispatch with a final or retry outcome.
///
/// `outcome` is one of "deleted", "failed", "retry" or "exhausted".
pub fn record_delete_outcome(outcome: &str, count: usize) {
    #[cfg(feature = "prometheus")]
    {
        if count > 0 {
            counter!("reaper_delete_outcomes_total", "outcome" => outcome.to_string())
                .increment(count as u64);
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (outcome, count);
    }
}

/// Record how late a deletion landed relative to its due time.
pub fn record_delete_drift(drift_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        histogram!("reaper_delete_drift_seconds").record(drift_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = drift_secs;
    }
}

/// Record a platform call.
///
/// # Arguments
/// * `method` - "single" or "batch"
/// * `success` - Whether the platform reported success
pub fn record_platform_call(method: &str, success: bool) {
    #[cfg(feature = "prometheus")]
    {
        let status = if success { "ok" } else { "error" };
        counter!("reaper_platform_calls_total", "method" => method.to_string(), "status" => status)
            .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (method, success);
    }
}

/// Record a persistence mutation dropped because the queue was full.
pub fn record_persistence_drop() {
    #[cfg(feature = "prometheus")]
    {
        counter!("reaper_persistence_dropped_total").increment(1);
    }
}

/// Record a persistence flush.
pub fn record_persistence_flush(count: usize, success: bool) {
    #[cfg(feature = "prometheus")]
    {
        let status = if success { "ok" } else { "error" };
        counter!("reaper_persistence_flushed_total", "status" => status).increment(count as u64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (count, success);
    }
}

/// Record the current number of pending entries.
pub fn record_pending(count: usize) {
    #[cfg(feature = "prometheus")]
    {
        gauge!("reaper_pending_entries").set(count as f64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = count;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
