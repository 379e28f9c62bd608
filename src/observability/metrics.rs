//! Prometheus counters for the cleanup engine.
//!
//! Every recording function compiles to a no-op without the `prometheus`
//! feature, so callers never need to gate on it.

#[cfg(feature = "prometheus")]
use metrics::counter;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    tracing::info!(listen = %config.listen, "Prometheus metrics listener started");
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

/// Record documents or objects removed by a retention run.
///
/// `target` is `chats`, `announcements` or `objects`.
pub fn record_retention_deletion(target: &str, count: u64) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "retention_deletions_total",
            "target" => target.to_string()
        )
        .increment(count);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (target, count);
    }
}

/// Record a finished run.
///
/// `outcome` is `success`, `partial` or `failed`.
pub fn record_retention_run(trigger: &str, outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "retention_runs_total",
            "trigger" => trigger.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (trigger, outcome);
    }
}

/// Record object keys the store refused to delete.
pub fn record_object_key_errors(count: u64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("retention_object_key_errors_total").increment(count);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = count;
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}
