//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by neuropipe and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all neuropipe metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Terminal task outcomes, labeled by status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by task name.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Registered files, labeled by outcome (created/unchanged/superseded/failed).
pub static REGISTRATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// RMS residual of accepted sync fits in seconds, labeled by device.
pub static SYNC_RESIDUAL: OnceLock<HistogramVec> = OnceLock::new();

/// Number of sessions currently being processed.
pub static SESSIONS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording through [`super::MetricsCollector`]
/// before this is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("neuropipe_tasks_total", "Tasks reaching a terminal status"),
        &["status"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "neuropipe_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 7200.0]),
        &["task"],
    )?;

    let registrations_total = CounterVec::new(
        Opts::new("neuropipe_registrations_total", "Dataset registration results per file"),
        &["outcome"],
    )?;

    let sync_residual = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "neuropipe_sync_residual_seconds",
            "RMS residual of accepted clock fits",
        )
        .buckets(vec![1e-6, 1e-5, 1e-4, 2.5e-4, 1e-3, 5e-3]),
        &["device"],
    )?;

    let sessions_in_progress = Gauge::new(
        "neuropipe_sessions_in_progress",
        "Number of sessions currently being processed",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(registrations_total.clone()))?;
    registry.register(Box::new(sync_residual.clone()))?;
    registry.register(Box::new(sessions_in_progress.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = REGISTRATIONS_TOTAL.set(registrations_total);
    let _ = SYNC_RESIDUAL.set(sync_residual);
    let _ = SESSIONS_IN_PROGRESS.set(sessions_in_progress);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
