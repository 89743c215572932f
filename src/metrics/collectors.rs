//! Metric recording helpers.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labels. Every method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    REGISTRATIONS_TOTAL, SESSIONS_IN_PROGRESS, SYNC_RESIDUAL, TASKS_TOTAL, TASK_DURATION,
};

/// Records neuropipe operational metrics.
///
/// ```ignore
/// use neuropipe::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_task("SpikeSync_probe00", "complete", 12.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a task reaching a terminal status.
    pub fn record_task(&self, task: &str, status: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task])
                .observe(duration_secs);
        }

        tracing::trace!(
            task = task,
            status = status,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Records `count` files with the same registration outcome.
    pub fn record_registration(&self, outcome: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(registrations) = REGISTRATIONS_TOTAL.get() {
            registrations
                .with_label_values(&[outcome])
                .inc_by(count as f64);
        }
    }

    /// Records the residual of an accepted clock fit.
    pub fn record_sync_residual(&self, device: &str, residual_secs: f64) {
        if let Some(residual) = SYNC_RESIDUAL.get() {
            residual.with_label_values(&[device]).observe(residual_secs);
        }
    }

    pub fn session_started(&self) {
        if let Some(gauge) = SESSIONS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    pub fn session_finished(&self) {
        if let Some(gauge) = SESSIONS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }
}
