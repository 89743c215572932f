//! Metrics module for Prometheus-based monitoring.
//!
//! Covers task outcomes and durations, dataset registration results, and
//! clock fit residuals.
//!
//! # Example
//!
//! ```ignore
//! use neuropipe::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_registration("created", 4);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    REGISTRATIONS_TOTAL, REGISTRY, SESSIONS_IN_PROGRESS, SYNC_RESIDUAL, TASKS_TOTAL, TASK_DURATION,
};
