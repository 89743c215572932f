//! Error types for neuropipe operations.
//!
//! Defines the error taxonomy shared by all subsystems:
//! - Session classification
//! - Task graph construction
//! - Extraction logic and clock synchronization
//! - Dataset registration
//! - Repository persistence and configuration

use std::path::PathBuf;

use thiserror::Error;

use crate::graph::TaskStatus;

/// Errors raised while locating and classifying a raw session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session root '{0}' does not exist or is not a directory")]
    MissingRoot(PathBuf),

    #[error("Unrecognized session at '{path}': {reason}")]
    UnrecognizedSession { path: PathBuf, reason: String },

    #[error("Invalid settings file '{path}': {reason}")]
    InvalidSettings { path: PathBuf, reason: String },

    #[error("Invalid SpikeGLX metadata '{path}': {reason}")]
    InvalidMeta { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Returns true when the session should be skipped rather than failed.
    pub fn is_unrecognized(&self) -> bool {
        matches!(
            self,
            SessionError::UnrecognizedSession { .. } | SessionError::MissingRoot(_)
        )
    }
}

/// Errors raised while assembling a task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task '{0}' is declared twice")]
    DuplicateTask(String),

    #[error("Task '{task}' depends on unknown task '{upstream}'")]
    UnknownDependency { task: String, upstream: String },

    #[error("Dependency cycle detected through: {0}")]
    Cycle(String),

    #[error("Invalid output pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Errors raised by the clock synchronizer.
///
/// Every variant is a synchronization quality failure: the mapping for the
/// affected stream must not be used.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("Stream '{0}' has no pulses")]
    NoPulses(String),

    #[error("Stream '{device}' is not monotonically increasing at pulse {index}")]
    NonMonotonic { device: String, index: usize },

    #[error("Stream '{device}' matched {matched} pulses, at least {required} required")]
    TooFewMatches {
        device: String,
        matched: usize,
        required: usize,
    },

    #[error("Fit for '{device}' rejected: residual {residual:.6}s exceeds {threshold:.6}s")]
    ResidualTooHigh {
        device: String,
        residual: f64,
        threshold: f64,
    },

    #[error("Fit for '{device}' is not monotonic: {reason}")]
    FoldBack { device: String, reason: String },

    #[error("Reference stream '{0}' is unusable")]
    ReferenceUnusable(String),

    #[error("No mapping computed for stream '{0}'")]
    MissingMapping(String),

    #[error("Primary fiducials failed ({primary}); fallback failed ({fallback})")]
    FallbackFailed { primary: String, fallback: String },
}

/// Errors raised by extraction logic.
///
/// The executor treats every variant identically: outputs written so far are
/// registered and the node is marked errored.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Required input missing: {0}")]
    MissingInput(PathBuf),

    #[error("Invalid input '{path}': {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    #[error("Synchronization quality error: {0}")]
    SynchronizationQuality(#[from] SyncError),

    #[error("Quality control failed: {0}")]
    QcFailed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Extraction failed: {0}")]
    Failed(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-file registration failure.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("File '{0}' not found")]
    FileNotFound(PathBuf),

    #[error("File '{path}' is outside session root '{root}'")]
    OutsideSession { path: PathBuf, root: PathBuf },

    #[error("Cannot derive dataset type from '{0}'")]
    UnknownDatasetType(String),

    #[error("Catalog request failed: {0}")]
    Catalog(String),

    #[error("Catalog request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the session/task repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Invalid state transition for task '{task}' from '{from}' to '{to}'")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level errors for a session run.
///
/// Task-level failures never surface here; they are recorded in the session
/// summary. These are failures that prevent a session from being processed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task '{task}' never became ready: upstream '{upstream}' ended {status}")]
    DependencyUnmet {
        task: String,
        upstream: String,
        status: TaskStatus,
    },

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}
