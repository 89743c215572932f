//! neuropipe: raw neuroscience session extraction pipeline.
//!
//! Classifies raw session directories, runs a fixed task graph per protocol
//! family, aligns device clocks onto one reference timeline and registers
//! every produced file as a versioned dataset, including the outputs of
//! tasks that fail.

pub mod cli;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod pipeline;
pub mod registration;
pub mod session;
pub mod storage;
pub mod sync;
pub mod tasks;

pub use error::{
    ConfigError, ExtractionError, GraphError, PipelineError, RegistrationError, RepositoryError,
    SessionError, SyncError,
};
pub use pipeline::{Pipeline, PipelineConfig, SessionSummary};
