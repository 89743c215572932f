//! Task execution for raw sessions.
//!
//! # Architecture
//!
//! - **Config**: execution, storage, catalog and synchronization settings
//! - **Context**: what a task sees while it runs (session, inputs, mappings)
//! - **Lifecycle**: the allowed task status transitions
//! - **Executor**: the [`Pipeline`] that walks a task graph per session
//! - **Summary**: per-session and per-batch outcomes
//!
//! # Flow
//!
//! 1. The session root is classified and its task graph built
//! 2. Prior task state and sync mappings are loaded from the repository
//! 3. Complete nodes are skipped unless forced; the rest run in dependency order
//! 4. Every produced file is registered, whatever the task's outcome
//! 5. Terminal states and mappings are written back for the next run
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use neuropipe::pipeline::{Pipeline, PipelineConfig};
//! use neuropipe::registration::LocalCatalog;
//! use neuropipe::storage::SqliteRepository;
//!
//! let config = PipelineConfig::from_env()?.with_max_concurrent_tasks(8);
//! let catalog = LocalCatalog::open("/data/catalog/datasets.json").await?;
//! let repository = SqliteRepository::open(&config.database_url).await?;
//!
//! let pipeline = Pipeline::new(config, Arc::new(catalog), Arc::new(repository));
//! let summary = pipeline.build_and_run(session_root).await?;
//! for unmet in &summary.unmet {
//!     eprintln!("{} blocked by {} ({})", unmet.task, unmet.upstream, unmet.status);
//! }
//! ```

pub mod config;
pub mod context;
pub mod executor;
pub mod lifecycle;
pub mod summary;

pub use config::{CatalogConfig, PipelineConfig};
pub use context::{MappingSet, TaskContext};
pub use executor::{CancellationFlag, Pipeline};
pub use lifecycle::LifecycleManager;
pub use summary::{
    BatchReport, DependencyUnmet, FailedRegistration, SessionFailure, SessionSummary, TaskOutcome,
};
