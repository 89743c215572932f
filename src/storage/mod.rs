//! Session and task repository.
//!
//! Persists one record per (session, task name) with its status, the time of
//! the last transition and the error text if any, plus the sync mappings a
//! synchronization node produced. The executor reads it back to resume a
//! session: completed nodes are skipped and their mappings reloaded.
//!
//! # Backends
//!
//! - [`MemoryRepository`]: process-local, used by tests and dry runs
//! - [`SqliteRepository`]: SQLite file (WAL mode)
//!
//! ```rust,ignore
//! use neuropipe::storage::{SqliteRepository, TaskRepository};
//!
//! let repo = SqliteRepository::open("sqlite://neuropipe.db").await?;
//! for record in repo.task_records(session.id).await? {
//!     println!("{}: {}", record.task_name, record.status);
//! }
//! ```

pub mod memory;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::graph::TaskStatus;
use crate::session::Session;
use crate::sync::SyncMapping;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

/// Persisted state of one task of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub session_id: Uuid,
    pub task_name: String,
    pub status: TaskStatus,
    /// Dispatches across all runs.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl TaskRecord {
    /// Applies a transition to an existing record, or creates the first one.
    pub(crate) fn transitioned(
        previous: Option<&TaskRecord>,
        session_id: Uuid,
        task: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Self {
        let attempts = previous.map(|r| r.attempts).unwrap_or(0);
        Self {
            session_id,
            task_name: task.to_string(),
            status,
            attempts: if status == TaskStatus::Running {
                attempts + 1
            } else {
                attempts
            },
            updated_at: Utc::now(),
            error: error.map(str::to_string),
        }
    }
}

/// Persistence used by the executor.
///
/// `record_transition` must validate and write in one atomic step, and
/// writes for the same task must never interleave.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn upsert_session(&self, session: &Session) -> Result<(), RepositoryError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, RepositoryError>;

    /// Records a status transition, rejecting transitions the lifecycle forbids.
    async fn record_transition(
        &self,
        session_id: Uuid,
        task: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<TaskRecord, RepositoryError>;

    /// All task records of a session, ordered by task name.
    async fn task_records(&self, session_id: Uuid) -> Result<Vec<TaskRecord>, RepositoryError>;

    /// Replaces every stored mapping of a session.
    async fn replace_mappings(
        &self,
        session_id: Uuid,
        mappings: &[SyncMapping],
    ) -> Result<(), RepositoryError>;

    async fn load_mappings(&self, session_id: Uuid) -> Result<Vec<SyncMapping>, RepositoryError>;
}
