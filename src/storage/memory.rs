//! In-memory repository.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::graph::TaskStatus;
use crate::pipeline::LifecycleManager;
use crate::session::Session;
use crate::sync::SyncMapping;

use super::{TaskRecord, TaskRepository};

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<Uuid, Session>,
    tasks: HashMap<Uuid, BTreeMap<String, TaskRecord>>,
    mappings: HashMap<Uuid, Vec<SyncMapping>>,
}

/// Repository held in process memory. Transitions are serialized by one lock.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
    lifecycle: LifecycleManager,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryRepository {
    async fn upsert_session(&self, session: &Session) -> Result<(), RepositoryError> {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, RepositoryError> {
        Ok(self.state.lock().await.sessions.get(&id).cloned())
    }

    async fn record_transition(
        &self,
        session_id: Uuid,
        task: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<TaskRecord, RepositoryError> {
        let mut state = self.state.lock().await;
        let tasks = state.tasks.entry(session_id).or_default();
        let previous = tasks.get(task);
        self.lifecycle.check(task, previous.map(|r| r.status), status)?;

        let record = TaskRecord::transitioned(previous, session_id, task, status, error);
        tasks.insert(task.to_string(), record.clone());
        Ok(record)
    }

    async fn task_records(&self, session_id: Uuid) -> Result<Vec<TaskRecord>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .await
            .tasks
            .get(&session_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn replace_mappings(
        &self,
        session_id: Uuid,
        mappings: &[SyncMapping],
    ) -> Result<(), RepositoryError> {
        self.state
            .lock()
            .await
            .mappings
            .insert(session_id, mappings.to_vec());
        Ok(())
    }

    async fn load_mappings(&self, session_id: Uuid) -> Result<Vec<SyncMapping>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .await
            .mappings
            .get(&session_id)
            .cloned()
            .unwrap_or_default())
    }
}
