//! SQLite-backed task repository.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::graph::TaskStatus;
use crate::pipeline::LifecycleManager;
use crate::session::Session;
use crate::sync::SyncMapping;

use super::schema::all_schema_statements;
use super::{TaskRecord, TaskRepository};

/// Repository stored in a SQLite database.
///
/// Status transitions run in a transaction behind a process-wide write lock,
/// so the lifecycle check and the write cannot interleave with another
/// transition.
#[derive(Debug)]
pub struct SqliteRepository {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    lifecycle: LifecycleManager,
}

impl SqliteRepository {
    /// Opens (creating if missing) the database at `url`.
    ///
    /// Accepts `sqlite://path/to.db` or a bare file path.
    pub async fn open(url: &str) -> Result<Self, RepositoryError> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{}", url)
        };
        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?;

        let repo = Self::with_pool(pool).await?;
        tracing::info!(url = %url, "Task repository opened");
        Ok(repo)
    }

    /// Private in-memory database; one connection so every query sees it.
    pub async fn in_memory() -> Result<Self, RepositoryError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, RepositoryError> {
        for statement in all_schema_statements() {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            lifecycle: LifecycleManager::new(),
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("timestamp '{}': {}", value, e)))
}

fn task_record(row: &SqliteRow) -> Result<TaskRecord, RepositoryError> {
    let session_id: String = row.try_get("session_id")?;
    let status: String = row.try_get("status")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(TaskRecord {
        session_id: Uuid::parse_str(&session_id)
            .map_err(|e| RepositoryError::Corrupt(format!("session id '{}': {}", session_id, e)))?,
        task_name: row.try_get("task_name")?,
        status: status.parse().map_err(RepositoryError::Corrupt)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        updated_at: parse_time(&updated_at)?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl TaskRepository for SqliteRepository {
    async fn upsert_session(&self, session: &Session) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO sessions (id, subject, date, number, root, protocol, record, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                root = excluded.root,
                protocol = excluded.protocol,
                record = excluded.record,
                updated_at = excluded.updated_at",
        )
        .bind(session.id.to_string())
        .bind(&session.subject)
        .bind(session.date.to_string())
        .bind(session.number as i64)
        .bind(session.root.to_string_lossy().to_string())
        .bind(&session.protocol)
        .bind(serde_json::to_string(session)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query("SELECT record FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let record: String = row.try_get("record")?;
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }

    async fn record_transition(
        &self,
        session_id: Uuid,
        task: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<TaskRecord, RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE session_id = ?1 AND task_name = ?2")
            .bind(session_id.to_string())
            .bind(task)
            .fetch_optional(&mut *tx)
            .await?;
        let previous = row.as_ref().map(task_record).transpose()?;
        self.lifecycle
            .check(task, previous.as_ref().map(|r| r.status), status)?;

        let record = TaskRecord::transitioned(previous.as_ref(), session_id, task, status, error);
        sqlx::query(
            "INSERT INTO tasks (session_id, task_name, status, attempts, error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id, task_name) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                error = excluded.error,
                updated_at = excluded.updated_at",
        )
        .bind(session_id.to_string())
        .bind(task)
        .bind(status.as_str())
        .bind(record.attempts as i64)
        .bind(&record.error)
        .bind(record.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(record)
    }

    async fn task_records(&self, session_id: Uuid) -> Result<Vec<TaskRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE session_id = ?1 ORDER BY task_name")
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_record).collect()
    }

    async fn replace_mappings(
        &self,
        session_id: Uuid,
        mappings: &[SyncMapping],
    ) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sync_mappings WHERE session_id = ?1")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await?;
        for mapping in mappings {
            sqlx::query(
                "INSERT INTO sync_mappings (session_id, device, mapping, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(session_id.to_string())
            .bind(&mapping.device)
            .bind(serde_json::to_string(mapping)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_mappings(&self, session_id: Uuid) -> Result<Vec<SyncMapping>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT mapping FROM sync_mappings WHERE session_id = ?1 ORDER BY device",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<SyncMapping, RepositoryError> {
                let mapping: String = row.try_get("mapping")?;
                Ok(serde_json::from_str(&mapping)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Procedure;
    use chrono::NaiveDate;

    fn session() -> Session {
        Session::new(
            "ZM_2240",
            NaiveDate::from_ymd_opt(2020, 1, 22).unwrap(),
            1,
            "/data/mainenlab/Subjects/ZM_2240/2020-01-22/001",
            "_iblrig_tasks_ephysChoiceWorld6.2.5",
            Procedure::AcuteRecording,
        )
        .with_lab("mainenlab")
    }

    #[tokio::test]
    async fn test_open_and_upsert_session() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let repo = SqliteRepository::open(db_path.to_str().unwrap()).await.unwrap();

        let s = session();
        repo.upsert_session(&s).await.unwrap();
        repo.upsert_session(&s).await.unwrap();
        assert_eq!(repo.get_session(s.id).await.unwrap(), Some(s));
        assert!(repo.get_session(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_history() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let id = session().id;

        for status in [TaskStatus::Waiting, TaskStatus::Ready, TaskStatus::Running] {
            repo.record_transition(id, "EphysSync", status, None)
                .await
                .unwrap();
        }
        repo.record_transition(id, "EphysSync", TaskStatus::PartialComplete, Some("probe01: no pulses"))
            .await
            .unwrap();
        repo.record_transition(id, "Trials", TaskStatus::Waiting, None)
            .await
            .unwrap();

        let records = repo.task_records(id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].task_name, "EphysSync");
        assert_eq!(records[0].status, TaskStatus::PartialComplete);
        assert_eq!(records[0].attempts, 1);
        assert_eq!(records[0].error.as_deref(), Some("probe01: no pulses"));
        assert_eq!(records[1].status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_not_written() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let id = Uuid::new_v4();
        repo.record_transition(id, "Trials", TaskStatus::Waiting, None)
            .await
            .unwrap();

        let err = repo
            .record_transition(id, "Trials", TaskStatus::Complete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition { .. }));
        let records = repo.task_records(id).await.unwrap();
        assert_eq!(records[0].status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn test_mappings_round_trip_through_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("mappings.db");
        let id = Uuid::new_v4();
        let mappings = vec![
            SyncMapping::identity("bpod", 10),
            SyncMapping::identity("probe00", 12),
        ];

        {
            let repo = SqliteRepository::open(db_path.to_str().unwrap()).await.unwrap();
            repo.replace_mappings(id, &mappings).await.unwrap();
        }
        let repo = SqliteRepository::open(db_path.to_str().unwrap()).await.unwrap();
        assert_eq!(repo.load_mappings(id).await.unwrap(), mappings);

        repo.replace_mappings(id, &mappings[1..]).await.unwrap();
        assert_eq!(repo.load_mappings(id).await.unwrap().len(), 1);
    }
}
