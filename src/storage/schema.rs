//! Database schema constants.
//!
//! SQLite schema for the task repository. Statements are idempotent and run
//! on every open.

/// SQL schema for creating the sessions table.
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    subject     TEXT NOT NULL,
    date        TEXT NOT NULL,
    number      INTEGER NOT NULL,
    root        TEXT NOT NULL,
    protocol    TEXT NOT NULL,
    record      TEXT NOT NULL,
    updated_at  TEXT NOT NULL
)
"#;

/// SQL schema for creating the tasks table.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    session_id  TEXT    NOT NULL,
    task_name   TEXT    NOT NULL,
    status      TEXT    NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    error       TEXT,
    updated_at  TEXT    NOT NULL,
    PRIMARY KEY (session_id, task_name)
)
"#;

/// SQL schema for creating the sync_mappings table.
pub const CREATE_SYNC_MAPPINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sync_mappings (
    session_id  TEXT NOT NULL,
    device      TEXT NOT NULL,
    mapping     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (session_id, device)
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_SESSIONS_TABLE,
        CREATE_TASKS_TABLE,
        CREATE_SYNC_MAPPINGS_TABLE,
        CREATE_INDEXES,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const SESSIONS: &str = "sessions";
    pub const TASKS: &str = "tasks";
    pub const SYNC_MAPPINGS: &str = "sync_mappings";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 4);
        assert!(statements[0].contains(tables::SESSIONS));
        assert!(statements[1].contains(tables::TASKS));
        assert!(statements[2].contains(tables::SYNC_MAPPINGS));
        // Indexes should be last
        assert!(statements[3].contains("CREATE INDEX"));
    }
}
