//! Session and batch summaries.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::PipelineError;
use crate::graph::TaskStatus;
use crate::registration::DatasetRecord;
use crate::session::{ProtocolFamily, Session};

/// A file the catalog rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRegistration {
    pub path: PathBuf,
    pub error: String,
}

/// What happened to one task node during a run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task: String,
    pub status: TaskStatus,
    /// Attempts made in this run; zero when skipped or never dispatched.
    pub attempts: u32,
    /// Complete from an earlier run and not re-run.
    pub skipped: bool,
    pub error: Option<String>,
    pub records: Vec<DatasetRecord>,
    pub registration_failures: Vec<FailedRegistration>,
    pub duration_secs: f64,
}

impl TaskOutcome {
    pub(crate) fn new(task: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task: task.into(),
            status,
            attempts: 0,
            skipped: false,
            error: None,
            records: Vec::new(),
            registration_failures: Vec::new(),
            duration_secs: 0.0,
        }
    }

    pub(crate) fn skipped(task: impl Into<String>) -> Self {
        Self {
            skipped: true,
            ..Self::new(task, TaskStatus::Complete)
        }
    }
}

/// A node left waiting because an upstream ended in a state its edge rejects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyUnmet {
    pub task: String,
    pub upstream: String,
    pub status: TaskStatus,
}

impl From<DependencyUnmet> for PipelineError {
    fn from(unmet: DependencyUnmet) -> Self {
        PipelineError::DependencyUnmet {
            task: unmet.task,
            upstream: unmet.upstream,
            status: unmet.status,
        }
    }
}

/// Terminal view of one session run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: Session,
    pub family: ProtocolFamily,
    pub tasks: BTreeMap<String, TaskOutcome>,
    pub unmet: Vec<DependencyUnmet>,
    /// The run stopped dispatching before every node was reached.
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SessionSummary {
    /// Number of nodes that ended the run in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn status(&self, task: &str) -> Option<TaskStatus> {
        self.tasks.get(task).map(|t| t.status)
    }

    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.tasks.get(task)
    }

    /// Dataset records registered during this run.
    pub fn records(&self) -> impl Iterator<Item = &DatasetRecord> {
        self.tasks.values().flat_map(|t| t.records.iter())
    }

    pub fn registration_failures(&self) -> impl Iterator<Item = &FailedRegistration> {
        self.tasks.values().flat_map(|t| t.registration_failures.iter())
    }

    /// True when every node is complete and every file was registered.
    pub fn is_success(&self) -> bool {
        self.tasks.values().all(|t| t.status == TaskStatus::Complete)
            && self.registration_failures().next().is_none()
    }

    /// First unmet dependency as an error, for callers that treat it as fatal.
    pub fn unmet_error(&self) -> Option<PipelineError> {
        self.unmet.first().cloned().map(PipelineError::from)
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} complete, {} partial, {} errored, {} waiting",
            self.session,
            self.family,
            self.count(TaskStatus::Complete),
            self.count(TaskStatus::PartialComplete),
            self.count(TaskStatus::Errored),
            self.count(TaskStatus::Waiting),
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// A root that was not processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionFailure {
    pub root: PathBuf,
    pub reason: String,
}

/// Result of a batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub sessions: Vec<SessionSummary>,
    /// Roots that are not recognizable sessions.
    pub skipped: Vec<SessionFailure>,
    /// Sessions that could not be processed at all.
    pub failed: Vec<SessionFailure>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.sessions.len() + self.skipped.len() + self.failed.len()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.sessions.iter().map(|s| s.count(status)).sum()
    }
}
