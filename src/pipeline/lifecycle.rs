//! Allowed task status transitions.
//!
//! Repositories check every status write against [`LifecycleManager`].

use std::collections::HashMap;

use crate::error::RepositoryError;
use crate::graph::TaskStatus;

/// Enforces valid task status transitions.
///
/// Repositories consult it inside the write that records a transition, so
/// the check and the write are one atomic step.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    valid_transitions: HashMap<TaskStatus, Vec<TaskStatus>>,
}

impl LifecycleManager {
    /// Create a lifecycle manager with the executor's transition rules.
    ///
    /// Valid transitions:
    /// - Waiting -> Ready (all upstream edges satisfied)
    /// - Ready -> Running (dispatched)
    /// - Running -> Complete, Errored or PartialComplete
    /// - Errored -> Ready (retry within a run)
    /// - Complete, Errored, PartialComplete -> Waiting (re-run or invalidation)
    /// - Ready, Running -> Waiting (recovery after an interrupted run)
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(TaskStatus::Waiting, vec![TaskStatus::Ready]);

        valid_transitions.insert(
            TaskStatus::Ready,
            vec![TaskStatus::Running, TaskStatus::Waiting],
        );

        valid_transitions.insert(
            TaskStatus::Running,
            vec![
                TaskStatus::Complete,
                TaskStatus::Errored,
                TaskStatus::PartialComplete,
                TaskStatus::Waiting,
            ],
        );

        valid_transitions.insert(TaskStatus::Complete, vec![TaskStatus::Waiting]);

        valid_transitions.insert(
            TaskStatus::Errored,
            vec![TaskStatus::Ready, TaskStatus::Waiting],
        );

        valid_transitions.insert(TaskStatus::PartialComplete, vec![TaskStatus::Waiting]);

        Self { valid_transitions }
    }

    /// Check if a transition between two statuses is allowed.
    pub fn can_transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.valid_transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// Validates a transition for `task`. A task with no record may only
    /// enter `Waiting`.
    pub fn check(
        &self,
        task: &str,
        from: Option<TaskStatus>,
        to: TaskStatus,
    ) -> Result<(), RepositoryError> {
        let allowed = match from {
            None => to == TaskStatus::Waiting,
            Some(from) => self.can_transition(from, to),
        };
        if allowed {
            Ok(())
        } else {
            Err(RepositoryError::InvalidTransition {
                task: task.to_string(),
                from: from.unwrap_or(TaskStatus::Waiting),
                to,
            })
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}
