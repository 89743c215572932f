//! Task nodes and their status.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::tasks::ExtractionTask;

use super::pattern::OutputPattern;

/// Lifecycle status of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Ready,
    Running,
    Complete,
    Errored,
    /// Returned normally but some required outputs are missing.
    PartialComplete,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Waiting,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Complete,
        TaskStatus::Errored,
        TaskStatus::PartialComplete,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Errored | TaskStatus::PartialComplete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Errored => "errored",
            TaskStatus::PartialComplete => "partial_complete",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{}'", s))
    }
}

/// Upstream states a dependency edge accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    RequireComplete,
    /// Also accepts a partially complete upstream (degraded input).
    AllowPartial,
}

impl DependencyPolicy {
    pub fn accepts(&self, status: TaskStatus) -> bool {
        match self {
            DependencyPolicy::RequireComplete => status == TaskStatus::Complete,
            DependencyPolicy::AllowPartial => {
                matches!(status, TaskStatus::Complete | TaskStatus::PartialComplete)
            }
        }
    }
}

/// Edge from a node to one upstream node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub upstream: String,
    pub policy: DependencyPolicy,
}

impl Dependency {
    pub fn complete(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            policy: DependencyPolicy::RequireComplete,
        }
    }

    pub fn allow_partial(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            policy: DependencyPolicy::AllowPartial,
        }
    }
}

/// Declared output dataset of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub pattern: OutputPattern,
    /// Semantic type; derived from the file name when absent.
    pub dataset_type: Option<String>,
    /// Overrides the configured dataset version.
    pub version: Option<Version>,
    /// Missing required outputs make a normal return partial.
    pub required: bool,
}

impl OutputSpec {
    /// A required output with the given session-relative glob.
    pub fn required(pattern: &str, dataset_type: &str) -> Result<Self, GraphError> {
        Ok(Self {
            pattern: OutputPattern::new(pattern)?,
            dataset_type: Some(dataset_type.to_string()),
            version: None,
            required: true,
        })
    }

    pub fn optional(pattern: &str, dataset_type: &str) -> Result<Self, GraphError> {
        Ok(Self {
            required: false,
            ..Self::required(pattern, dataset_type)?
        })
    }

    /// Output whose dataset type comes from each file's name.
    pub fn untyped(pattern: &str, required: bool) -> Result<Self, GraphError> {
        Ok(Self {
            pattern: OutputPattern::new(pattern)?,
            dataset_type: None,
            version: None,
            required,
        })
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }
}

/// Memory/CPU footprint class used for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    #[default]
    Light,
    /// Limited machine-wide by the heavy task slots.
    Heavy,
}

/// A named unit of work bound to a session.
#[derive(Clone)]
pub struct TaskNode {
    pub name: String,
    pub dependencies: Vec<Dependency>,
    pub outputs: Vec<OutputSpec>,
    pub resource: ResourceClass,
    /// Per-node override of the configured attempt limit.
    pub max_attempts: Option<u32>,
    task: Arc<dyn ExtractionTask>,
}

impl TaskNode {
    pub fn new(name: impl Into<String>, task: Arc<dyn ExtractionTask>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            outputs: Vec::new(),
            resource: ResourceClass::Light,
            max_attempts: None,
            task,
        }
    }

    /// Adds an upstream edge. Repeating an upstream keeps one edge with the
    /// stricter of the two policies.
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        match self
            .dependencies
            .iter_mut()
            .find(|d| d.upstream == dependency.upstream)
        {
            Some(existing) => {
                if dependency.policy == DependencyPolicy::RequireComplete {
                    existing.policy = DependencyPolicy::RequireComplete;
                }
            }
            None => self.dependencies.push(dependency),
        }
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = OutputSpec>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    pub fn with_resource(mut self, resource: ResourceClass) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn task(&self) -> Arc<dyn ExtractionTask> {
        Arc::clone(&self.task)
    }

    /// First declared output matching a session-relative path.
    pub fn output_for(&self, relative_path: &str) -> Option<&OutputSpec> {
        self.outputs
            .iter()
            .find(|spec| spec.pattern.matches(relative_path))
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("task", &self.task.kind())
            .field("dependencies", &self.dependencies)
            .field("outputs", &self.outputs)
            .field("resource", &self.resource)
            .finish()
    }
}

/// Structural equality: the extraction variant is compared by kind only.
impl PartialEq for TaskNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.task.kind() == other.task.kind()
            && self.dependencies == other.dependencies
            && self.outputs == other.outputs
            && self.resource == other.resource
            && self.max_attempts == other.max_attempts
    }
}
