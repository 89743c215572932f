//! Task executor and per-session state machine.
//!
//! [`Pipeline`] walks a session's task graph and drives every node through
//! `Waiting → Ready → Running → {Complete, PartialComplete, Errored}`, writing
//! each transition through the repository. A node is dispatched once all its
//! upstream nodes ended in a state the edge accepts. Nodes run concurrently up
//! to `max_concurrent_tasks`; heavy nodes also hold one of the machine-wide
//! heavy slots.
//!
//! Whatever a node produced is registered with the catalog before its
//! terminal status is written, including when extraction fails or panics.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use neuropipe::pipeline::{Pipeline, PipelineConfig};
//! use neuropipe::registration::LocalCatalog;
//! use neuropipe::storage::MemoryRepository;
//!
//! let pipeline = Pipeline::new(
//!     PipelineConfig::default(),
//!     Arc::new(LocalCatalog::in_memory()),
//!     Arc::new(MemoryRepository::new()),
//! );
//! let summary = pipeline.build_and_run(root).await?;
//! println!("{}", summary);
//! ```

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use semver::Version;
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{ExtractionError, PipelineError, SyncError};
use crate::graph::{ResourceClass, TaskGraph, TaskGraphBuilder, TaskNode, TaskStatus};
use crate::metrics::MetricsCollector;
use crate::registration::{
    to_slash, DatasetFile, RegistrationClient, RegistrationOutcome, RegistrationReport,
};
use crate::session::{SessionClassification, SessionLocator};
use crate::storage::{TaskRecord, TaskRepository};
use crate::sync::SyncMapping;

use super::config::PipelineConfig;
use super::context::{MappingSet, TaskContext};
use super::summary::{
    BatchReport, DependencyUnmet, FailedRegistration, SessionFailure, SessionSummary, TaskOutcome,
};

/// Cooperative stop signal shared between a pipeline and its callers.
///
/// Checked before every dispatch; running tasks are never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs task graphs for sessions.
///
/// The catalog and the repository are injected, so tests can substitute
/// recording doubles.
pub struct Pipeline {
    config: PipelineConfig,
    registration: Arc<dyn RegistrationClient>,
    repository: Arc<dyn TaskRepository>,
    locator: SessionLocator,
    heavy_slots: Arc<Semaphore>,
    cancellation: CancellationFlag,
    metrics: MetricsCollector,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registration: Arc<dyn RegistrationClient>,
        repository: Arc<dyn TaskRepository>,
    ) -> Self {
        let heavy_slots = Arc::new(Semaphore::new(config.heavy_task_slots.max(1)));
        Self {
            config,
            registration,
            repository,
            locator: SessionLocator::new(),
            heavy_slots,
            cancellation: CancellationFlag::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Uses an externally owned cancellation flag.
    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repository
    }

    /// Graph builder configured from this pipeline's sync settings.
    pub fn graph_builder(&self) -> TaskGraphBuilder {
        TaskGraphBuilder::new(self.config.sync.clone())
            .with_min_match_ratio(self.config.min_match_ratio)
    }

    /// Classifies the session at `root`, builds its graph and runs it.
    ///
    /// # Errors
    ///
    /// Fails only when the session cannot be processed at all: it is not
    /// recognizable, its graph is invalid or the repository is unavailable.
    /// Task failures are reported in the returned summary.
    pub async fn build_and_run(&self, root: &Path) -> Result<SessionSummary, PipelineError> {
        let classification = self.locator.classify(root)?;
        let graph = self.graph_builder().build(&classification)?;
        self.run_graph(classification, &graph).await
    }

    /// Runs sessions concurrently, up to `max_concurrent_sessions` at a time.
    ///
    /// Unrecognized roots are skipped with a warning; other failures are
    /// reported and the batch continues.
    pub async fn run_batch(&self, roots: &[PathBuf]) -> BatchReport {
        let concurrency = self.config.max_concurrent_sessions.max(1);
        let results: Vec<(PathBuf, Result<SessionSummary, PipelineError>)> = stream::iter(roots)
            .map(|root| async move { (root.clone(), self.build_and_run(root).await) })
            .buffered(concurrency)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (root, result) in results {
            match result {
                Ok(summary) => report.sessions.push(summary),
                Err(PipelineError::Session(e)) if e.is_unrecognized() => {
                    warn!(root = %root.display(), error = %e, "Skipping unrecognized session");
                    report.skipped.push(SessionFailure {
                        root,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(root = %root.display(), error = %e, "Session could not be processed");
                    report.failed.push(SessionFailure {
                        root,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            sessions = report.sessions.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Batch finished"
        );
        report
    }

    /// Runs an already built graph for a classified session.
    pub async fn run_graph(
        &self,
        classification: SessionClassification,
        graph: &TaskGraph,
    ) -> Result<SessionSummary, PipelineError> {
        let started_at = Utc::now();
        let classification = Arc::new(classification);

        self.metrics.session_started();
        let result = self.execute(&classification, graph).await;
        self.metrics.session_finished();
        let (tasks, unmet, cancelled) = result?;

        let summary = SessionSummary {
            session: classification.session.clone(),
            family: classification.family.clone(),
            tasks,
            unmet,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };
        info!(session = %summary.session, summary = %summary, "Session run finished");
        Ok(summary)
    }

    /// Nodes that run this time: everything not already complete (or
    /// everything when forced), plus every downstream node of those.
    fn plan(&self, graph: &TaskGraph, previous: &HashMap<String, TaskRecord>) -> BTreeSet<String> {
        let mut to_run: BTreeSet<String> = graph
            .names()
            .filter(|name| {
                self.config.force
                    || previous.get(*name).map(|r| r.status) != Some(TaskStatus::Complete)
            })
            .map(String::from)
            .collect();
        let invalidated: Vec<String> = to_run
            .iter()
            .flat_map(|name| graph.transitive_dependents(name))
            .collect();
        to_run.extend(invalidated);
        to_run
    }

    async fn execute(
        &self,
        classification: &Arc<SessionClassification>,
        graph: &TaskGraph,
    ) -> Result<(BTreeMap<String, TaskOutcome>, Vec<DependencyUnmet>, bool), PipelineError> {
        let session = &classification.session;
        let session_id = session.id;
        self.repository.upsert_session(session).await?;

        let previous: HashMap<String, TaskRecord> = self
            .repository
            .task_records(session_id)
            .await?
            .into_iter()
            .map(|r| (r.task_name.clone(), r))
            .collect();
        let to_run = self.plan(graph, &previous);
        let mut mappings = Arc::new(MappingSet::from_mappings(
            self.repository.load_mappings(session_id).await?,
        ));

        info!(
            session = %session,
            family = %classification.family,
            nodes = graph.len(),
            to_run = to_run.len(),
            mappings = mappings.len(),
            "Running task graph"
        );

        let order = graph.topological_order();
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut outcomes: BTreeMap<String, TaskOutcome> = BTreeMap::new();
        let mut outputs: HashMap<String, Vec<PathBuf>> = HashMap::new();
        let mut session_files: Option<Vec<String>> = None;

        for node in order.iter().filter_map(|name| graph.node(name)) {
            if to_run.contains(&node.name) {
                let prior = previous.get(&node.name).map(|r| r.status);
                if prior != Some(TaskStatus::Waiting) {
                    self.repository
                        .record_transition(session_id, &node.name, TaskStatus::Waiting, None)
                        .await?;
                }
                statuses.insert(node.name.clone(), TaskStatus::Waiting);
            } else {
                debug!(session = %session, task = %node.name, "Skipping complete task");
                let files = session_files.get_or_insert_with(|| list_session_files(&session.root));
                outputs.insert(node.name.clone(), declared_outputs(&session.root, node, files));
                statuses.insert(node.name.clone(), TaskStatus::Complete);
                outcomes.insert(node.name.clone(), TaskOutcome::skipped(&node.name));
            }
        }

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        let mut in_flight: JoinSet<Result<NodeOutcome, PipelineError>> = JoinSet::new();
        let mut cancelled = false;

        loop {
            for node in order.iter().filter_map(|name| graph.node(name)) {
                if statuses.get(&node.name) != Some(&TaskStatus::Waiting)
                    || !dependencies_met(node, &statuses)
                {
                    continue;
                }
                if self.cancellation.is_cancelled() {
                    if !cancelled {
                        warn!(session = %session, "Run cancelled, no further tasks dispatched");
                    }
                    cancelled = true;
                    break;
                }

                self.repository
                    .record_transition(session_id, &node.name, TaskStatus::Ready, None)
                    .await?;
                statuses.insert(node.name.clone(), TaskStatus::Ready);

                let inputs = node
                    .dependencies
                    .iter()
                    .map(|d| {
                        let files = outputs.get(&d.upstream).cloned().unwrap_or_default();
                        (d.upstream.clone(), files)
                    })
                    .collect();
                let run = NodeRun {
                    session_id,
                    classification: Arc::clone(classification),
                    node: node.clone(),
                    inputs,
                    mappings: Arc::clone(&mappings),
                    max_attempts: node.max_attempts.unwrap_or(self.config.max_attempts).max(1),
                    dataset_version: self.config.dataset_version.clone(),
                    repository: Arc::clone(&self.repository),
                    registration: Arc::clone(&self.registration),
                    limiter: Arc::clone(&limiter),
                    heavy_slots: Arc::clone(&self.heavy_slots),
                    metrics: self.metrics.clone(),
                };
                debug!(session = %session, task = %node.name, "Task dispatched");
                in_flight.spawn(run.execute());
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let outcome = joined
                .map_err(|e| PipelineError::InitializationFailed(format!("Task runner failed: {}", e)))??;

            statuses.insert(outcome.summary.task.clone(), outcome.summary.status);
            outputs.insert(outcome.summary.task.clone(), outcome.produced);

            if !outcome.published.is_empty() {
                mappings = Arc::new(mappings.merged(outcome.published));
                let persisted: Vec<SyncMapping> =
                    mappings.mappings().map(|m| m.as_ref().clone()).collect();
                self.repository
                    .replace_mappings(session_id, &persisted)
                    .await?;
            }

            outcomes.insert(outcome.summary.task.clone(), outcome.summary);
        }

        let mut unmet = Vec::new();
        for node in order.iter().filter_map(|name| graph.node(name)) {
            if statuses.get(&node.name) != Some(&TaskStatus::Waiting) {
                continue;
            }
            if let Some(blocked) = unmet_dependency(node, &statuses) {
                warn!(
                    session = %session,
                    task = %blocked.task,
                    upstream = %blocked.upstream,
                    upstream_status = %blocked.status,
                    "Task dependency unmet"
                );
                unmet.push(blocked);
            }
            outcomes.insert(
                node.name.clone(),
                TaskOutcome::new(&node.name, TaskStatus::Waiting),
            );
        }

        Ok((outcomes, unmet, cancelled))
    }
}

/// True when every upstream ended in a state its edge accepts.
fn dependencies_met(node: &TaskNode, statuses: &HashMap<String, TaskStatus>) -> bool {
    unmet_dependency(node, statuses).is_none()
}

fn unmet_dependency(
    node: &TaskNode,
    statuses: &HashMap<String, TaskStatus>,
) -> Option<DependencyUnmet> {
    node.dependencies.iter().find_map(|dep| {
        let status = statuses
            .get(&dep.upstream)
            .copied()
            .unwrap_or(TaskStatus::Waiting);
        (!dep.policy.accepts(status)).then(|| DependencyUnmet {
            task: node.name.clone(),
            upstream: dep.upstream.clone(),
            status,
        })
    })
}

/// Session-relative paths of every file under `root`.
fn list_session_files(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(to_slash)
        })
        .collect()
}

/// Files on disk matching a node's declared outputs.
fn declared_outputs(root: &Path, node: &TaskNode, files: &[String]) -> Vec<PathBuf> {
    files
        .iter()
        .filter(|rel| node.output_for(rel).is_some())
        .map(|rel| root.join(rel))
        .collect()
}

fn permit_error(e: AcquireError) -> PipelineError {
    PipelineError::InitializationFailed(format!("Failed to acquire permit: {}", e))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result of running one node to a terminal status.
struct NodeOutcome {
    summary: TaskOutcome,
    produced: Vec<PathBuf>,
    published: BTreeMap<String, Result<Arc<SyncMapping>, SyncError>>,
}

/// Everything a dispatched node needs, owned so it can run on its own task.
struct NodeRun {
    session_id: Uuid,
    classification: Arc<SessionClassification>,
    node: TaskNode,
    inputs: Vec<(String, Vec<PathBuf>)>,
    mappings: Arc<MappingSet>,
    max_attempts: u32,
    dataset_version: Version,
    repository: Arc<dyn TaskRepository>,
    registration: Arc<dyn RegistrationClient>,
    limiter: Arc<Semaphore>,
    heavy_slots: Arc<Semaphore>,
    metrics: MetricsCollector,
}

impl NodeRun {
    async fn execute(self) -> Result<NodeOutcome, PipelineError> {
        let _permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(permit_error)?;
        let _heavy = match self.node.resource {
            ResourceClass::Heavy => Some(
                Arc::clone(&self.heavy_slots)
                    .acquire_owned()
                    .await
                    .map_err(permit_error)?,
            ),
            ResourceClass::Light => None,
        };

        let name = self.node.name.as_str();
        let session = &self.classification.session;
        let started = Instant::now();
        let mut summary = TaskOutcome::new(name, TaskStatus::Running);
        let mut produced = Vec::new();
        let mut published = BTreeMap::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                self.repository
                    .record_transition(self.session_id, name, TaskStatus::Ready, None)
                    .await?;
            }
            self.repository
                .record_transition(self.session_id, name, TaskStatus::Running, None)
                .await?;
            info!(session = %session, task = name, attempt, "Task running");

            let ctx = Arc::new(self.context(attempt));
            let result = self.run_extraction(Arc::clone(&ctx)).await;

            let mut files = ctx.recorded_outputs();
            if let Ok(returned) = &result {
                for path in returned {
                    if !files.contains(path) {
                        files.push(path.clone());
                    }
                }
            }

            let report = self.register(&files).await;

            let (status, error) = match &result {
                Err(e) => {
                    error!(
                        session = %session,
                        task = name,
                        attempt,
                        error = %e,
                        registered = report.records.len(),
                        "Task failed"
                    );
                    (TaskStatus::Errored, Some(e.to_string()))
                }
                Ok(_) => {
                    let missing = self.missing_required(&files);
                    if missing.is_empty() {
                        (TaskStatus::Complete, None)
                    } else {
                        warn!(
                            session = %session,
                            task = name,
                            missing = %missing.join(", "),
                            "Task returned without all required outputs"
                        );
                        (
                            TaskStatus::PartialComplete,
                            Some(format!("missing required outputs: {}", missing.join(", "))),
                        )
                    }
                }
            };

            self.repository
                .record_transition(self.session_id, name, status, error.as_deref())
                .await?;
            info!(session = %session, task = name, status = %status, "Task finished");

            summary.status = status;
            summary.attempts = attempt;
            summary.error = error;
            summary.records.extend(report.records);
            summary
                .registration_failures
                .extend(report.failures.into_iter().map(|f| FailedRegistration {
                    path: f.path,
                    error: f.error.to_string(),
                }));
            produced = files;
            published = ctx.take_published();

            if status != TaskStatus::Errored {
                break;
            }
            if attempt < self.max_attempts {
                warn!(session = %session, task = name, attempt, "Retrying task");
            }
        }

        summary.duration_secs = started.elapsed().as_secs_f64();
        self.metrics
            .record_task(name, summary.status.as_str(), summary.duration_secs);

        Ok(NodeOutcome {
            summary,
            produced,
            published,
        })
    }

    fn context(&self, attempt: u32) -> TaskContext {
        self.inputs.iter().fold(
            TaskContext::new(
                Arc::clone(&self.classification),
                self.node.name.clone(),
                Arc::clone(&self.mappings),
            )
            .with_attempt(attempt),
            |ctx, (upstream, files)| ctx.with_input(upstream.clone(), files.clone()),
        )
    }

    /// Runs the extraction on its own task so a panic is contained and the
    /// files recorded before it are still available through `ctx`.
    async fn run_extraction(&self, ctx: Arc<TaskContext>) -> Result<Vec<PathBuf>, ExtractionError> {
        let task = self.node.task();
        match tokio::spawn(async move { task.run(&ctx).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ExtractionError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(ExtractionError::Failed(e.to_string())),
        }
    }

    /// Registers `files`; never holds a lock across the catalog call.
    async fn register(&self, files: &[PathBuf]) -> RegistrationReport {
        if files.is_empty() {
            return RegistrationReport::default();
        }

        let root = &self.classification.session.root;
        let datasets: Vec<DatasetFile> = files
            .iter()
            .map(|path| {
                let spec = path
                    .strip_prefix(root)
                    .ok()
                    .and_then(|rel| self.node.output_for(&to_slash(rel)));
                let version = spec
                    .and_then(|s| s.version.clone())
                    .unwrap_or_else(|| self.dataset_version.clone());
                let file = DatasetFile::new(path.clone(), version);
                match spec.and_then(|s| s.dataset_type.as_deref()) {
                    Some(dataset_type) => file.with_dataset_type(dataset_type),
                    None => file,
                }
            })
            .collect();

        let report = self
            .registration
            .register(&self.classification.session, &self.node.name, &datasets)
            .await;

        for failure in &report.failures {
            warn!(
                session = %self.classification.session,
                task = %self.node.name,
                path = %failure.path.display(),
                error = %failure.error,
                "Dataset registration failed"
            );
        }
        for outcome in [
            RegistrationOutcome::Created,
            RegistrationOutcome::Unchanged,
            RegistrationOutcome::Superseded,
        ] {
            self.metrics
                .record_registration(outcome.as_str(), report.count(outcome));
        }
        self.metrics
            .record_registration("failed", report.failures.len());
        debug!(
            task = %self.node.name,
            registered = report.records.len(),
            failed = report.failures.len(),
            "Registration finished"
        );
        report
    }

    /// Required output patterns matched by no existing produced file.
    fn missing_required(&self, files: &[PathBuf]) -> Vec<String> {
        let root = &self.classification.session.root;
        let present: Vec<String> = files
            .iter()
            .filter(|path| path.is_file())
            .filter_map(|path| path.strip_prefix(root).ok().map(to_slash))
            .collect();
        self.node
            .outputs
            .iter()
            .filter(|spec| spec.required)
            .filter(|spec| !present.iter().any(|rel| spec.pattern.matches(rel)))
            .map(|spec| spec.pattern.as_str().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Dependency, OutputSpec};
    use crate::registration::LocalCatalog;
    use crate::session::{Procedure, ProtocolFamily, Session};
    use crate::storage::MemoryRepository;
    use crate::tasks::ExtractionTask;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::AtomicUsize;

    /// Writes the listed files, then optionally fails or panics.
    struct ScriptedTask {
        writes: Vec<&'static str>,
        fail: bool,
        panic: bool,
        runs: Arc<AtomicUsize>,
    }

    impl ScriptedTask {
        fn writing(writes: &[&'static str]) -> Self {
            Self {
                writes: writes.to_vec(),
                fail: false,
                panic: false,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn panicking(mut self) -> Self {
            self.panic = true;
            self
        }
    }

    #[async_trait]
    impl ExtractionTask for ScriptedTask {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            for rel in &self.writes {
                let path = ctx.root().join(rel);
                std::fs::create_dir_all(path.parent().unwrap())?;
                std::fs::write(&path, format!("{} attempt {}", rel, ctx.attempt()))?;
                ctx.record_output(&path);
            }
            if self.panic {
                panic!("extractor blew up");
            }
            if self.fail {
                return Err(ExtractionError::Failed("scripted failure".to_string()));
            }
            Ok(Vec::new())
        }
    }

    fn classification(root: &Path) -> SessionClassification {
        SessionClassification {
            session: Session::new(
                "CSHL049",
                NaiveDate::from_ymd_opt(2020, 1, 8).unwrap(),
                1,
                root,
                "_iblrig_tasks_trainingChoiceWorld6.2.5",
                Procedure::BehaviorTraining,
            ),
            family: ProtocolFamily::Training,
            probes: vec![],
            cameras: vec![],
            has_behavior: true,
            has_passive: false,
            has_opto: false,
        }
    }

    fn pipeline(config: PipelineConfig) -> (Pipeline, Arc<MemoryRepository>) {
        let repository = Arc::new(MemoryRepository::new());
        let pipeline = Pipeline::new(config, Arc::new(LocalCatalog::in_memory()), repository.clone());
        (pipeline, repository)
    }

    fn node(name: &str, task: ScriptedTask, outputs: &[&str]) -> TaskNode {
        outputs.iter().fold(TaskNode::new(name, Arc::new(task)), |n, o| {
            n.with_output(OutputSpec::required(o, &format!("{}.data", name)).unwrap())
        })
    }

    #[tokio::test]
    async fn test_chain_runs_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let graph = TaskGraph::from_nodes(vec![
            node("a", ScriptedTask::writing(&["alf/a.x.json"]), &["alf/a.x.json"]),
            node("b", ScriptedTask::writing(&["alf/b.x.json"]), &["alf/b.x.json"])
                .with_dependency(Dependency::complete("a")),
        ])
        .unwrap();
        let (pipeline, _) = pipeline(PipelineConfig::default());

        let summary = pipeline.run_graph(classification(dir.path()), &graph).await.unwrap();
        assert_eq!(summary.count(TaskStatus::Complete), 2);
        assert_eq!(summary.records().count(), 2);
        assert!(summary.unmet.is_empty());
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_failed_task_registers_partial_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let graph = TaskGraph::from_nodes(vec![node(
            "spikes",
            ScriptedTask::writing(&["alf/spikes.times.json"]).failing(),
            &["alf/spikes.times.json", "alf/spikes.amps.json"],
        )])
        .unwrap();
        let (pipeline, repository) = pipeline(PipelineConfig::default());

        let summary = pipeline.run_graph(classification(dir.path()), &graph).await.unwrap();
        let outcome = summary.outcome("spikes").unwrap();
        assert_eq!(outcome.status, TaskStatus::Errored);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].relative_path, "alf/spikes.times.json");
        assert!(outcome.error.as_deref().unwrap().contains("scripted failure"));

        let records = repository.task_records(summary.session.id).await.unwrap();
        assert_eq!(records[0].status, TaskStatus::Errored);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let graph = TaskGraph::from_nodes(vec![
            node("boom", ScriptedTask::writing(&["alf/boom.x.json"]).panicking(), &[]),
            node("other", ScriptedTask::writing(&["alf/other.x.json"]), &[]),
        ])
        .unwrap();
        let (pipeline, _) = pipeline(PipelineConfig::default());

        let summary = pipeline.run_graph(classification(dir.path()), &graph).await.unwrap();
        let boom = summary.outcome("boom").unwrap();
        assert_eq!(boom.status, TaskStatus::Errored);
        assert!(boom.error.as_deref().unwrap().contains("extractor blew up"));
        assert_eq!(boom.records.len(), 1);
        assert_eq!(summary.status("other"), Some(TaskStatus::Complete));
    }

    #[tokio::test]
    async fn test_missing_required_output_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let graph = TaskGraph::from_nodes(vec![
            node(
                "sync",
                ScriptedTask::writing(&["alf/probe00/s.points.json"]),
                &["alf/probe00/s.points.json", "alf/probe01/s.points.json"],
            ),
            node("strict", ScriptedTask::writing(&[]), &[])
                .with_dependency(Dependency::complete("sync")),
            node("lenient", ScriptedTask::writing(&[]), &[])
                .with_dependency(Dependency::allow_partial("sync")),
        ])
        .unwrap();
        let (pipeline, _) = pipeline(PipelineConfig::default());

        let summary = pipeline.run_graph(classification(dir.path()), &graph).await.unwrap();
        assert_eq!(summary.status("sync"), Some(TaskStatus::PartialComplete));
        assert_eq!(summary.status("lenient"), Some(TaskStatus::Complete));
        assert_eq!(summary.status("strict"), Some(TaskStatus::Waiting));
        assert_eq!(
            summary.unmet,
            vec![DependencyUnmet {
                task: "strict".to_string(),
                upstream: "sync".to_string(),
                status: TaskStatus::PartialComplete,
            }]
        );
    }

    #[tokio::test]
    async fn test_retry_until_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let task = ScriptedTask::writing(&[]).failing();
        let runs = Arc::clone(&task.runs);
        let graph = TaskGraph::from_nodes(vec![node("flaky", task, &[])]).unwrap();
        let (pipeline, repository) = pipeline(PipelineConfig::default().with_max_attempts(3));

        let summary = pipeline.run_graph(classification(dir.path()), &graph).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(summary.outcome("flaky").unwrap().attempts, 3);
        let records = repository.task_records(summary.session.id).await.unwrap();
        assert_eq!(records[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_rerun_skips_complete_and_invalidates_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = ScriptedTask::writing(&["alf/up.x.json"]);
        let upstream_runs = Arc::clone(&upstream.runs);
        let failing = ScriptedTask::writing(&[]).failing();
        let down = ScriptedTask::writing(&["alf/down.x.json"]);
        let down_runs = Arc::clone(&down.runs);
        let graph = TaskGraph::from_nodes(vec![
            node("up", upstream, &["alf/up.x.json"]),
            node("mid", failing, &[]).with_dependency(Dependency::allow_partial("up")),
            node("down", down, &[]).with_dependency(Dependency::complete("up")),
        ])
        .unwrap();
        let (pipeline, _) = pipeline(PipelineConfig::default());

        let first = pipeline.run_graph(classification(dir.path()), &graph).await.unwrap();
        assert_eq!(first.status("mid"), Some(TaskStatus::Errored));
        let second = pipeline.run_graph(classification(dir.path()), &graph).await.unwrap();

        assert!(second.outcome("up").unwrap().skipped);
        assert!(second.outcome("down").unwrap().skipped);
        assert_eq!(second.outcome("mid").unwrap().attempts, 1);
        assert_eq!(upstream_runs.load(Ordering::SeqCst), 1);
        assert_eq!(down_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let task = ScriptedTask::writing(&[]);
        let runs = Arc::clone(&task.runs);
        let graph = TaskGraph::from_nodes(vec![node("a", task, &[])]).unwrap();
        let (pipeline, _) = pipeline(PipelineConfig::default());
        pipeline.cancellation().cancel();

        let summary = pipeline.run_graph(classification(dir.path()), &graph).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.status("a"), Some(TaskStatus::Waiting));
        assert!(summary.unmet.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Scripted {
        Complete,
        Partial,
        Fail,
    }

    /// Looks up its upstream states in the repository when dispatched and
    /// records any edge that does not accept them.
    struct GuardedTask {
        dependencies: Vec<Dependency>,
        outcome: Scripted,
        repository: Arc<MemoryRepository>,
        violations: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ExtractionTask for GuardedTask {
        fn kind(&self) -> &'static str {
            "guarded"
        }

        async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
            let records = self.repository.task_records(ctx.session().id).await.unwrap();
            for dep in &self.dependencies {
                let status = records
                    .iter()
                    .find(|r| r.task_name == dep.upstream)
                    .map(|r| r.status)
                    .unwrap_or(TaskStatus::Waiting);
                if !dep.policy.accepts(status) {
                    self.violations.lock().unwrap().push(format!(
                        "{} ran with {} {}",
                        ctx.task_name(),
                        dep.upstream,
                        status
                    ));
                }
            }
            match self.outcome {
                Scripted::Fail => Err(ExtractionError::Failed("scripted failure".to_string())),
                Scripted::Complete | Scripted::Partial => Ok(Vec::new()),
            }
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_never_dispatches_with_unmet_upstream(
            layout in proptest::collection::vec((0u8..=255, 0u8..3, 0u8..=255), 1..9),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let repository = Arc::new(MemoryRepository::new());
            let violations = Arc::new(std::sync::Mutex::new(Vec::new()));

            let mut nodes = Vec::new();
            let mut expected: Vec<TaskStatus> = Vec::new();
            for (i, &(deps_mask, outcome, partial_mask)) in layout.iter().enumerate() {
                let name = format!("n{}", i);
                let dependencies: Vec<Dependency> = (0..i)
                    .filter(|j| deps_mask & (1 << j) != 0)
                    .map(|j| {
                        if partial_mask & (1 << j) != 0 {
                            Dependency::allow_partial(format!("n{}", j))
                        } else {
                            Dependency::complete(format!("n{}", j))
                        }
                    })
                    .collect();
                let outcome = match outcome {
                    0 => Scripted::Complete,
                    1 => Scripted::Partial,
                    _ => Scripted::Fail,
                };

                let runnable = dependencies.iter().all(|d| {
                    let j: usize = d.upstream[1..].parse().unwrap();
                    d.policy.accepts(expected[j])
                });
                expected.push(match (runnable, outcome) {
                    (false, _) => TaskStatus::Waiting,
                    (true, Scripted::Complete) => TaskStatus::Complete,
                    (true, Scripted::Partial) => TaskStatus::PartialComplete,
                    (true, Scripted::Fail) => TaskStatus::Errored,
                });

                let task = GuardedTask {
                    dependencies: dependencies.clone(),
                    outcome,
                    repository: repository.clone(),
                    violations: violations.clone(),
                };
                let mut node = dependencies
                    .into_iter()
                    .fold(TaskNode::new(name.clone(), Arc::new(task)), |n, d| n.with_dependency(d));
                if let Scripted::Partial = outcome {
                    let output = format!("alf/{}.never.json", name);
                    node = node.with_output(OutputSpec::required(&output, "never.written").unwrap());
                }
                nodes.push(node);
            }
            let graph = TaskGraph::from_nodes(nodes).unwrap();
            let pipeline = Pipeline::new(
                PipelineConfig::default(),
                Arc::new(LocalCatalog::in_memory()),
                repository.clone(),
            );

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let summary = runtime
                .block_on(pipeline.run_graph(classification(dir.path()), &graph))
                .unwrap();

            let found = violations.lock().unwrap().clone();
            proptest::prop_assert!(found.is_empty(), "{:?}", found);
            for (i, status) in expected.iter().enumerate() {
                proptest::prop_assert_eq!(summary.status(&format!("n{}", i)), Some(*status));
            }
            let waiting = expected.iter().filter(|s| **s == TaskStatus::Waiting).count();
            proptest::prop_assert_eq!(summary.unmet.len(), waiting);
        }
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "non-string panic payload");
    }
}
