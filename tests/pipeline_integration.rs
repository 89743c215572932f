//! End-to-end tests of the executor on raw sessions laid out on disk.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use common::{EphysSessionFixture, RecordingClient};
use neuropipe::graph::{TaskGraph, TaskNode, TaskStatus};
use neuropipe::pipeline::{Pipeline, PipelineConfig, TaskContext};
use neuropipe::registration::{LocalCatalog, RegistrationOutcome};
use neuropipe::session::SessionLocator;
use neuropipe::storage::{MemoryRepository, SqliteRepository, TaskRepository};
use neuropipe::tasks::ExtractionTask;
use neuropipe::{ExtractionError, PipelineError};

fn relative_paths(summary: &neuropipe::SessionSummary, task: &str) -> Vec<String> {
    let mut paths: Vec<String> = summary
        .outcome(task)
        .unwrap()
        .records
        .iter()
        .map(|r| r.relative_path.clone())
        .collect();
    paths.sort();
    paths
}

fn memory_pipeline(config: PipelineConfig) -> (Pipeline, Arc<LocalCatalog>, Arc<MemoryRepository>) {
    let catalog = Arc::new(LocalCatalog::in_memory());
    let repository = Arc::new(MemoryRepository::new());
    let pipeline = Pipeline::new(config, catalog.clone(), repository.clone());
    (pipeline, catalog, repository)
}

#[tokio::test]
async fn test_two_probe_session_with_failing_probe() {
    let fx = EphysSessionFixture::new(&["probe00", "probe01"]);
    // one amplitude for four spikes: the task fails after writing spike times
    fx.set_amplitudes("probe01", &[1.0]);
    let (pipeline, catalog, _) = memory_pipeline(PipelineConfig::default());

    let summary = pipeline.build_and_run(&fx.root).await.unwrap();

    assert_eq!(summary.status("SpikeSync_probe00"), Some(TaskStatus::Complete));
    assert_eq!(summary.status("SpikeSync_probe01"), Some(TaskStatus::Errored));
    assert_eq!(summary.status("EphysSync"), Some(TaskStatus::Complete));
    assert_eq!(summary.count(TaskStatus::Errored), 1);
    assert_eq!(summary.count(TaskStatus::Waiting), 0);
    assert!(summary.unmet.is_empty());

    assert_eq!(
        relative_paths(&summary, "SpikeSync_probe00"),
        vec!["alf/probe00/spikes.amps.json", "alf/probe00/spikes.times.json"]
    );
    assert_eq!(
        relative_paths(&summary, "SpikeSync_probe01"),
        vec!["alf/probe01/spikes.times.json"]
    );
    let failed = summary.outcome("SpikeSync_probe01").unwrap();
    assert_eq!(failed.records[0].dataset_type, "spikes.times");
    assert!(failed.error.as_deref().unwrap().contains("1 amplitudes for 4 spikes"));

    let cataloged = catalog.records_for(summary.session.id).await;
    assert!(cataloged
        .iter()
        .any(|r| r.relative_path == "alf/probe01/spikes.times.json"));
    assert!(!cataloged
        .iter()
        .any(|r| r.relative_path == "alf/probe01/spikes.amps.json"));
}

#[tokio::test]
async fn test_rerun_retries_only_errored_node() {
    let fx = EphysSessionFixture::new(&["probe00", "probe01"]);
    fx.set_amplitudes("probe01", &[1.0]);
    let (pipeline, _, repository) = memory_pipeline(PipelineConfig::default());
    let first = pipeline.build_and_run(&fx.root).await.unwrap();
    assert_eq!(first.status("SpikeSync_probe01"), Some(TaskStatus::Errored));

    fx.set_amplitudes("probe01", &[3.0, 4.0, 5.0, 6.0]);
    let second = pipeline.build_and_run(&fx.root).await.unwrap();

    let retried = second.outcome("SpikeSync_probe01").unwrap();
    assert_eq!(retried.status, TaskStatus::Complete);
    assert!(!retried.skipped);
    for task in ["RegisterRaw", "EphysSync", "ProbeDescription", "SpikeSync_probe00", "SyncQc"] {
        assert!(second.outcome(task).unwrap().skipped, "{} should be skipped", task);
    }
    assert_eq!(second.count(TaskStatus::Complete), second.tasks.len());
    assert!(second.is_success());

    // the probe mapping came from the repository, not a fresh sync
    assert_eq!(repository.load_mappings(second.session.id).await.unwrap().len(), 2);
    let records = repository.task_records(second.session.id).await.unwrap();
    let spike_sync = records
        .iter()
        .find(|r| r.task_name == "SpikeSync_probe01")
        .unwrap();
    assert_eq!(spike_sync.attempts, 2);
}

#[tokio::test]
async fn test_forced_rerun_is_idempotent() {
    let fx = EphysSessionFixture::new(&["probe00"]);
    let (pipeline, catalog, _) = memory_pipeline(PipelineConfig::default());
    let first = pipeline.build_and_run(&fx.root).await.unwrap();
    assert!(first.is_success());
    let before = catalog.records().await;

    let forced = Pipeline::new(
        PipelineConfig::default().with_force(true),
        catalog.clone(),
        pipeline.repository().clone(),
    );
    let second = forced.build_and_run(&fx.root).await.unwrap();

    assert!(second.tasks.values().all(|t| !t.skipped));
    assert!(second
        .records()
        .all(|r| r.outcome == RegistrationOutcome::Unchanged));
    let after = catalog.records().await;
    assert_eq!(before.len(), after.len());
    assert!(catalog.history().await.is_empty());
}

#[tokio::test]
async fn test_zero_pulse_probe_errors_its_dependents() {
    let fx = EphysSessionFixture::new(&["probe00", "probe01"]);
    fx.set_probe_pulses("probe01", &[]);
    let (pipeline, _, repository) = memory_pipeline(PipelineConfig::default());

    let summary = pipeline.build_and_run(&fx.root).await.unwrap();

    assert_eq!(summary.status("EphysSync"), Some(TaskStatus::PartialComplete));
    assert_eq!(summary.status("SpikeSync_probe00"), Some(TaskStatus::Complete));
    let probe01 = summary.outcome("SpikeSync_probe01").unwrap();
    assert_eq!(probe01.status, TaskStatus::Errored);
    assert!(probe01.error.as_deref().unwrap().contains("probe01"));
    assert!(probe01.records.is_empty());
    assert_eq!(summary.status("SyncQc"), Some(TaskStatus::Errored));

    let persisted = repository.load_mappings(summary.session.id).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].device, "probe00");
}

#[tokio::test]
async fn test_unusable_reference_leaves_dependents_waiting() {
    let fx = EphysSessionFixture::new(&["probe00", "probe01"]);
    fx.remove_reference();
    let (pipeline, _, _) = memory_pipeline(PipelineConfig::default());

    let summary = pipeline.build_and_run(&fx.root).await.unwrap();

    assert_eq!(summary.status("EphysSync"), Some(TaskStatus::Errored));
    assert_eq!(summary.status("ProbeDescription"), Some(TaskStatus::Complete));
    assert_eq!(summary.count(TaskStatus::Waiting), 3);
    assert_eq!(summary.unmet.len(), 3);
    assert!(summary
        .unmet
        .iter()
        .all(|u| u.upstream == "EphysSync" && u.status == TaskStatus::Errored));
    assert!(matches!(
        summary.unmet_error(),
        Some(PipelineError::DependencyUnmet { .. })
    ));
}

#[tokio::test]
async fn test_registration_failures_do_not_fail_tasks() {
    let fx = EphysSessionFixture::new(&["probe00", "probe01"]);
    let client = Arc::new(RecordingClient::new().rejecting("spikes.amps.json"));
    let pipeline = Pipeline::new(
        PipelineConfig::default(),
        client.clone(),
        Arc::new(MemoryRepository::new()),
    );

    let summary = pipeline.build_and_run(&fx.root).await.unwrap();

    let probe00 = summary.outcome("SpikeSync_probe00").unwrap();
    assert_eq!(probe00.status, TaskStatus::Complete);
    assert_eq!(probe00.records.len(), 1);
    assert_eq!(probe00.registration_failures.len(), 1);
    assert!(probe00.registration_failures[0].error.contains("timed out"));
    assert_eq!(summary.registration_failures().count(), 2);
    assert!(!summary.is_success());
    assert_eq!(client.calls_for("SpikeSync_probe00").len(), 2);
}

/// Writes one file, then panics.
struct ExplodingTask;

#[async_trait]
impl ExtractionTask for ExplodingTask {
    fn kind(&self) -> &'static str {
        "exploding"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let path = ctx.root().join("alf/_test_partial.values.json");
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(&path, "[1, 2, 3]")?;
        ctx.record_output(&path);
        panic!("index out of bounds");
    }
}

#[tokio::test]
async fn test_panicking_task_outputs_are_registered() {
    let fx = EphysSessionFixture::new(&["probe00"]);
    let classification = SessionLocator::new().classify(&fx.root).unwrap();
    let graph = TaskGraph::from_nodes(vec![TaskNode::new("Exploding", Arc::new(ExplodingTask))]).unwrap();
    let client = Arc::new(RecordingClient::new());
    let pipeline = Pipeline::new(
        PipelineConfig::default(),
        client.clone(),
        Arc::new(MemoryRepository::new()),
    );

    let summary = pipeline.run_graph(classification, &graph).await.unwrap();

    let outcome = summary.outcome("Exploding").unwrap();
    assert_eq!(outcome.status, TaskStatus::Errored);
    assert!(outcome.error.as_deref().unwrap().contains("index out of bounds"));
    assert_eq!(
        client.calls_for("Exploding"),
        vec![fx.root.join("alf/_test_partial.values.json")]
    );
    assert_eq!(outcome.records.len(), 1);
}

#[tokio::test]
async fn test_batch_skips_unrecognized_sessions() {
    let fx = EphysSessionFixture::new(&["probe00"]);
    let empty = tempfile::tempdir().unwrap();
    let (pipeline, _, _) = memory_pipeline(PipelineConfig::default());

    let report = pipeline
        .run_batch(&[
            fx.root.clone(),
            empty.path().to_path_buf(),
            empty.path().join("missing"),
        ])
        .await;

    assert_eq!(report.sessions.len(), 1);
    assert_eq!(report.skipped.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(report.total(), 3);
}

#[tokio::test]
async fn test_state_survives_restart_with_sqlite() {
    let fx = EphysSessionFixture::new(&["probe00"]);
    let state = tempfile::tempdir().unwrap();
    let db = state.path().join("neuropipe.db");
    let catalog_path = state.path().join("datasets.json");

    {
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            Arc::new(LocalCatalog::open(&catalog_path).await.unwrap()),
            Arc::new(SqliteRepository::open(db.to_str().unwrap()).await.unwrap()),
        );
        let summary = pipeline.build_and_run(&fx.root).await.unwrap();
        assert!(summary.is_success());
    }

    let catalog = Arc::new(LocalCatalog::open(&catalog_path).await.unwrap());
    let pipeline = Pipeline::new(
        PipelineConfig::default(),
        catalog.clone(),
        Arc::new(SqliteRepository::open(db.to_str().unwrap()).await.unwrap()),
    );
    let summary = pipeline.build_and_run(&fx.root).await.unwrap();

    assert!(summary.tasks.values().all(|t| t.skipped));
    assert!(!catalog.records().await.is_empty());
}
