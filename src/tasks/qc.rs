//! Quality control tasks.
//!
//! QC tasks always write their report before failing, so a failed check
//! still leaves an inspectable dataset in the catalog.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ExtractionError;
use crate::pipeline::TaskContext;
use crate::session::layout;

use super::{read_json, write_json, ExtractionTask};

/// Pulse match ratio below which a stream fails sync QC.
pub const DEFAULT_MIN_MATCH_RATIO: f64 = 0.9;

/// Fraction of failing trials above which trials QC fails.
const MAX_FAILING_TRIAL_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialsQcReport {
    pub n_trials: usize,
    pub failing_trials: Vec<usize>,
    pub passed: bool,
}

/// Checks trial intervals are ordered and stimulus onsets fall inside them.
#[derive(Debug, Default, Clone)]
pub struct TrialsQcTask;

impl TrialsQcTask {
    pub fn new() -> Self {
        Self
    }
}

fn trial_passes(i: usize, intervals: &[[f64; 2]], stim_on: &[Option<f64>]) -> bool {
    let [start, end] = intervals[i];
    if !(end > start) {
        return false;
    }
    if i > 0 && start < intervals[i - 1][1] {
        return false;
    }
    match stim_on.get(i).copied().flatten() {
        Some(t) => t >= start && t <= end,
        None => true,
    }
}

#[async_trait]
impl ExtractionTask for TrialsQcTask {
    fn kind(&self) -> &'static str {
        "trials_qc"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let alf = ctx.root().join(layout::ALF_DIR);
        let intervals: Vec<[f64; 2]> = read_json(&alf.join(layout::TRIALS_INTERVALS_FILE))?;
        let stim_on: Vec<Option<f64>> = read_json(&alf.join(layout::TRIALS_STIM_ON_FILE))?;

        let failing_trials: Vec<usize> = (0..intervals.len())
            .filter(|&i| !trial_passes(i, &intervals, &stim_on))
            .collect();
        let fraction = if intervals.is_empty() {
            1.0
        } else {
            failing_trials.len() as f64 / intervals.len() as f64
        };
        let report = TrialsQcReport {
            n_trials: intervals.len(),
            passed: fraction <= MAX_FAILING_TRIAL_FRACTION,
            failing_trials,
        };

        let path = write_json(
            ctx,
            &Path::new(layout::ALF_DIR).join(layout::TRIALS_QC_FILE),
            &report,
        )?;
        if !report.passed {
            return Err(ExtractionError::QcFailed(format!(
                "{} of {} trials failed checks",
                report.failing_trials.len(),
                report.n_trials
            )));
        }
        info!(session = %ctx.session(), trials = report.n_trials, "Trials QC passed");
        Ok(vec![path])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamQc {
    pub device: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residual_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_fallback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Checks every expected stream has a mapping with enough matched pulses.
#[derive(Debug, Clone)]
pub struct SyncQcTask {
    devices: Vec<String>,
    min_match_ratio: f64,
}

impl SyncQcTask {
    pub fn new(devices: Vec<String>, min_match_ratio: f64) -> Self {
        Self {
            devices,
            min_match_ratio,
        }
    }
}

#[async_trait]
impl ExtractionTask for SyncQcTask {
    fn kind(&self) -> &'static str {
        "sync_qc"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let streams: Vec<StreamQc> = self
            .devices
            .iter()
            .map(|device| match ctx.mapping(device) {
                Ok(mapping) => {
                    let ratio = mapping.quality.match_ratio();
                    StreamQc {
                        device: device.clone(),
                        passed: ratio >= self.min_match_ratio,
                        match_ratio: Some(ratio),
                        residual_s: Some(mapping.quality.residual_s),
                        used_fallback: Some(mapping.quality.used_fallback),
                        error: None,
                    }
                }
                Err(e) => StreamQc {
                    device: device.clone(),
                    passed: false,
                    match_ratio: None,
                    residual_s: None,
                    used_fallback: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        let path = write_json(
            ctx,
            &Path::new(layout::ALF_DIR).join(layout::SYNC_QC_FILE),
            &streams,
        )?;

        let failed: Vec<&str> = streams
            .iter()
            .filter(|s| !s.passed)
            .map(|s| s.device.as_str())
            .collect();
        if !failed.is_empty() {
            warn!(session = %ctx.session(), failed = ?failed, "Sync QC failed");
            return Err(ExtractionError::QcFailed(format!(
                "sync QC failed for {}",
                failed.join(", ")
            )));
        }
        Ok(vec![path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::pipeline::MappingSet;
    use crate::session::SessionLocator;
    use crate::sync::SyncMapping;
    use std::fs;
    use std::sync::Arc;

    fn session(dir: &Path) -> PathBuf {
        let root = dir.join("churchlandlab/Subjects/CSHL049/2020-01-08/001");
        fs::create_dir_all(root.join("raw_behavior_data")).unwrap();
        fs::create_dir_all(root.join("alf")).unwrap();
        fs::write(
            root.join("raw_behavior_data").join(layout::TASK_SETTINGS_FILE),
            r#"{"PYBPOD_PROTOCOL": "_iblrig_tasks_biasedChoiceWorld6.2.5"}"#,
        )
        .unwrap();
        root
    }

    fn context(root: &Path, mappings: MappingSet) -> TaskContext {
        let classification = SessionLocator::new().classify(root).unwrap();
        TaskContext::new(Arc::new(classification), "Qc", Arc::new(mappings))
    }

    #[tokio::test]
    async fn test_trials_qc_writes_report_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = session(dir.path());
        fs::write(root.join("alf/_ibl_trials.intervals.json"), "[[0, 2], [1, 3], [4, 3]]").unwrap();
        fs::write(root.join("alf/_ibl_trials.stimOn_times.json"), "[0.5, null, null]").unwrap();

        let ctx = context(&root, MappingSet::new());
        let err = TrialsQcTask::new().run(&ctx).await.unwrap_err();
        assert!(matches!(err, ExtractionError::QcFailed(_)));

        let report: TrialsQcReport = read_json(&root.join("alf/_neuropipe_qc.trials.json")).unwrap();
        assert_eq!(report.failing_trials, vec![1, 2]);
        assert!(!report.passed);
        assert_eq!(ctx.recorded_outputs().len(), 1);
    }

    #[tokio::test]
    async fn test_trials_qc_passes() {
        let dir = tempfile::tempdir().unwrap();
        let root = session(dir.path());
        fs::write(root.join("alf/_ibl_trials.intervals.json"), "[[0, 2], [3, 5]]").unwrap();
        fs::write(root.join("alf/_ibl_trials.stimOn_times.json"), "[0.5, 3.5]").unwrap();

        let ctx = context(&root, MappingSet::new());
        let produced = TrialsQcTask::new().run(&ctx).await.unwrap();
        assert_eq!(produced.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_qc_consumes_mapping_quality() {
        let dir = tempfile::tempdir().unwrap();
        let root = session(dir.path());
        let set = MappingSet::from_mappings([SyncMapping::identity("probe00", 100)]).merged(
            [("probe01".to_string(), Err(SyncError::NoPulses("probe01".to_string())))]
                .into_iter()
                .collect(),
        );
        let ctx = context(&root, set);
        let task = SyncQcTask::new(vec!["probe00".to_string(), "probe01".to_string()], 0.9);

        let err = task.run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("probe01"));
        let report: Vec<StreamQc> = read_json(&root.join("alf/_neuropipe_qc.sync.json")).unwrap();
        assert!(report[0].passed);
        assert!(!report[1].passed);
        assert!(report[1].error.is_some());
    }
}
