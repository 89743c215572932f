//! Behaviour tasks: trial table, wheel and passive stimulus times.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ExtractionError;
use crate::pipeline::TaskContext;
use crate::session::layout;
use crate::sync::{resample, Fill, Interpolation, TimeSeries};

use super::{read_json, write_json, ExtractionTask};

/// Wheel resampling step (1 kHz).
const WHEEL_STEP_S: f64 = 1e-3;

/// One line of the rig's trial data file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawTrial {
    pub trial_start: f64,
    pub trial_end: f64,
    #[serde(default)]
    pub stim_on: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl RawTrial {
    fn feedback_type(&self) -> i8 {
        match self.feedback.as_deref() {
            Some("correct") => 1,
            Some("error") => -1,
            _ => 0,
        }
    }
}

/// Parses the one-trial-per-line JSON file, skipping blank lines.
pub fn read_trials(path: &Path) -> Result<Vec<RawTrial>, ExtractionError> {
    if !path.is_file() {
        return Err(ExtractionError::MissingInput(path.to_path_buf()));
    }
    let contents = fs::read_to_string(path)?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| ExtractionError::InvalidInput {
                path: path.to_path_buf(),
                reason: format!("line {}: {}", i + 1, e),
            })
        })
        .collect()
}

/// Converts behaviour controller times to output times: identity on
/// training rigs, the bpod sync mapping on ephys rigs.
fn clock(ctx: &TaskContext, synced: bool) -> Result<Box<dyn Fn(f64) -> f64 + Send>, ExtractionError> {
    if !synced {
        return Ok(Box::new(|t| t));
    }
    let mapping = ctx.mapping(layout::BPOD_DEVICE)?;
    Ok(Box::new(move |t| mapping.map(t)))
}

/// Extracts the trial table (and the wheel when an encoder file exists).
#[derive(Debug, Clone)]
pub struct TrialsTask {
    synced: bool,
}

impl TrialsTask {
    /// `synced` trials are mapped through the behaviour controller mapping.
    pub fn new(synced: bool) -> Self {
        Self { synced }
    }

    fn extract_wheel(
        &self,
        ctx: &TaskContext,
        to_reference: &(dyn Fn(f64) -> f64 + Send),
    ) -> Result<Vec<PathBuf>, ExtractionError> {
        let raw = ctx
            .root()
            .join(layout::RAW_BEHAVIOR_DIR)
            .join(layout::ENCODER_POSITIONS_FILE);
        if !raw.is_file() {
            debug!(session = %ctx.session(), "No wheel encoder file");
            return Ok(Vec::new());
        }
        let samples: Vec<[f64; 2]> = read_json(&raw)?;
        let series = TimeSeries::new(
            "position",
            samples.iter().map(|s| to_reference(s[0])).collect(),
            samples.iter().map(|s| s[1]).collect(),
        );
        let resampled = resample(WHEEL_STEP_S, &[series], None, Interpolation::Linear, Fill::Nan)
            .map_err(|e| ExtractionError::InvalidInput {
                path: raw.clone(),
                reason: e.to_string(),
            })?;

        let alf = Path::new(layout::ALF_DIR);
        Ok(vec![
            write_json(ctx, &alf.join(layout::WHEEL_TIMESTAMPS_FILE), &resampled.times)?,
            write_json(ctx, &alf.join(layout::WHEEL_POSITION_FILE), &resampled.columns[0])?,
        ])
    }
}

#[async_trait]
impl ExtractionTask for TrialsTask {
    fn kind(&self) -> &'static str {
        if self.synced {
            "trials_synced"
        } else {
            "trials"
        }
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let path = ctx.root().join(layout::RAW_BEHAVIOR_DIR).join(layout::TASK_DATA_FILE);
        let trials = read_trials(&path)?;
        if trials.is_empty() {
            return Err(ExtractionError::InvalidInput {
                path,
                reason: "no trials".to_string(),
            });
        }
        let to_reference = clock(ctx, self.synced)?;

        let intervals: Vec<[f64; 2]> = trials
            .iter()
            .map(|t| [to_reference(t.trial_start), to_reference(t.trial_end)])
            .collect();
        let stim_on: Vec<Option<f64>> = trials.iter().map(|t| t.stim_on.map(&to_reference)).collect();
        let feedback: Vec<i8> = trials.iter().map(RawTrial::feedback_type).collect();

        let alf = Path::new(layout::ALF_DIR);
        let mut produced = vec![
            write_json(ctx, &alf.join(layout::TRIALS_INTERVALS_FILE), &intervals)?,
            write_json(ctx, &alf.join(layout::TRIALS_STIM_ON_FILE), &stim_on)?,
            write_json(ctx, &alf.join(layout::TRIALS_FEEDBACK_FILE), &feedback)?,
        ];
        produced.extend(self.extract_wheel(ctx, to_reference.as_ref())?);

        info!(session = %ctx.session(), trials = trials.len(), synced = self.synced, "Trials extracted");
        Ok(produced)
    }
}

/// Maps passive stimulus onsets to the reference clock.
#[derive(Debug, Default, Clone)]
pub struct PassiveTimesTask;

impl PassiveTimesTask {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExtractionTask for PassiveTimesTask {
    fn kind(&self) -> &'static str {
        "passive_times"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let mapping = ctx.mapping(layout::BPOD_DEVICE)?;
        let onsets: Vec<f64> =
            read_json(&ctx.root().join(layout::RAW_PASSIVE_DIR).join(layout::PASSIVE_RAW_FILE))?;
        let times = mapping.map_all(&onsets);
        let path = write_json(
            ctx,
            &Path::new(layout::ALF_DIR).join(layout::PASSIVE_TIMES_FILE),
            &times,
        )?;
        Ok(vec![path])
    }
}
