//! Electrophysiology tasks: clock synchronization, spike times, probe
//! description and planned trajectories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ExtractionError;
use crate::pipeline::TaskContext;
use crate::session::layout;
use crate::session::spikeglx::{find_ap_meta, ProbeMeta};
use crate::session::{read_probe_insertions, ProbeInsertion};
use crate::sync::{
    ClockStream, ClockSynchronizer, DeviceKind, SyncConfig, SyncMapping, SyncQuality, SyncSource,
};

use super::{read_json, write_json, ExtractionTask};

/// Contents of a sync points dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPointsFile {
    pub device: String,
    pub reference: String,
    pub quality: SyncQuality,
    /// `[local, reference]` pairs.
    pub points: Vec<[f64; 2]>,
}

impl SyncPointsFile {
    pub fn from_mapping(mapping: &SyncMapping) -> Self {
        Self {
            device: mapping.device.clone(),
            reference: mapping.reference.clone(),
            quality: mapping.quality.clone(),
            points: mapping.sync_points(),
        }
    }
}

/// Relative path of the sync points dataset of a device.
pub fn sync_points_path(device: &str) -> PathBuf {
    Path::new(layout::ALF_DIR)
        .join(device)
        .join(layout::SYNC_POINTS_FILE)
}

/// Aligns every probe, the behaviour controller and the cameras onto the
/// acquisition box clock.
///
/// Streams that fail are published as failures so dependents get the exact
/// reason; the node ends partially complete through its missing sync points
/// outputs. It raises only when the reference is unusable or nothing aligns.
#[derive(Debug, Clone)]
pub struct EphysSyncTask {
    synchronizer: ClockSynchronizer,
    probes: Vec<String>,
    cameras: Vec<String>,
    behavior: bool,
}

impl EphysSyncTask {
    pub fn new(config: SyncConfig, probes: Vec<String>, cameras: Vec<String>, behavior: bool) -> Self {
        Self {
            synchronizer: ClockSynchronizer::new(config),
            probes,
            cameras,
            behavior,
        }
    }

    /// Loads a stream, treating a missing file as a stream without pulses.
    fn load_stream(path: &Path, device: &str, kind: DeviceKind) -> Result<ClockStream, ExtractionError> {
        match ClockStream::load_json(path, device, kind) {
            Err(ExtractionError::MissingInput(_)) => {
                warn!(device, path = %path.display(), "Sync file missing");
                Ok(ClockStream::new(device, kind, Vec::new()))
            }
            other => other,
        }
    }

    fn sources(&self, root: &Path) -> Result<Vec<SyncSource>, ExtractionError> {
        let ephys = root.join(layout::RAW_EPHYS_DIR);
        let mut sources = Vec::new();

        for probe in &self.probes {
            let dir = ephys.join(probe);
            let primary =
                Self::load_stream(&dir.join(layout::SPIKEGLX_SYNC_FILE), probe, DeviceKind::Probe)?;
            let mut source = SyncSource::new(primary);
            let secondary = dir.join(layout::SPIKEGLX_SYNC_SECONDARY_FILE);
            if secondary.is_file() {
                source = source.with_fallback(ClockStream::load_json(&secondary, probe, DeviceKind::Probe)?);
            }
            sources.push(source);
        }

        if self.behavior {
            let path = root.join(layout::RAW_BEHAVIOR_DIR).join(layout::BPOD_SYNC_FILE);
            sources.push(SyncSource::new(Self::load_stream(
                &path,
                layout::BPOD_DEVICE,
                DeviceKind::BehaviorController,
            )?));
        }

        for label in &self.cameras {
            let device = layout::camera_device(label);
            let path = root.join(layout::RAW_VIDEO_DIR).join(layout::camera_sync_file(label));
            sources.push(SyncSource::new(Self::load_stream(&path, &device, DeviceKind::Camera)?));
        }

        Ok(sources)
    }
}

#[async_trait]
impl ExtractionTask for EphysSyncTask {
    fn kind(&self) -> &'static str {
        "ephys_sync"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let root = ctx.root();
        let reference = ClockStream::load_json(
            &root.join(layout::RAW_EPHYS_DIR).join(layout::SPIKEGLX_SYNC_FILE),
            layout::ACQUISITION_DEVICE,
            DeviceKind::AcquisitionBox,
        )?;
        let sources = self.sources(root)?;
        let outcome = self.synchronizer.synchronize(&reference, &sources)?;

        let mut produced = Vec::new();
        for (device, mapping) in &outcome.mappings {
            let path = write_json(ctx, &sync_points_path(device), &SyncPointsFile::from_mapping(mapping))?;
            produced.push(path);
            ctx.publish_mapping(Arc::clone(mapping));
        }
        for (device, error) in &outcome.failures {
            ctx.publish_sync_failure(device.clone(), error.clone());
        }

        info!(
            session = %ctx.session(),
            synchronized = outcome.mappings.len(),
            failed = outcome.failures.len(),
            "Ephys synchronization finished"
        );

        if outcome.mappings.is_empty() {
            if let Some(error) = outcome.failures.into_values().next() {
                return Err(error.into());
            }
        }
        Ok(produced)
    }
}

/// Converts one probe's spike sample indices to reference-clock times.
///
/// Times are always recomputed from the raw sample indices and the probe
/// mapping handed in by the context; an existing times file is overwritten.
#[derive(Debug, Clone)]
pub struct SpikeSyncTask {
    probe: String,
}

impl SpikeSyncTask {
    pub fn new(probe: impl Into<String>) -> Self {
        Self { probe: probe.into() }
    }
}

#[async_trait]
impl ExtractionTask for SpikeSyncTask {
    fn kind(&self) -> &'static str {
        "spike_sync"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let mapping = ctx.mapping(&self.probe)?;
        let raw_dir = ctx.root().join(layout::RAW_EPHYS_DIR).join(&self.probe);
        let meta_path = find_ap_meta(&raw_dir)
            .ok_or_else(|| ExtractionError::MissingInput(raw_dir.join("*.ap.meta")))?;
        let meta = ProbeMeta::read(&meta_path)?;

        let samples: Vec<u64> = read_json(&raw_dir.join(layout::SPIKE_SAMPLES_FILE))?;
        if samples.windows(2).any(|w| w[1] < w[0]) {
            return Err(ExtractionError::InvalidInput {
                path: raw_dir.join(layout::SPIKE_SAMPLES_FILE),
                reason: "spike samples are not sorted".to_string(),
            });
        }
        let local: Vec<f64> = samples.iter().map(|&s| s as f64 / meta.sample_rate).collect();
        let times = mapping.map_all(&local);

        let alf = Path::new(layout::ALF_DIR).join(&self.probe);
        let times_path = write_json(ctx, &alf.join(layout::SPIKE_TIMES_FILE), &times)?;

        let amplitudes_path = raw_dir.join(layout::SPIKE_AMPLITUDES_RAW_FILE);
        let amplitudes: Vec<f64> = read_json(&amplitudes_path)?;
        if amplitudes.len() != samples.len() {
            return Err(ExtractionError::InvalidInput {
                path: amplitudes_path,
                reason: format!(
                    "{} amplitudes for {} spikes",
                    amplitudes.len(),
                    samples.len()
                ),
            });
        }
        let amps_path = write_json(ctx, &alf.join(layout::SPIKE_AMPS_FILE), &amplitudes)?;

        info!(
            session = %ctx.session(),
            probe = %self.probe,
            spikes = times.len(),
            "Spike times synchronized"
        );
        Ok(vec![times_path, amps_path])
    }
}

/// One entry of the probe description dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDescription {
    pub label: String,
    pub model: Option<String>,
    pub serial: Option<u64>,
    pub raw_file_name: Option<String>,
    pub sample_rate: f64,
}

/// One entry of the probe trajectory dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeTrajectory {
    pub label: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub phi: f64,
    pub theta: f64,
    pub depth: f64,
    pub beta: f64,
}

impl ProbeTrajectory {
    fn new(label: &str, insertion: &ProbeInsertion) -> Self {
        Self {
            label: label.to_string(),
            x: insertion.x,
            y: insertion.y,
            z: insertion.z,
            phi: insertion.phi,
            theta: insertion.theta,
            depth: insertion.depth,
            beta: insertion.beta,
        }
    }
}

/// Pairs discovered probes with the rig's planned insertions.
///
/// Insertions are looked up by label. When the rig labels differ from the
/// probe directories, insertions are paired in alphabetical order of both and
/// a warning lists the pairing; surplus entries on either side are dropped.
pub fn probe_trajectories(
    probes: &[String],
    insertions: &BTreeMap<String, ProbeInsertion>,
) -> Vec<ProbeTrajectory> {
    if probes.iter().all(|label| insertions.contains_key(label)) {
        return probes
            .iter()
            .filter_map(|label| insertions.get(label).map(|i| ProbeTrajectory::new(label, i)))
            .collect();
    }

    let mut labels: Vec<&String> = probes.iter().collect();
    labels.sort();
    warn!(
        probes = ?labels,
        settings = ?insertions.keys().collect::<Vec<_>>(),
        "Probe labels do not match the task settings, pairing insertions alphabetically"
    );
    labels
        .into_iter()
        .zip(insertions.iter())
        .map(|(label, (rig_label, insertion))| {
            warn!(probe = %label, settings = %rig_label, "Paired probe insertion");
            ProbeTrajectory::new(label, insertion)
        })
        .collect()
}

/// Writes `probes.description.json` from each probe's meta file, and
/// `probes.trajectory.json` when the task settings carry planned insertions.
#[derive(Debug, Clone)]
pub struct ProbeDescriptionTask {
    probes: Vec<String>,
}

impl ProbeDescriptionTask {
    pub fn new(probes: Vec<String>) -> Self {
        Self { probes }
    }
}

#[async_trait]
impl ExtractionTask for ProbeDescriptionTask {
    fn kind(&self) -> &'static str {
        "probe_description"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let ephys = ctx.root().join(layout::RAW_EPHYS_DIR);
        let mut descriptions = Vec::with_capacity(self.probes.len());
        for label in &self.probes {
            let dir = ephys.join(label);
            let meta_path =
                find_ap_meta(&dir).ok_or_else(|| ExtractionError::MissingInput(dir.join("*.ap.meta")))?;
            let meta = ProbeMeta::read(&meta_path)?;
            descriptions.push(ProbeDescription {
                label: label.clone(),
                model: meta.model,
                serial: meta.serial,
                raw_file_name: meta.raw_file_name,
                sample_rate: meta.sample_rate,
            });
        }
        let path = write_json(
            ctx,
            &Path::new(layout::ALF_DIR).join(layout::PROBE_DESCRIPTION_FILE),
            &descriptions,
        )?;
        let mut produced = vec![path];

        let insertions = read_probe_insertions(ctx.root())?;
        if insertions.is_empty() {
            warn!(
                session = %ctx.session(),
                "No probe insertions in the task settings, skipping probe trajectories"
            );
            return Ok(produced);
        }
        let trajectories = probe_trajectories(&self.probes, &insertions);
        produced.push(write_json(
            ctx,
            &Path::new(layout::ALF_DIR).join(layout::PROBE_TRAJECTORY_FILE),
            &trajectories,
        )?);
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::pipeline::MappingSet;
    use crate::session::SessionLocator;
    use std::fs;

    fn pulses(n: usize) -> Vec<f64> {
        let mut t = 0.0;
        (0..n)
            .map(|i| {
                t += 0.4 + ((i * 7919) % 13) as f64 * 0.0731;
                t
            })
            .collect()
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn ephys_session(dir: &Path) -> PathBuf {
        let root = dir.join("mainenlab/Subjects/ZM_2/2021-05-04/001");
        let reference = pulses(80);
        write(
            &root.join("raw_ephys_data/_spikeglx_sync.times.json"),
            &serde_json::to_string(&reference).unwrap(),
        );
        let probe: Vec<f64> = reference.iter().map(|t| t * (1.0 + 10e-6) + 0.5).collect();
        write(
            &root.join("raw_ephys_data/probe00/_spikeglx_sync.times.json"),
            &serde_json::to_string(&probe).unwrap(),
        );
        write(
            &root.join("raw_ephys_data/probe00/_spikeglx_ephysData_g0_t0.imec0.ap.meta"),
            "imSampRate=30000\nimDatPrb_sn=18005116811\nimDatPrb_type=0\nfileName=ephys.imec0.ap.bin\n",
        );
        write(&root.join("raw_ephys_data/probe00/spikes.samples.json"), "[15000, 30000, 45000]");
        write(&root.join("raw_ephys_data/probe00/spikes.amplitudes.json"), "[1.0, 2.0, 3.0]");
        root
    }

    fn context(root: &Path, task: &str, mappings: MappingSet) -> TaskContext {
        let classification = SessionLocator::new().classify(root).unwrap();
        TaskContext::new(Arc::new(classification), task, Arc::new(mappings))
    }

    #[tokio::test]
    async fn test_sync_then_spike_times() {
        let dir = tempfile::tempdir().unwrap();
        let root = ephys_session(dir.path());

        let ctx = context(&root, "EphysSync", MappingSet::new());
        let task = EphysSyncTask::new(SyncConfig::default(), vec!["probe00".to_string()], vec![], false);
        let produced = task.run(&ctx).await.unwrap();
        assert_eq!(produced, vec![root.join("alf/probe00/_neuropipe_sync.points.json")]);
        let points: SyncPointsFile = read_json(&produced[0]).unwrap();
        assert_eq!(points.quality.matched, 80);

        let mappings = MappingSet::new().merged(ctx.take_published());
        let ctx = context(&root, "SpikeSync_probe00", mappings);
        let produced = SpikeSyncTask::new("probe00").run(&ctx).await.unwrap();
        assert_eq!(produced.len(), 2);

        let times: Vec<f64> = read_json(&root.join("alf/probe00/spikes.times.json")).unwrap();
        // local second 1.0 maps back through t * (1 + 10e-6) + 0.5
        assert!((times[1] - (1.0 - 0.5) / (1.0 + 10e-6)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_spike_sync_records_times_before_failing() {
        let dir = tempfile::tempdir().unwrap();
        let root = ephys_session(dir.path());
        write(&root.join("raw_ephys_data/probe00/spikes.amplitudes.json"), "[1.0]");

        let mapping = SyncMapping::identity("probe00", 80);
        let ctx = context(&root, "SpikeSync_probe00", MappingSet::from_mappings([mapping]));
        let err = SpikeSyncTask::new("probe00").run(&ctx).await.unwrap_err();

        assert!(matches!(err, ExtractionError::InvalidInput { .. }));
        assert_eq!(ctx.recorded_outputs(), vec![root.join("alf/probe00/spikes.times.json")]);
    }

    #[tokio::test]
    async fn test_spike_sync_without_mapping_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = ephys_session(dir.path());
        let ctx = context(&root, "SpikeSync_probe00", MappingSet::new());
        let err = SpikeSyncTask::new("probe00").run(&ctx).await.unwrap_err();
        assert!(matches!(err, ExtractionError::SynchronizationQuality(_)));
        assert!(ctx.recorded_outputs().is_empty());
    }

    #[tokio::test]
    async fn test_sync_fails_when_nothing_aligns() {
        let dir = tempfile::tempdir().unwrap();
        let root = ephys_session(dir.path());
        write(&root.join("raw_ephys_data/probe00/_spikeglx_sync.times.json"), "[]");

        let ctx = context(&root, "EphysSync", MappingSet::new());
        let task = EphysSyncTask::new(SyncConfig::default(), vec!["probe00".to_string()], vec![], false);
        let err = task.run(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::SynchronizationQuality(SyncError::NoPulses(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_description() {
        let dir = tempfile::tempdir().unwrap();
        let root = ephys_session(dir.path());
        let ctx = context(&root, "ProbeDescription", MappingSet::new());
        let produced = ProbeDescriptionTask::new(vec!["probe00".to_string()])
            .run(&ctx)
            .await
            .unwrap();
        let descriptions: Vec<ProbeDescription> = read_json(&produced[0]).unwrap();
        assert_eq!(descriptions[0].serial, Some(18005116811));
        assert_eq!(descriptions[0].raw_file_name.as_deref(), Some("ephys.imec0.ap.bin"));
    }

    fn insertion(x: f64) -> ProbeInsertion {
        ProbeInsertion {
            x,
            y: -2000.0,
            z: 0.0,
            phi: 45.0,
            theta: 15.0,
            depth: 4000.0,
            beta: 0.0,
        }
    }

    #[test]
    fn test_trajectories_match_by_label() {
        let probes = vec!["probe01".to_string(), "probe00".to_string()];
        let insertions = BTreeMap::from([
            ("probe00".to_string(), insertion(1.0)),
            ("probe01".to_string(), insertion(2.0)),
        ]);
        let trajectories = probe_trajectories(&probes, &insertions);
        assert_eq!(trajectories.len(), 2);
        assert_eq!(trajectories[0].label, "probe01");
        assert_eq!(trajectories[0].x, 2.0);
        assert_eq!(trajectories[1].x, 1.0);
    }

    #[test]
    fn test_trajectories_with_mismatched_labels_pair_alphabetically() {
        let probes = vec!["probe_right".to_string(), "probe_left".to_string()];
        let insertions = BTreeMap::from([
            ("probe00".to_string(), insertion(1.0)),
            ("probe01".to_string(), insertion(2.0)),
            ("probe02".to_string(), insertion(3.0)),
        ]);
        let trajectories = probe_trajectories(&probes, &insertions);
        assert_eq!(trajectories.len(), 2);
        assert_eq!(trajectories[0].label, "probe_left");
        assert_eq!(trajectories[0].x, 1.0);
        assert_eq!(trajectories[1].label, "probe_right");
        assert_eq!(trajectories[1].x, 2.0);
    }

    #[tokio::test]
    async fn test_probe_description_writes_trajectory_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let root = ephys_session(dir.path());
        write(
            &root.join(layout::RAW_BEHAVIOR_DIR).join(layout::TASK_SETTINGS_FILE),
            &serde_json::json!({
                "PYBPOD_PROTOCOL": "_iblrig_tasks_ephysChoiceWorld6.4.0",
                "PROBE_DATA": {
                    "probe00": {"X": -2243.1, "Y": -2000.0, "Z": 0.0, "A": 45, "P": 15, "D": 4000, "T": 0}
                }
            })
            .to_string(),
        );
        let ctx = context(&root, "ProbeDescription", MappingSet::new());

        let produced = ProbeDescriptionTask::new(vec!["probe00".to_string()])
            .run(&ctx)
            .await
            .unwrap();

        assert_eq!(produced.len(), 2);
        assert!(produced[1].ends_with("alf/probes.trajectory.json"));
        let trajectories: Vec<ProbeTrajectory> = read_json(&produced[1]).unwrap();
        assert_eq!(trajectories, vec![ProbeTrajectory::new("probe00", &insertion(-2243.1))]);
    }
}
