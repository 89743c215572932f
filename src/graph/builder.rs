//! Task graph builder: session classification to task graph.
//!
//! Graphs are fixed per protocol family. The builder picks one extraction
//! variant per node and never branches on protocol strings inside a task.

use std::sync::Arc;

use crate::error::GraphError;
use crate::session::layout;
use crate::session::{ProtocolFamily, SessionClassification};
use crate::sync::SyncConfig;
use crate::tasks::ephys::{EphysSyncTask, ProbeDescriptionTask, SpikeSyncTask};
use crate::tasks::qc::{SyncQcTask, TrialsQcTask, DEFAULT_MIN_MATCH_RATIO};
use crate::tasks::raw::RawRegistrationTask;
use crate::tasks::trials::{PassiveTimesTask, TrialsTask};

use super::dag::TaskGraph;
use super::node::{Dependency, OutputSpec, ResourceClass, TaskNode};

pub const REGISTER_RAW: &str = "RegisterRaw";
pub const TRIALS: &str = "Trials";
pub const TRIALS_QC: &str = "TrialsQc";
pub const EPHYS_SYNC: &str = "EphysSync";
pub const SYNC_QC: &str = "SyncQc";
pub const PROBE_DESCRIPTION: &str = "ProbeDescription";
pub const PASSIVE_TIMES: &str = "PassiveTimes";

/// Node name of the spike synchronization task for a probe.
pub fn spike_sync_name(probe: &str) -> String {
    format!("SpikeSync_{}", probe)
}

/// Builds the fixed task graph for a classified session.
#[derive(Debug, Clone)]
pub struct TaskGraphBuilder {
    sync: SyncConfig,
    min_match_ratio: f64,
}

impl Default for TaskGraphBuilder {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl TaskGraphBuilder {
    pub fn new(sync: SyncConfig) -> Self {
        Self {
            sync,
            min_match_ratio: DEFAULT_MIN_MATCH_RATIO,
        }
    }

    /// Sets the pulse match ratio below which sync QC fails.
    pub fn with_min_match_ratio(mut self, ratio: f64) -> Self {
        self.min_match_ratio = ratio;
        self
    }

    /// Builds the graph for `classification`.
    ///
    /// Deterministic: the same classification always yields the same nodes
    /// and edges. Unknown protocols get the raw registration node only.
    pub fn build(&self, classification: &SessionClassification) -> Result<TaskGraph, GraphError> {
        let mut nodes = vec![self.register_raw(classification)?];

        match &classification.family {
            ProtocolFamily::Training => {
                nodes.push(trials_node(false, Dependency::complete(REGISTER_RAW))?);
                nodes.push(trials_qc_node()?);
            }
            ProtocolFamily::Habituation => {
                nodes.push(trials_node(false, Dependency::complete(REGISTER_RAW))?);
            }
            ProtocolFamily::Ephys => {
                nodes.extend(self.ephys_nodes(classification)?);
            }
            ProtocolFamily::Custom(_) => {}
        }

        TaskGraph::from_nodes(nodes)
    }

    fn register_raw(&self, classification: &SessionClassification) -> Result<TaskNode, GraphError> {
        let mut node = TaskNode::new(REGISTER_RAW, Arc::new(RawRegistrationTask::new()))
            .with_output(OutputSpec::untyped("raw_*_data/**", false)?);
        if classification.has_behavior {
            let settings = format!("{}/{}", layout::RAW_BEHAVIOR_DIR, layout::TASK_SETTINGS_FILE);
            node.outputs.insert(0, OutputSpec::untyped(&settings, true)?);
        }
        Ok(node)
    }

    fn ephys_nodes(&self, classification: &SessionClassification) -> Result<Vec<TaskNode>, GraphError> {
        let mut devices: Vec<String> = classification.probes.clone();
        if classification.has_behavior {
            devices.push(layout::BPOD_DEVICE.to_string());
        }
        devices.extend(classification.cameras.iter().map(|c| layout::camera_device(c)));

        let sync_task = EphysSyncTask::new(
            self.sync.clone(),
            classification.probes.clone(),
            classification.cameras.clone(),
            classification.has_behavior,
        );
        let mut sync = TaskNode::new(EPHYS_SYNC, Arc::new(sync_task))
            .with_dependency(Dependency::allow_partial(REGISTER_RAW));
        for device in &devices {
            sync = sync.with_output(OutputSpec::required(
                &format!("{}/{}/{}", layout::ALF_DIR, device, layout::SYNC_POINTS_FILE),
                "_neuropipe_sync.points",
            )?);
        }

        let mut nodes = vec![sync];

        nodes.push(
            TaskNode::new(PROBE_DESCRIPTION, Arc::new(ProbeDescriptionTask::new(classification.probes.clone())))
                .with_dependency(Dependency::allow_partial(REGISTER_RAW))
                .with_output(OutputSpec::required(
                    &format!("{}/{}", layout::ALF_DIR, layout::PROBE_DESCRIPTION_FILE),
                    "probes.description",
                )?)
                .with_output(OutputSpec::optional(
                    &format!("{}/{}", layout::ALF_DIR, layout::PROBE_TRAJECTORY_FILE),
                    "probes.trajectory",
                )?),
        );

        for probe in &classification.probes {
            let alf = format!("{}/{}", layout::ALF_DIR, probe);
            nodes.push(
                TaskNode::new(spike_sync_name(probe), Arc::new(SpikeSyncTask::new(probe.clone())))
                    .with_dependency(Dependency::allow_partial(EPHYS_SYNC))
                    .with_resource(ResourceClass::Heavy)
                    .with_output(OutputSpec::required(
                        &format!("{}/{}", alf, layout::SPIKE_TIMES_FILE),
                        "spikes.times",
                    )?)
                    .with_output(OutputSpec::required(
                        &format!("{}/{}", alf, layout::SPIKE_AMPS_FILE),
                        "spikes.amps",
                    )?),
            );
        }

        nodes.push(
            TaskNode::new(SYNC_QC, Arc::new(SyncQcTask::new(devices, self.min_match_ratio)))
                .with_dependency(Dependency::allow_partial(EPHYS_SYNC))
                .with_output(OutputSpec::required(
                    &format!("{}/{}", layout::ALF_DIR, layout::SYNC_QC_FILE),
                    "_neuropipe_qc.sync",
                )?),
        );

        if classification.has_behavior {
            nodes.push(trials_node(true, Dependency::allow_partial(EPHYS_SYNC))?);
            nodes.push(trials_qc_node()?);
        }

        if classification.has_passive && classification.has_behavior {
            nodes.push(
                TaskNode::new(PASSIVE_TIMES, Arc::new(PassiveTimesTask::new()))
                    .with_dependency(Dependency::allow_partial(EPHYS_SYNC))
                    .with_output(OutputSpec::required(
                        &format!("{}/{}", layout::ALF_DIR, layout::PASSIVE_TIMES_FILE),
                        "_ibl_passive.times",
                    )?),
            );
        }

        Ok(nodes)
    }
}

fn trials_node(synced: bool, dependency: Dependency) -> Result<TaskNode, GraphError> {
    let alf = |file: &str| format!("{}/{}", layout::ALF_DIR, file);
    Ok(TaskNode::new(TRIALS, Arc::new(TrialsTask::new(synced)))
        .with_dependency(dependency)
        .with_outputs([
            OutputSpec::required(&alf(layout::TRIALS_INTERVALS_FILE), "trials.intervals")?,
            OutputSpec::required(&alf(layout::TRIALS_STIM_ON_FILE), "trials.stimOn_times")?,
            OutputSpec::required(&alf(layout::TRIALS_FEEDBACK_FILE), "trials.feedbackType")?,
            OutputSpec::untyped(&alf("_ibl_wheel.*.json"), false)?,
        ]))
}

fn trials_qc_node() -> Result<TaskNode, GraphError> {
    Ok(TaskNode::new(TRIALS_QC, Arc::new(TrialsQcTask::new()))
        .with_dependency(Dependency::allow_partial(TRIALS))
        .with_output(OutputSpec::required(
            &format!("{}/{}", layout::ALF_DIR, layout::TRIALS_QC_FILE),
            "_neuropipe_qc.trials",
        )?))
}
