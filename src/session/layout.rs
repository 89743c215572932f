//! Raw session directory layout.
//!
//! File and directory names the locator and the built-in tasks agree on.

/// Behaviour controller raw data directory.
pub const RAW_BEHAVIOR_DIR: &str = "raw_behavior_data";
/// Electrophysiology raw data directory (acquisition box + one subdirectory per probe).
pub const RAW_EPHYS_DIR: &str = "raw_ephys_data";
/// Camera raw data directory.
pub const RAW_VIDEO_DIR: &str = "raw_video_data";
/// Passive stimulus block marker directory.
pub const RAW_PASSIVE_DIR: &str = "raw_passive_data";
/// Optogenetics marker directory.
pub const RAW_OPTO_DIR: &str = "raw_opto_data";
/// Output collection for extracted datasets.
pub const ALF_DIR: &str = "alf";

/// Task settings written by the behaviour rig.
pub const TASK_SETTINGS_FILE: &str = "_iblrig_taskSettings.raw.json";
/// One JSON trial per line.
pub const TASK_DATA_FILE: &str = "_iblrig_taskData.raw.jsonable";
/// Behaviour controller fiducial pulses.
pub const BPOD_SYNC_FILE: &str = "_iblrig_bpod.sync.json";
/// Acquisition box or probe fiducial pulses.
pub const SPIKEGLX_SYNC_FILE: &str = "_spikeglx_sync.times.json";
/// Secondary hardware line used when the primary fiducials are unreliable.
pub const SPIKEGLX_SYNC_SECONDARY_FILE: &str = "_spikeglx_sync.times.secondary.json";
/// Raw spike sample indices written by the spike sorter.
pub const SPIKE_SAMPLES_FILE: &str = "spikes.samples.json";
/// Raw spike amplitudes written by the spike sorter.
pub const SPIKE_AMPLITUDES_RAW_FILE: &str = "spikes.amplitudes.json";
/// Sorted spike times on the reference clock.
pub const SPIKE_TIMES_FILE: &str = "spikes.times.json";
/// Spike amplitudes dataset.
pub const SPIKE_AMPS_FILE: &str = "spikes.amps.json";
/// Wheel encoder samples: `[[time, position], ...]` on the behaviour clock.
pub const ENCODER_POSITIONS_FILE: &str = "_iblrig_encoderPositions.raw.json";
/// Passive stimulus onsets on the behaviour clock.
pub const PASSIVE_RAW_FILE: &str = "_iblrig_passiveStims.raw.json";
/// Passive stimulus onsets on the reference clock.
pub const PASSIVE_TIMES_FILE: &str = "_ibl_passive.times.json";
/// Trial start and end times.
pub const TRIALS_INTERVALS_FILE: &str = "_ibl_trials.intervals.json";
/// Stimulus onset per trial, `null` when absent.
pub const TRIALS_STIM_ON_FILE: &str = "_ibl_trials.stimOn_times.json";
/// Feedback per trial: 1 correct, -1 error, 0 none.
pub const TRIALS_FEEDBACK_FILE: &str = "_ibl_trials.feedbackType.json";
/// Resampled wheel position.
pub const WHEEL_POSITION_FILE: &str = "_ibl_wheel.position.json";
/// Grid times of the resampled wheel position.
pub const WHEEL_TIMESTAMPS_FILE: &str = "_ibl_wheel.timestamps.json";
/// Trials QC report.
pub const TRIALS_QC_FILE: &str = "_neuropipe_qc.trials.json";
/// Sync QC report.
pub const SYNC_QC_FILE: &str = "_neuropipe_qc.sync.json";
/// Sync points written for every fitted mapping.
pub const SYNC_POINTS_FILE: &str = "_neuropipe_sync.points.json";
/// Probe description dataset.
pub const PROBE_DESCRIPTION_FILE: &str = "probes.description.json";
/// Planned insertion coordinates of every probe.
pub const PROBE_TRAJECTORY_FILE: &str = "probes.trajectory.json";
/// Task settings key holding per-probe insertion coordinates.
pub const PROBE_DATA_KEY: &str = "PROBE_DATA";

/// Device identifier of the acquisition box stream.
pub const ACQUISITION_DEVICE: &str = "nidq";
/// Device identifier of the behaviour controller stream.
pub const BPOD_DEVICE: &str = "bpod";

/// Suffix of camera sync files: `_iblrig_<label>Camera.sync.json`.
pub const CAMERA_SYNC_SUFFIX: &str = "Camera.sync.json";
/// Prefix of camera sync files.
pub const CAMERA_SYNC_PREFIX: &str = "_iblrig_";

/// Device identifier used for a camera label.
pub fn camera_device(label: &str) -> String {
    format!("{}Camera", label)
}

/// Camera sync file name for a camera label.
pub fn camera_sync_file(label: &str) -> String {
    format!("{}{}{}", CAMERA_SYNC_PREFIX, label, CAMERA_SYNC_SUFFIX)
}

/// Extracts the camera label from a camera sync file name.
pub fn camera_label(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(CAMERA_SYNC_PREFIX)?
        .strip_suffix(CAMERA_SYNC_SUFFIX)
        .filter(|label| !label.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_names_round_trip() {
        let file = camera_sync_file("left");
        assert_eq!(file, "_iblrig_leftCamera.sync.json");
        assert_eq!(camera_label(&file), Some("left"));
        assert_eq!(camera_device("left"), "leftCamera");
    }

    #[test]
    fn test_camera_label_rejects_other_files() {
        assert_eq!(camera_label("_iblrig_Camera.sync.json"), None);
        assert_eq!(camera_label("leftCamera.raw.mp4"), None);
    }
}
