//! Raw session locator.
//!
//! Inspects a session root and a handful of marker files to identify the
//! recording and classify it. Classification failures are reported as
//! [`SessionError::UnrecognizedSession`] so batch runs can skip and continue.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SessionError;

use super::layout;
use super::spikeglx;
use super::types::{Procedure, ProtocolFamily, Session, SessionClassification};

/// Protocol name used when a session has probes but no behaviour settings.
pub const ACQUISITION_ONLY_PROTOCOL: &str = "ephys_acquisition_only";

/// Settings fields read from the rig task settings file.
#[derive(Debug, Default, Clone, PartialEq)]
struct RigSettings {
    protocol: Option<String>,
    subject: Option<String>,
    date: Option<NaiveDate>,
    number: Option<u32>,
    lab: Option<String>,
}

/// Planned insertion of one probe, as entered on the rig.
///
/// Coordinates are in micrometres relative to bregma, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeInsertion {
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
    /// Azimuth.
    #[serde(rename = "A")]
    pub phi: f64,
    /// Polar angle.
    #[serde(rename = "P")]
    pub theta: f64,
    #[serde(rename = "D")]
    pub depth: f64,
    /// Roll around the probe axis.
    #[serde(rename = "T")]
    pub beta: f64,
}

/// Reads the `PROBE_DATA` insertions of a session's task settings, keyed by
/// the label the rig used.
///
/// A session without settings, or settings without probe data, yields an
/// empty map.
pub fn read_probe_insertions(root: &Path) -> Result<BTreeMap<String, ProbeInsertion>, SessionError> {
    let path = root
        .join(layout::RAW_BEHAVIOR_DIR)
        .join(layout::TASK_SETTINGS_FILE);
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }

    let invalid = |reason: String| SessionError::InvalidSettings {
        path: path.clone(),
        reason,
    };
    let contents = fs::read_to_string(&path)?;
    let value: Value = serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))?;
    match value.get(layout::PROBE_DATA_KEY) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(data) => serde_json::from_value(data.clone())
            .map_err(|e| invalid(format!("{}: {}", layout::PROBE_DATA_KEY, e))),
    }
}

/// Identity parsed from a `<lab>/Subjects/<subject>/<date>/<number>` path.
#[derive(Debug, Clone, PartialEq)]
struct PathIdentity {
    subject: String,
    date: NaiveDate,
    number: u32,
    lab: Option<String>,
}

/// Locates and classifies raw sessions.
#[derive(Debug, Default, Clone)]
pub struct SessionLocator;

impl SessionLocator {
    pub fn new() -> Self {
        Self
    }

    /// Classifies the session rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedSession` when no known marker matches or the
    /// session identity cannot be derived, `InvalidSettings` when the rig
    /// settings file exists but cannot be parsed.
    pub fn classify(&self, root: &Path) -> Result<SessionClassification, SessionError> {
        if !root.is_dir() {
            return Err(SessionError::MissingRoot(root.to_path_buf()));
        }

        let settings_path = root
            .join(layout::RAW_BEHAVIOR_DIR)
            .join(layout::TASK_SETTINGS_FILE);
        let settings = if settings_path.is_file() {
            Some(read_settings(&settings_path)?)
        } else {
            None
        };

        let probes = find_probes(&root.join(layout::RAW_EPHYS_DIR));
        let cameras = find_cameras(&root.join(layout::RAW_VIDEO_DIR));
        let has_behavior = settings.is_some();

        if settings.is_none() && probes.is_empty() {
            return Err(SessionError::UnrecognizedSession {
                path: root.to_path_buf(),
                reason: format!(
                    "neither {}/{} nor probe metadata under {} found",
                    layout::RAW_BEHAVIOR_DIR,
                    layout::TASK_SETTINGS_FILE,
                    layout::RAW_EPHYS_DIR
                ),
            });
        }

        let settings = settings.unwrap_or_default();
        let protocol = match (&settings.protocol, has_behavior) {
            (Some(p), _) => p.clone(),
            (None, true) => {
                warn!(path = %settings_path.display(), "Task settings carry no protocol");
                String::from("unspecified")
            }
            (None, false) => ACQUISITION_ONLY_PROTOCOL.to_string(),
        };

        let family = if !probes.is_empty() {
            ProtocolFamily::Ephys
        } else {
            ProtocolFamily::from_protocol(&protocol)
        };
        let procedure = match family {
            ProtocolFamily::Ephys => Procedure::AcuteRecording,
            _ => Procedure::BehaviorTraining,
        };

        let session = build_session(root, &settings, protocol, procedure)?;

        let classification = SessionClassification {
            session,
            family,
            probes,
            cameras,
            has_behavior,
            has_passive: root.join(layout::RAW_PASSIVE_DIR).is_dir(),
            has_opto: root.join(layout::RAW_OPTO_DIR).is_dir(),
        };

        debug!(
            session = %classification.session,
            family = %classification.family,
            probes = classification.probes.len(),
            cameras = classification.cameras.len(),
            "Classified session"
        );

        Ok(classification)
    }
}

fn build_session(
    root: &Path,
    settings: &RigSettings,
    protocol: String,
    procedure: Procedure,
) -> Result<Session, SessionError> {
    let from_path = parse_path_identity(root);

    let (subject, date, number, lab) = match from_path {
        Some(id) => (id.subject, id.date, id.number, id.lab.or(settings.lab.clone())),
        None => match (&settings.subject, settings.date, settings.number) {
            (Some(subject), Some(date), Some(number)) => {
                (subject.clone(), date, number, settings.lab.clone())
            }
            _ => {
                return Err(SessionError::UnrecognizedSession {
                    path: root.to_path_buf(),
                    reason: "cannot derive subject/date/number from path or settings".to_string(),
                })
            }
        },
    };

    let mut session = Session::new(subject, date, number, root, protocol, procedure);
    session.lab = lab;
    Ok(session)
}

fn parse_path_identity(root: &Path) -> Option<PathIdentity> {
    let parts: Vec<String> = root
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str().map(str::to_string),
            _ => None,
        })
        .collect();

    let n = parts.len();
    if n < 3 {
        return None;
    }

    let number_part = &parts[n - 1];
    if number_part.is_empty() || !number_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let number: u32 = number_part.parse().ok()?;
    let date = NaiveDate::parse_from_str(&parts[n - 2], "%Y-%m-%d").ok()?;
    let subject = parts[n - 3].clone();

    let lab = if n >= 5 && parts[n - 4] == "Subjects" {
        Some(parts[n - 5].clone())
    } else {
        None
    };

    Some(PathIdentity {
        subject,
        date,
        number,
        lab,
    })
}

fn read_settings(path: &Path) -> Result<RigSettings, SessionError> {
    let contents = fs::read_to_string(path)?;
    let value: Value =
        serde_json::from_str(&contents).map_err(|e| SessionError::InvalidSettings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let obj = value.as_object().ok_or_else(|| SessionError::InvalidSettings {
        path: path.to_path_buf(),
        reason: "settings are not a JSON object".to_string(),
    })?;

    let string_field = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    // Rig versions disagree on whether the number is a string or an integer
    let number = match obj.get("SESSION_NUMBER") {
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        _ => None,
    };

    // Dates may carry a time part: keep the first 10 characters
    let date = string_field("SESSION_DATE").and_then(|s| {
        NaiveDate::parse_from_str(s.get(..10).unwrap_or(s.as_str()), "%Y-%m-%d").ok()
    });

    Ok(RigSettings {
        protocol: string_field("PYBPOD_PROTOCOL"),
        subject: string_field("SUBJECT_NAME"),
        date,
        number,
        lab: string_field("LAB"),
    })
}

fn sorted_dir_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(read) => read.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };
    entries.sort();
    entries
}

fn find_probes(ephys_dir: &Path) -> Vec<String> {
    sorted_dir_entries(ephys_dir)
        .into_iter()
        .filter(|path| path.is_dir() && spikeglx::find_ap_meta(path).is_some())
        .filter_map(|path| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect()
}

fn find_cameras(video_dir: &Path) -> Vec<String> {
    sorted_dir_entries(video_dir)
        .into_iter()
        .filter_map(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(layout::camera_label)
                .map(str::to_string)
        })
        .collect()
}
