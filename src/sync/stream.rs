//! Clock streams: fiducial pulse times recorded by one acquisition device.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExtractionError, SyncError};

/// Kind of acquisition device, used to pick a fit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AcquisitionBox,
    BehaviorController,
    Camera,
    Probe,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::AcquisitionBox => write!(f, "acquisition_box"),
            DeviceKind::BehaviorController => write!(f, "behavior_controller"),
            DeviceKind::Camera => write!(f, "camera"),
            DeviceKind::Probe => write!(f, "probe"),
        }
    }
}

/// Ordered pulse timestamps in one device's local clock (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockStream {
    device: String,
    kind: DeviceKind,
    times: Vec<f64>,
}

impl ClockStream {
    pub fn new(device: impl Into<String>, kind: DeviceKind, times: Vec<f64>) -> Self {
        Self {
            device: device.into(),
            kind,
            times,
        }
    }

    /// Loads a stream stored as a JSON array of seconds.
    pub fn load_json(
        path: &Path,
        device: impl Into<String>,
        kind: DeviceKind,
    ) -> Result<Self, ExtractionError> {
        if !path.is_file() {
            return Err(ExtractionError::MissingInput(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        let times: Vec<f64> =
            serde_json::from_str(&contents).map_err(|e| ExtractionError::InvalidInput {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(device, kind, times))
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Checks the stream is non-empty, finite and strictly increasing.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.times.is_empty() {
            return Err(SyncError::NoPulses(self.device.clone()));
        }
        if let Some(index) = self.times.iter().position(|t| !t.is_finite()) {
            return Err(SyncError::NonMonotonic {
                device: self.device.clone(),
                index,
            });
        }
        if let Some(index) = self.times.windows(2).position(|w| w[1] <= w[0]) {
            return Err(SyncError::NonMonotonic {
                device: self.device.clone(),
                index: index + 1,
            });
        }
        Ok(())
    }
}

/// Fiducials for one device: a primary line and an optional fallback line.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSource {
    pub primary: ClockStream,
    pub fallback: Option<ClockStream>,
}

impl SyncSource {
    pub fn new(primary: ClockStream) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    /// Sets the fallback fiducial line.
    pub fn with_fallback(mut self, fallback: ClockStream) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn device(&self) -> &str {
        self.primary.device()
    }
}
