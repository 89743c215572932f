//! Clock synchronizer: aligns secondary streams onto the reference clock.
//!
//! For every secondary stream the synchronizer
//! 1. splits the stream at recording breaks longer than `max_gap_s`,
//! 2. estimates the coarse offset of each segment and matches pulses,
//! 3. fits the device kind's model to each segment and checks the residual,
//! 4. retries with the fallback fiducial line when the primary fails.
//!
//! A failing secondary stream never fails the others; only an unusable
//! reference stream makes the whole call fail.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, SyncError};
use crate::metrics::MetricsCollector;

use super::mapping::{FitModel, MappingSegment, SegmentModel, SyncMapping, SyncQuality};
use super::matching::{estimate_offset, match_pulses, split_segments};
use super::stream::{ClockStream, DeviceKind, SyncSource};

/// Fit model and acceptance threshold for one kind of device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSyncPolicy {
    pub model: FitModel,
    /// Fits with a larger residual are rejected.
    pub max_residual_s: f64,
}

impl DeviceSyncPolicy {
    pub fn new(model: FitModel, max_residual_s: f64) -> Self {
        Self {
            model,
            max_residual_s,
        }
    }

    /// Default policy for a device kind.
    ///
    /// Probes run on their own sample clock and drift non-linearly over long
    /// recordings, so they get a piecewise fit with a tight threshold.
    pub fn default_for(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Probe => Self::new(FitModel::PiecewiseLinear, 2.5e-4),
            DeviceKind::BehaviorController => Self::new(FitModel::Linear, 1e-3),
            DeviceKind::Camera => Self::new(FitModel::Linear, 5e-3),
            DeviceKind::AcquisitionBox => Self::new(FitModel::Linear, 1e-3),
        }
    }
}

/// Synchronization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum distance between a predicted and a matched pulse.
    pub tolerance_s: f64,
    /// Pulse gaps longer than this split a stream into independent segments.
    pub max_gap_s: f64,
    /// Matched pairs required across all segments of a stream.
    pub min_matched_pulses: usize,
    /// Local pulses used to estimate each segment's coarse offset.
    pub offset_probe_pulses: usize,
    /// Per-kind overrides of [`DeviceSyncPolicy::default_for`].
    pub policies: BTreeMap<DeviceKind, DeviceSyncPolicy>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tolerance_s: 0.005,
            max_gap_s: 60.0,
            min_matched_pulses: 10,
            offset_probe_pulses: 50,
            policies: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tolerance(mut self, tolerance_s: f64) -> Self {
        self.tolerance_s = tolerance_s;
        self
    }

    pub fn with_max_gap(mut self, max_gap_s: f64) -> Self {
        self.max_gap_s = max_gap_s;
        self
    }

    pub fn with_min_matched_pulses(mut self, min: usize) -> Self {
        self.min_matched_pulses = min;
        self
    }

    /// Overrides the policy for one device kind.
    pub fn with_policy(mut self, kind: DeviceKind, policy: DeviceSyncPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    /// Effective policy for a device kind.
    pub fn policy(&self, kind: DeviceKind) -> DeviceSyncPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| DeviceSyncPolicy::default_for(kind))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance_s > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "sync tolerance must be positive".to_string(),
            ));
        }
        if !(self.max_gap_s > self.tolerance_s) {
            return Err(ConfigError::ValidationFailed(
                "sync max_gap_s must exceed the tolerance".to_string(),
            ));
        }
        if self.min_matched_pulses < 2 {
            return Err(ConfigError::ValidationFailed(
                "sync min_matched_pulses must be at least 2".to_string(),
            ));
        }
        if self.offset_probe_pulses == 0 {
            return Err(ConfigError::ValidationFailed(
                "sync offset_probe_pulses must be at least 1".to_string(),
            ));
        }
        for (kind, policy) in &self.policies {
            if !(policy.max_residual_s > 0.0) {
                return Err(ConfigError::ValidationFailed(format!(
                    "max_residual_s for {} must be positive",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Result of synchronizing a set of streams against one reference.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub reference: String,
    pub mappings: BTreeMap<String, Arc<SyncMapping>>,
    pub failures: BTreeMap<String, SyncError>,
}

impl SyncOutcome {
    /// Mapping for a device, or the error that prevented computing it.
    pub fn mapping(&self, device: &str) -> Result<Arc<SyncMapping>, SyncError> {
        if let Some(mapping) = self.mappings.get(device) {
            return Ok(Arc::clone(mapping));
        }
        Err(self
            .failures
            .get(device)
            .cloned()
            .unwrap_or_else(|| SyncError::MissingMapping(device.to_string())))
    }

    /// True when every secondary stream produced a mapping.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Fits sync mappings from fiducial pulses.
#[derive(Debug, Clone, Default)]
pub struct ClockSynchronizer {
    config: SyncConfig,
    metrics: MetricsCollector,
}

impl ClockSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Computes a mapping for every source against `reference`.
    ///
    /// # Errors
    ///
    /// Returns `ReferenceUnusable` when the reference stream is empty or not
    /// strictly increasing. Per-source failures are collected in
    /// [`SyncOutcome::failures`] instead.
    pub fn synchronize(
        &self,
        reference: &ClockStream,
        sources: &[SyncSource],
    ) -> Result<SyncOutcome, SyncError> {
        if let Err(e) = reference.validate() {
            warn!(device = %reference.device(), error = %e, "Reference stream unusable");
            return Err(SyncError::ReferenceUnusable(reference.device().to_string()));
        }
        if reference.len() < 2 {
            return Err(SyncError::ReferenceUnusable(reference.device().to_string()));
        }

        let mut outcome = SyncOutcome {
            reference: reference.device().to_string(),
            ..Default::default()
        };

        for source in sources {
            match self.align_source(reference, source) {
                Ok(mapping) => {
                    self.metrics
                        .record_sync_residual(&mapping.device, mapping.quality.residual_s);
                    info!(
                        device = %mapping.device,
                        matched = mapping.quality.matched,
                        residual_s = mapping.quality.residual_s,
                        segments = mapping.quality.segments,
                        fallback = mapping.quality.used_fallback,
                        "Stream synchronized"
                    );
                    outcome
                        .mappings
                        .insert(source.device().to_string(), Arc::new(mapping));
                }
                Err(e) => {
                    warn!(device = %source.device(), error = %e, "Stream synchronization failed");
                    outcome.failures.insert(source.device().to_string(), e);
                }
            }
        }

        Ok(outcome)
    }

    /// Aligns one source, retrying with its fallback line when the primary fails.
    pub fn align_source(
        &self,
        reference: &ClockStream,
        source: &SyncSource,
    ) -> Result<SyncMapping, SyncError> {
        let primary_err = match self.align(reference, &source.primary) {
            Ok(mapping) => return Ok(mapping),
            Err(e) => e,
        };
        let Some(fallback) = &source.fallback else {
            return Err(primary_err);
        };

        warn!(
            device = %source.device(),
            error = %primary_err,
            "Primary fiducials rejected, trying fallback line"
        );
        match self.align(reference, fallback) {
            Ok(mut mapping) => {
                mapping.device = source.device().to_string();
                mapping.quality.used_fallback = true;
                Ok(mapping)
            }
            Err(fallback_err) => Err(SyncError::FallbackFailed {
                primary: primary_err.to_string(),
                fallback: fallback_err.to_string(),
            }),
        }
    }

    /// Fits a mapping for one stream.
    ///
    /// Exact pulse count equality is not required: segments are fit on the
    /// matched subset and a count mismatch is only logged.
    pub fn align(&self, reference: &ClockStream, stream: &ClockStream) -> Result<SyncMapping, SyncError> {
        stream.validate()?;
        let device = stream.device();
        let policy = self.config.policy(stream.kind());
        let times = stream.times();
        let ref_times = reference.times();

        let ranges = split_segments(times, self.config.max_gap_s);
        if ranges.len() > 1 {
            info!(device, segments = ranges.len(), "Recording breaks detected");
        }

        let mut segments = Vec::new();
        let mut matched = 0usize;
        let mut sq_sum = 0.0;
        let mut max_error = 0.0f64;

        for range in ranges {
            let local = &times[range.clone()];
            if local.len() < 2 {
                debug!(device, start = range.start, "Skipping single-pulse segment");
                continue;
            }
            let Some(offset) = estimate_offset(
                local,
                ref_times,
                self.config.tolerance_s,
                self.config.offset_probe_pulses,
            ) else {
                debug!(device, start = range.start, "No offset agreement for segment");
                continue;
            };
            let pairs = match_pulses(local, ref_times, offset, self.config.tolerance_s);
            if pairs.len() < 2 {
                continue;
            }

            let model = SegmentModel::fit(policy.model, &pairs, device)?;
            let (rms, max) = model.residuals(&pairs);
            sq_sum += rms * rms * pairs.len() as f64;
            max_error = max_error.max(max);
            matched += pairs.len();

            segments.push(MappingSegment {
                local_start: local[0],
                local_end: local[local.len() - 1],
                model,
                matched: pairs.len(),
            });
        }

        if matched < self.config.min_matched_pulses {
            return Err(SyncError::TooFewMatches {
                device: device.to_string(),
                matched,
                required: self.config.min_matched_pulses,
            });
        }

        if matched != times.len() || matched != ref_times.len() {
            warn!(
                device,
                local_pulses = times.len(),
                reference_pulses = ref_times.len(),
                matched,
                "Pulse count mismatch, fitting matched subset"
            );
        }

        let residual = (sq_sum / matched as f64).sqrt();
        if residual > policy.max_residual_s {
            return Err(SyncError::ResidualTooHigh {
                device: device.to_string(),
                residual,
                threshold: policy.max_residual_s,
            });
        }

        let quality = SyncQuality {
            matched,
            local_pulses: times.len(),
            reference_pulses: ref_times.len(),
            residual_s: residual,
            max_error_s: max_error,
            segments: segments.len(),
            used_fallback: false,
        };

        SyncMapping::from_segments(device, reference.device(), segments, quality)
    }
}
