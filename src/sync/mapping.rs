//! Sync mappings: monotonic functions from a device's local clock to the
//! reference clock.
//!
//! A mapping is a list of segments fit independently (one per uninterrupted
//! stretch of recording). Every segment model is strictly increasing, and
//! consecutive segments are checked not to fold back, so the mapping as a
//! whole is strictly increasing.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

use super::matching::MatchedPairs;

/// Drift-correction model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitModel {
    /// Least-squares line through the matched pairs.
    Linear,
    /// Interpolation through every matched pair, linear extrapolation at the ends.
    PiecewiseLinear,
}

/// Segment model evaluated on local time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SegmentModel {
    Linear { slope: f64, intercept: f64 },
    PiecewiseLinear { local: Vec<f64>, reference: Vec<f64> },
}

impl SegmentModel {
    /// Fits a model to matched pairs.
    ///
    /// Requires at least two pairs; a fit that would not be strictly
    /// increasing is rejected.
    pub fn fit(model: FitModel, pairs: &MatchedPairs, device: &str) -> Result<Self, SyncError> {
        if pairs.len() < 2 {
            return Err(SyncError::TooFewMatches {
                device: device.to_string(),
                matched: pairs.len(),
                required: 2,
            });
        }
        match model {
            FitModel::Linear => {
                let (slope, intercept) = least_squares(&pairs.local, &pairs.reference);
                if !(slope.is_finite() && slope > 0.0) {
                    return Err(SyncError::FoldBack {
                        device: device.to_string(),
                        reason: format!("linear fit slope {}", slope),
                    });
                }
                Ok(SegmentModel::Linear { slope, intercept })
            }
            FitModel::PiecewiseLinear => {
                let increasing = |v: &[f64]| v.windows(2).all(|w| w[1] > w[0]);
                if !increasing(&pairs.local) || !increasing(&pairs.reference) {
                    return Err(SyncError::FoldBack {
                        device: device.to_string(),
                        reason: "matched pairs are not strictly increasing".to_string(),
                    });
                }
                Ok(SegmentModel::PiecewiseLinear {
                    local: pairs.local.clone(),
                    reference: pairs.reference.clone(),
                })
            }
        }
    }

    pub fn eval(&self, t: f64) -> f64 {
        match self {
            SegmentModel::Linear { slope, intercept } => slope * t + intercept,
            SegmentModel::PiecewiseLinear { local, reference } => {
                let n = local.len();
                let i = local.partition_point(|&x| x < t);
                let (a, b) = if i == 0 {
                    (0, 1)
                } else if i >= n {
                    (n - 2, n - 1)
                } else {
                    (i - 1, i)
                };
                let slope = (reference[b] - reference[a]) / (local[b] - local[a]);
                reference[a] + slope * (t - local[a])
            }
        }
    }

    /// Root mean square and maximum absolute residual over the matched pairs.
    ///
    /// For piecewise models, which pass through every pair, each interior
    /// pair is predicted from its two neighbours instead.
    pub fn residuals(&self, pairs: &MatchedPairs) -> (f64, f64) {
        let errors: Vec<f64> = match self {
            SegmentModel::Linear { .. } => pairs
                .local
                .iter()
                .zip(&pairs.reference)
                .map(|(&l, &r)| self.eval(l) - r)
                .collect(),
            SegmentModel::PiecewiseLinear { local, reference } => (1..local.len().saturating_sub(1))
                .map(|i| {
                    let slope = (reference[i + 1] - reference[i - 1]) / (local[i + 1] - local[i - 1]);
                    reference[i - 1] + slope * (local[i] - local[i - 1]) - reference[i]
                })
                .collect(),
        };
        if errors.is_empty() {
            return (0.0, 0.0);
        }
        let rms = (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt();
        let max = errors.iter().fold(0.0f64, |m, e| m.max(e.abs()));
        (rms, max)
    }
}

fn least_squares(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        sxx += (xi - mean_x) * (xi - mean_x);
        sxy += (xi - mean_x) * (yi - mean_y);
    }
    let slope = sxy / sxx;
    (slope, mean_y - slope * mean_x)
}

/// One independently fit stretch of the local clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSegment {
    pub local_start: f64,
    pub local_end: f64,
    pub model: SegmentModel,
    pub matched: usize,
}

/// Quality indicators consumed by downstream QC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQuality {
    pub matched: usize,
    pub local_pulses: usize,
    pub reference_pulses: usize,
    pub residual_s: f64,
    pub max_error_s: f64,
    pub segments: usize,
    pub used_fallback: bool,
}

impl SyncQuality {
    /// Fraction of local pulses that found a reference partner.
    pub fn match_ratio(&self) -> f64 {
        if self.local_pulses == 0 {
            return 0.0;
        }
        self.matched as f64 / self.local_pulses as f64
    }
}

/// Mapping from one device's local clock onto the reference clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMapping {
    pub device: String,
    pub reference: String,
    pub segments: Vec<MappingSegment>,
    pub quality: SyncQuality,
}

impl SyncMapping {
    /// Builds a mapping from fitted segments, ordered by local time.
    ///
    /// Fails when the segments would fold back across a break.
    pub fn from_segments(
        device: impl Into<String>,
        reference: impl Into<String>,
        mut segments: Vec<MappingSegment>,
        quality: SyncQuality,
    ) -> Result<Self, SyncError> {
        let device = device.into();
        if segments.is_empty() {
            return Err(SyncError::TooFewMatches {
                device,
                matched: 0,
                required: 2,
            });
        }
        segments.sort_by(|a, b| a.local_start.total_cmp(&b.local_start));
        for pair in segments.windows(2) {
            let end = pair[0].model.eval(pair[0].local_end);
            let start = pair[1].model.eval(pair[1].local_start);
            if pair[1].local_start <= pair[0].local_end || start <= end {
                return Err(SyncError::FoldBack {
                    device,
                    reason: format!(
                        "segment starting at local {:.6}s maps to {:.6}s, before previous end {:.6}s",
                        pair[1].local_start, start, end
                    ),
                });
            }
        }
        Ok(Self {
            device,
            reference: reference.into(),
            segments,
            quality,
        })
    }

    /// Mapping of the reference stream onto itself.
    pub fn identity(device: impl Into<String>, pulses: usize) -> Self {
        let device = device.into();
        Self {
            reference: device.clone(),
            device,
            segments: vec![MappingSegment {
                local_start: 0.0,
                local_end: 0.0,
                model: SegmentModel::Linear {
                    slope: 1.0,
                    intercept: 0.0,
                },
                matched: pulses,
            }],
            quality: SyncQuality {
                matched: pulses,
                local_pulses: pulses,
                reference_pulses: pulses,
                residual_s: 0.0,
                max_error_s: 0.0,
                segments: 1,
                used_fallback: false,
            },
        }
    }

    /// Converts one local time to reference time.
    pub fn map(&self, t: f64) -> f64 {
        let segments = &self.segments;
        let first = &segments[0];
        if t <= first.local_end || segments.len() == 1 {
            return first.model.eval(t);
        }
        for pair in segments.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if t <= prev.local_end {
                return prev.model.eval(t);
            }
            if t < next.local_start {
                // inside a recording break: bridge the two segment ends
                let y0 = prev.model.eval(prev.local_end);
                let y1 = next.model.eval(next.local_start);
                let frac = (t - prev.local_end) / (next.local_start - prev.local_end);
                return y0 + frac * (y1 - y0);
            }
        }
        segments[segments.len() - 1].model.eval(t)
    }

    /// Converts a slice of local times.
    pub fn map_all(&self, times: &[f64]) -> Vec<f64> {
        times.iter().map(|&t| self.map(t)).collect()
    }

    /// `[local, reference]` pairs describing the mapping, one per segment
    /// boundary or interpolation knot.
    pub fn sync_points(&self) -> Vec<[f64; 2]> {
        let mut points = Vec::new();
        for segment in &self.segments {
            match &segment.model {
                SegmentModel::PiecewiseLinear { local, reference } => {
                    points.extend(local.iter().zip(reference).map(|(&l, &r)| [l, r]));
                }
                model @ SegmentModel::Linear { .. } => {
                    points.push([segment.local_start, model.eval(segment.local_start)]);
                    if segment.local_end > segment.local_start {
                        points.push([segment.local_end, model.eval(segment.local_end)]);
                    }
                }
            }
        }
        points
    }
}
