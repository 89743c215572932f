//! Resampling of synchronized time series onto a common regular grid.
//!
//! Several series (each already on the reference clock, optionally shifted
//! by an offset) are interpolated onto one grid of step `dt` spanning all of
//! them, producing one column per series.

use thiserror::Error;

/// Resampling input errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResampleError {
    #[error("No time series to resample")]
    Empty,

    #[error("Series '{name}' has {times} time stamps but {values} values")]
    LengthMismatch {
        name: String,
        times: usize,
        values: usize,
    },

    #[error("Series '{0}' contains NaN or infinite time stamps")]
    NonFinite(String),

    #[error("Series '{0}' time stamps are not sorted")]
    NotSorted(String),

    #[error("Invalid step {0}: must be positive and finite")]
    InvalidStep(f64),

    #[error("{offsets} offsets given for {series} series")]
    OffsetCount { offsets: usize, series: usize },
}

/// One sampled signal.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub name: String,
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(name: impl Into<String>, times: Vec<f64>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            times,
            values,
        }
    }

    fn check(&self) -> Result<(), ResampleError> {
        if self.times.len() != self.values.len() {
            return Err(ResampleError::LengthMismatch {
                name: self.name.clone(),
                times: self.times.len(),
                values: self.values.len(),
            });
        }
        if self.times.is_empty() {
            return Err(ResampleError::Empty);
        }
        if self.times.iter().any(|t| !t.is_finite()) {
            return Err(ResampleError::NonFinite(self.name.clone()));
        }
        if self.times.windows(2).any(|w| w[1] < w[0]) {
            return Err(ResampleError::NotSorted(self.name.clone()));
        }
        Ok(())
    }

    /// Value at grid time `t`; NaN outside the shifted span unless extrapolating.
    fn sample(&self, t: f64, offset: f64, interpolation: Interpolation, fill: Fill) -> f64 {
        let times = &self.times;
        let values = &self.values;
        let n = times.len();
        let first = times[0] + offset;
        let last = times[n - 1] + offset;

        if (t < first || t > last) && fill == Fill::Nan {
            return f64::NAN;
        }
        if n == 1 {
            return values[0];
        }

        // index of the last sample at or before t
        let i = times.partition_point(|&x| x + offset <= t);
        match interpolation {
            Interpolation::Previous => {
                if i == 0 {
                    values[0]
                } else {
                    values[i - 1]
                }
            }
            Interpolation::Linear => {
                let (a, b) = if i == 0 {
                    (0, 1)
                } else if i >= n {
                    (n - 2, n - 1)
                } else {
                    (i - 1, i)
                };
                let span = times[b] - times[a];
                if span == 0.0 {
                    return values[b];
                }
                let frac = (t - (times[a] + offset)) / span;
                values[a] + frac * (values[b] - values[a])
            }
        }
    }
}

/// How values between samples are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Zero-order hold: the most recent sample at or before the grid point.
    #[default]
    Previous,
    Linear,
}

/// What to emit for grid points outside a series' time span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fill {
    #[default]
    Nan,
    /// Hold (previous) or extend linearly (linear), and grow the grid to
    /// cover the last time stamp.
    Extrapolate,
}

/// Series resampled onto one grid, one column per input series.
#[derive(Debug, Clone, PartialEq)]
pub struct Resampled {
    pub times: Vec<f64>,
    pub names: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl Resampled {
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.columns[i].as_slice())
    }
}

/// Resamples `series` onto a grid of step `dt` starting at the earliest
/// (offset) time stamp.
///
/// The grid is closed at the end, unlike a half-open range:
/// - with [`Fill::Nan`] it stops at the latest stamp and includes it when the
///   span is a whole number of steps, so each series' last sample is kept;
/// - with [`Fill::Extrapolate`] it stops at the first grid point at or past the
///   latest stamp, with no extra step when the span is a whole number of steps.
///
/// `offsets`, when given, holds one shift per series added to its time
/// stamps before resampling.
pub fn resample(
    dt: f64,
    series: &[TimeSeries],
    offsets: Option<&[f64]>,
    interpolation: Interpolation,
    fill: Fill,
) -> Result<Resampled, ResampleError> {
    if !(dt.is_finite() && dt > 0.0) {
        return Err(ResampleError::InvalidStep(dt));
    }
    if series.is_empty() {
        return Err(ResampleError::Empty);
    }
    for s in series {
        s.check()?;
    }
    let offsets: Vec<f64> = match offsets {
        Some(o) if o.len() != series.len() => {
            return Err(ResampleError::OffsetCount {
                offsets: o.len(),
                series: series.len(),
            })
        }
        Some(o) => o.to_vec(),
        None => vec![0.0; series.len()],
    };
    if let Some(i) = offsets.iter().position(|o| !o.is_finite()) {
        return Err(ResampleError::NonFinite(series[i].name.clone()));
    }

    let (tmin, tmax) = series.iter().zip(&offsets).fold(
        (f64::INFINITY, f64::NEG_INFINITY),
        |(lo, hi), (s, o)| (lo.min(s.times[0] + o), hi.max(s.times[s.times.len() - 1] + o)),
    );

    let span = (tmax - tmin) / dt;
    let steps = match fill {
        // relative slack absorbs floating point error on exact multiples
        Fill::Nan => (span * (1.0 + 1e-12)).floor() as usize + 1,
        Fill::Extrapolate => (span * (1.0 - 1e-12)).ceil() as usize + 1,
    };
    let times: Vec<f64> = (0..steps)
        .map(|k| {
            let t = tmin + k as f64 * dt;
            // keep the last point inside the span when only rounding pushed it out
            if fill == Fill::Nan {
                t.min(tmax)
            } else {
                t
            }
        })
        .collect();

    let columns = series
        .iter()
        .zip(&offsets)
        .map(|(s, &o)| times.iter().map(|&t| s.sample(t, o, interpolation, fill)).collect())
        .collect();

    Ok(Resampled {
        times,
        names: series.iter().map(|s| s.name.clone()).collect(),
        columns,
    })
}
