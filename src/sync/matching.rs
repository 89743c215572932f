//! Pulse correspondence between a local stream and the reference stream.
//!
//! Matching runs in two steps:
//! 1. A coarse offset is found from a histogram of `reference - local`
//!    differences over a window of the segment's pulses, slid forward until
//!    most of the window agrees.
//! 2. Pulses are walked in order, each one paired with the nearest unused
//!    reference pulse within tolerance. The offset follows the last match so
//!    slow clock drift is tracked.
//!
//! Unpaired pulses on either side are dropped: exact count equality is not
//! required.

use std::collections::HashMap;
use std::ops::Range;

/// Matched `(local, reference)` pulse pairs, both strictly increasing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedPairs {
    pub local: Vec<f64>,
    pub reference: Vec<f64>,
}

impl MatchedPairs {
    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    fn push(&mut self, local: f64, reference: f64) {
        self.local.push(local);
        self.reference.push(reference);
    }
}

/// Splits a stream into segments wherever consecutive pulses are further
/// apart than `max_gap` seconds.
pub fn split_segments(times: &[f64], max_gap: f64) -> Vec<Range<usize>> {
    if times.is_empty() {
        return Vec::new();
    }
    let mut segments = Vec::new();
    let mut start = 0;
    for i in 1..times.len() {
        if times[i] - times[i - 1] > max_gap {
            segments.push(start..i);
            start = i;
        }
    }
    segments.push(start..times.len());
    segments
}

/// Estimates the `reference - local` offset of a segment.
///
/// Windows of `probe_pulses` local pulses are tried from the start of the
/// segment, each half a window after the previous one. The first window
/// whose histogram peak collects votes from at least half of its pulses
/// wins, so leading pulses with no reference partner (a device started
/// before the reference) are stepped over. When no window reaches that
/// quorum the strongest peak seen is used.
///
/// Returns `None` when fewer than two differences agree.
pub fn estimate_offset(
    local: &[f64],
    reference: &[f64],
    tolerance: f64,
    probe_pulses: usize,
) -> Option<f64> {
    if local.is_empty() || reference.is_empty() || tolerance <= 0.0 {
        return None;
    }

    let window = probe_pulses.max(1);
    let step = window.div_ceil(2);
    let mut best: Option<OffsetPeak> = None;
    let mut start = 0;
    loop {
        let end = (start + window).min(local.len());
        let pulses = &local[start..end];
        if let Some(peak) = histogram_peak(pulses, reference, tolerance) {
            if peak.votes >= pulses.len().div_ceil(2).max(2) {
                return Some(peak.offset);
            }
            if best.map_or(true, |b| peak.votes > b.votes) {
                best = Some(peak);
            }
        }
        if end == local.len() {
            break;
        }
        start += step;
    }

    best.filter(|peak| peak.votes >= 2).map(|peak| peak.offset)
}

#[derive(Debug, Clone, Copy)]
struct OffsetPeak {
    offset: f64,
    votes: usize,
}

/// Bins the differences between `local` and every reference pulse at
/// `tolerance` width. The densest three-bin window wins and its median
/// difference is the offset. Ties go to the smallest absolute offset, which
/// resolves the aliasing of periodic pulse trains in favour of clocks started
/// close together.
fn histogram_peak(local: &[f64], reference: &[f64], tolerance: f64) -> Option<OffsetPeak> {
    let mut bins: HashMap<i64, Vec<f64>> = HashMap::new();
    for &t in local {
        for &r in reference {
            let diff = r - t;
            let key = (diff / tolerance).floor() as i64;
            bins.entry(key).or_default().push(diff);
        }
    }

    let count = |k: i64| bins.get(&k).map(Vec::len).unwrap_or(0);
    let mut best: Option<(usize, usize, i64)> = None;
    for &key in bins.keys() {
        let window = count(key - 1) + count(key) + count(key + 1);
        let center = count(key);
        let better = match best {
            None => true,
            Some((bw, bc, bk)) => {
                window > bw
                    || (window == bw && center > bc)
                    || (window == bw && center == bc && key.abs() < bk.abs())
                    || (window == bw && center == bc && key.abs() == bk.abs() && key < bk)
            }
        };
        if better {
            best = Some((window, center, key));
        }
    }

    let (votes, _, key) = best?;
    let mut diffs: Vec<f64> = (key - 1..=key + 1)
        .filter_map(|k| bins.get(&k))
        .flatten()
        .copied()
        .collect();
    diffs.sort_by(f64::total_cmp);
    Some(OffsetPeak {
        offset: diffs[diffs.len() / 2],
        votes,
    })
}

/// Pairs local pulses with reference pulses in order.
///
/// Each local pulse is predicted on the reference clock with the running
/// offset and paired with the nearest reference pulse after the previous
/// match, provided it lies within `tolerance`.
pub fn match_pulses(
    local: &[f64],
    reference: &[f64],
    initial_offset: f64,
    tolerance: f64,
) -> MatchedPairs {
    let mut pairs = MatchedPairs::default();
    let mut offset = initial_offset;
    let mut next_free = 0usize;

    for &t in local {
        if next_free >= reference.len() {
            break;
        }
        let predicted = t + offset;
        let candidates = &reference[next_free..];
        let idx = candidates.partition_point(|&r| r < predicted);

        let mut nearest: Option<usize> = None;
        for j in [idx.checked_sub(1), Some(idx)].into_iter().flatten() {
            if j >= candidates.len() {
                continue;
            }
            let better = match nearest {
                None => true,
                Some(n) => (candidates[j] - predicted).abs() < (candidates[n] - predicted).abs(),
            };
            if better {
                nearest = Some(j);
            }
        }

        if let Some(j) = nearest {
            let r = candidates[j];
            if (r - predicted).abs() <= tolerance {
                pairs.push(t, r);
                offset = r - t;
                next_free += j + 1;
            }
        }
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn irregular_pulses(n: usize) -> Vec<f64> {
        let mut t = 0.0;
        (0..n)
            .map(|i| {
                t += 0.5 + ((i * 37) % 11) as f64 * 0.1;
                t
            })
            .collect()
    }

    /// Aperiodic pulse train, so no shifted copy of it lines up with itself.
    fn random_pulses(n: usize, seed: u64) -> Vec<f64> {
        let mut state = seed;
        let mut t = 0.0;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                t += 0.3 + (state >> 11) as f64 / (1u64 << 53) as f64;
                t
            })
            .collect()
    }

    #[test]
    fn test_split_segments() {
        let times = vec![0.0, 1.0, 2.0, 50.0, 51.0, 200.0];
        let segs = split_segments(&times, 10.0);
        assert_eq!(segs, vec![0..3, 3..5, 5..6]);
        assert!(split_segments(&[], 10.0).is_empty());
        assert_eq!(split_segments(&times, 1000.0), vec![0..6]);
    }

    #[test]
    fn test_estimate_offset() {
        let reference = irregular_pulses(60);
        let local: Vec<f64> = reference.iter().map(|r| r - 12.345).collect();
        let offset = estimate_offset(&local, &reference, 0.01, 50).unwrap();
        assert!((offset - 12.345).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_offset_skips_leading_unmatched_pulses() {
        // controller starts a minute before the reference box
        let mut local: Vec<f64> = (0..70).map(|i| i as f64 * 0.85).collect();
        let reference: Vec<f64> = random_pulses(300, 11).iter().map(|t| t + 100.0).collect();
        local.extend(reference.iter().map(|r| r + 2.0));

        let offset = estimate_offset(&local, &reference, 0.005, 50).unwrap();
        assert!((offset + 2.0).abs() < 1e-9);

        let pairs = match_pulses(&local, &reference, offset, 0.005);
        assert_eq!(pairs.len(), 300);
        assert_eq!(pairs.local[0], reference[0] + 2.0);
    }

    #[test]
    fn test_estimate_offset_needs_agreement() {
        assert!(estimate_offset(&[1.0], &[5.0], 0.01, 50).is_none());
        assert!(estimate_offset(&[], &[5.0], 0.01, 50).is_none());
    }

    #[test]
    fn test_match_pulses_skips_missing_and_spurious() {
        let reference = irregular_pulses(40);
        let mut local: Vec<f64> = reference
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 10 && *i != 20)
            .map(|(_, r)| r + 3.0)
            .collect();
        // spurious pulse between two real ones
        local.push((reference[5] + reference[6]) / 2.0 + 3.0);
        local.sort_by(f64::total_cmp);

        let pairs = match_pulses(&local, &reference, -3.0, 0.005);
        assert_eq!(pairs.len(), 38);
        assert!(pairs.reference.windows(2).all(|w| w[1] > w[0]));
        for (l, r) in pairs.local.iter().zip(&pairs.reference) {
            assert!((l - 3.0 - r).abs() < 1e-9);
        }
    }

    #[test]
    fn test_match_pulses_tracks_drift() {
        let reference = irregular_pulses(2000);
        // 50 ppm drift accumulates far beyond the tolerance by the end
        let local: Vec<f64> = reference.iter().map(|r| r * (1.0 + 50e-6) + 1.0).collect();
        let pairs = match_pulses(&local, &reference, -1.0, 0.002);
        assert_eq!(pairs.len(), reference.len());
    }
}
