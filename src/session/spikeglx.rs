//! SpikeGLX `.meta` file parsing.
//!
//! Meta files are flat `key=value` lines. Only the fields the pipeline needs
//! are lifted into [`ProbeMeta`]; everything else stays in `fields`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

const SAMPLE_RATE_KEY: &str = "imSampRate";
const SERIAL_KEY: &str = "imDatPrb_sn";
const PROBE_TYPE_KEY: &str = "imDatPrb_type";
const FILE_NAME_KEY: &str = "fileName";

/// Sampling rate assumed when the meta file does not carry one.
pub const DEFAULT_SAMPLE_RATE: f64 = 30_000.0;

/// Parsed metadata of one probe's action-potential band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeMeta {
    pub sample_rate: f64,
    pub serial: Option<u64>,
    pub model: Option<String>,
    pub raw_file_name: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl ProbeMeta {
    /// Parses meta file contents.
    pub fn parse(contents: &str, path: &Path) -> Result<Self, SessionError> {
        let mut fields = BTreeMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| SessionError::InvalidMeta {
                path: path.to_path_buf(),
                reason: format!("line without '=': {}", line),
            })?;
            // SpikeGLX prefixes some keys with '~'
            fields.insert(
                key.trim().trim_start_matches('~').to_string(),
                value.trim().to_string(),
            );
        }

        let sample_rate = match fields.get(SAMPLE_RATE_KEY) {
            Some(raw) => raw.parse::<f64>().map_err(|e| SessionError::InvalidMeta {
                path: path.to_path_buf(),
                reason: format!("{}: {}", SAMPLE_RATE_KEY, e),
            })?,
            None => DEFAULT_SAMPLE_RATE,
        };
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(SessionError::InvalidMeta {
                path: path.to_path_buf(),
                reason: format!("non-positive sampling rate {}", sample_rate),
            });
        }

        Ok(Self {
            sample_rate,
            serial: fields.get(SERIAL_KEY).and_then(|s| s.parse().ok()),
            model: fields.get(PROBE_TYPE_KEY).cloned(),
            raw_file_name: fields.get(FILE_NAME_KEY).cloned(),
            fields,
        })
    }

    /// Reads and parses a meta file from disk.
    pub fn read(path: &Path) -> Result<Self, SessionError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents, path)
    }
}

/// Finds the first `*.ap.meta` file in a probe directory.
pub fn find_ap_meta(probe_dir: &Path) -> Option<PathBuf> {
    let mut metas: Vec<PathBuf> = fs::read_dir(probe_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".ap.meta"))
                .unwrap_or(false)
        })
        .collect();
    metas.sort();
    metas.into_iter().next()
}
