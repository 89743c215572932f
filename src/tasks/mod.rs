//! Extraction task variants.
//!
//! Every node of a task graph runs one [`ExtractionTask`]. The graph builder
//! selects the variant per protocol family; tasks themselves only read the
//! context they are given and write files under the session root.

pub mod ephys;
pub mod qc;
pub mod raw;
pub mod trials;

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ExtractionError;
use crate::pipeline::TaskContext;

/// Extraction capability bound to one task node.
#[async_trait]
pub trait ExtractionTask: Send + Sync {
    /// Stable identifier of the variant, used in logs and graph equality.
    fn kind(&self) -> &'static str;

    /// Runs the extraction and returns the files it produced.
    ///
    /// Files should also be reported with [`TaskContext::record_output`] as
    /// soon as they are written, so they are registered if a later step fails.
    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError>;
}

/// Writes `value` as JSON under the session root and records it on the context.
pub(crate) fn write_json<T: Serialize + ?Sized>(
    ctx: &TaskContext,
    relative: &Path,
    value: &T,
) -> Result<PathBuf, ExtractionError> {
    let path = ctx.root().join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_vec_pretty(value)?)?;
    ctx.record_output(&path);
    Ok(path)
}

/// Reads a JSON input, mapping a missing file to `MissingInput`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ExtractionError> {
    if !path.is_file() {
        return Err(ExtractionError::MissingInput(path.to_path_buf()));
    }
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| ExtractionError::InvalidInput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
