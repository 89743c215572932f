//! Raw data registration.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ExtractionError;
use crate::pipeline::TaskContext;

use super::ExtractionTask;

/// Reports every file under the session's `raw_*_data` directories so they
/// are registered as datasets. Present in every graph.
#[derive(Debug, Default, Clone)]
pub struct RawRegistrationTask;

impl RawRegistrationTask {
    pub fn new() -> Self {
        Self
    }
}

fn is_raw_dir(name: &str) -> bool {
    name.starts_with("raw_") && name.ends_with("_data")
}

#[async_trait]
impl ExtractionTask for RawRegistrationTask {
    fn kind(&self) -> &'static str {
        "raw_registration"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Vec<PathBuf>, ExtractionError> {
        let mut raw_dirs: Vec<PathBuf> = fs::read_dir(ctx.root())?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter(|e| e.file_name().to_str().is_some_and(is_raw_dir))
            .map(|e| e.path())
            .collect();
        raw_dirs.sort();

        let mut files = Vec::new();
        for dir in raw_dirs {
            for entry in WalkDir::new(&dir).sort_by_file_name() {
                let entry = entry.map_err(|e| ExtractionError::Failed(e.to_string()))?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        }

        debug!(session = %ctx.session(), files = files.len(), "Collected raw files");
        for file in &files {
            ctx.record_output(file);
        }
        Ok(files)
    }
}
