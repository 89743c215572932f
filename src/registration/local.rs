//! JSON file catalog.
//!
//! Keeps the current record per (session, relative path, type) and the
//! records they superseded. The file is rewritten atomically after each
//! registration call that changed something.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RegistrationError;
use crate::session::Session;

use super::{
    DatasetFile, DatasetRecord, PreparedDataset, RegistrationClient, RegistrationFailure,
    RegistrationOutcome, RegistrationReport,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogState {
    datasets: Vec<DatasetRecord>,
    #[serde(default)]
    history: Vec<DatasetRecord>,
}

impl CatalogState {
    fn find(&self, prepared: &PreparedDataset) -> Option<usize> {
        self.datasets.iter().position(|r| {
            r.session_id == prepared.session_id
                && r.relative_path == prepared.relative_path
                && r.dataset_type == prepared.dataset_type
        })
    }

    /// Inserts or supersedes; returns the record and whether state changed.
    fn upsert(&mut self, prepared: PreparedDataset, task: &str) -> (DatasetRecord, bool) {
        match self.find(&prepared) {
            Some(i) if self.datasets[i].hash == prepared.hash => {
                let mut existing = self.datasets[i].clone();
                existing.outcome = RegistrationOutcome::Unchanged;
                (existing, false)
            }
            Some(i) => {
                let previous = self.datasets.remove(i);
                let record =
                    prepared.into_record(task, RegistrationOutcome::Superseded, Some(previous.id));
                self.history.push(previous);
                self.datasets.push(record.clone());
                (record, true)
            }
            None => {
                let record = prepared.into_record(task, RegistrationOutcome::Created, None);
                self.datasets.push(record.clone());
                (record, true)
            }
        }
    }
}

/// Catalog stored as a JSON file, or held in memory.
#[derive(Debug)]
pub struct LocalCatalog {
    path: Option<PathBuf>,
    state: Mutex<CatalogState>,
}

impl LocalCatalog {
    /// Opens the catalog at `path`, creating it on first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistrationError> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogState::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), "Local catalog opened");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Catalog that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(CatalogState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current records, one per dataset key.
    pub async fn records(&self) -> Vec<DatasetRecord> {
        self.state.lock().await.datasets.clone()
    }

    pub async fn records_for(&self, session_id: Uuid) -> Vec<DatasetRecord> {
        self.state
            .lock()
            .await
            .datasets
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Records replaced by newer content.
    pub async fn history(&self) -> Vec<DatasetRecord> {
        self.state.lock().await.history.clone()
    }

    async fn persist(&self, state: &CatalogState) -> Result<(), RegistrationError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl RegistrationClient for LocalCatalog {
    async fn register(
        &self,
        session: &Session,
        task: &str,
        files: &[DatasetFile],
    ) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        let mut prepared = Vec::with_capacity(files.len());
        for file in files {
            match PreparedDataset::from_file(session, file).await {
                Ok(p) => prepared.push((file.path.clone(), p)),
                Err(error) => {
                    warn!(session = %session, task = task, path = %file.path.display(), error = %error, "Cannot register file");
                    report.failures.push(RegistrationFailure {
                        path: file.path.clone(),
                        error,
                    });
                }
            }
        }

        let mut state = self.state.lock().await;
        let snapshot = state.clone();
        let mut changed = Vec::new();
        for (path, p) in prepared {
            let (record, dirty) = state.upsert(p, task);
            debug!(session = %session, path = %record.relative_path, outcome = %record.outcome, "Registered dataset");
            if dirty {
                changed.push(path);
            }
            report.records.push(record);
        }

        if !changed.is_empty() {
            if let Err(e) = self.persist(&state).await {
                warn!(session = %session, task = task, error = %e, "Catalog write failed, rolling back");
                *state = snapshot;
                report.records.retain(|r| r.outcome == RegistrationOutcome::Unchanged);
                report
                    .failures
                    .extend(changed.into_iter().map(|path| RegistrationFailure {
                        path,
                        error: RegistrationError::Catalog(e.to_string()),
                    }));
            }
        }

        info!(
            session = %session,
            task = task,
            registered = report.records.len(),
            failed = report.failures.len(),
            "Registration finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Procedure;
    use chrono::NaiveDate;
    use semver::Version;
    use std::fs as stdfs;

    fn session(root: &Path) -> Session {
        Session::new(
            "CSH_ZAD_001",
            NaiveDate::from_ymd_opt(2020, 1, 14).unwrap(),
            1,
            root,
            "_iblrig_tasks_ephysChoiceWorld6.2.5",
            Procedure::AcuteRecording,
        )
    }

    fn file(path: &Path) -> DatasetFile {
        DatasetFile::new(path, Version::new(1, 0, 0))
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alf/_ibl_trials.intervals.json");
        stdfs::create_dir_all(path.parent().unwrap()).unwrap();
        stdfs::write(&path, "[[0, 1]]").unwrap();
        let catalog = LocalCatalog::in_memory();
        let s = session(dir.path());

        let first = catalog.register(&s, "Trials", &[file(&path)]).await;
        assert_eq!(first.count(RegistrationOutcome::Created), 1);
        let second = catalog.register(&s, "Trials", &[file(&path)]).await;
        assert_eq!(second.count(RegistrationOutcome::Unchanged), 1);
        assert_eq!(second.records[0].id, first.records[0].id);
        assert_eq!(catalog.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_changed_content_supersedes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alf/_ibl_trials.intervals.json");
        stdfs::create_dir_all(path.parent().unwrap()).unwrap();
        stdfs::write(&path, "[[0, 1]]").unwrap();
        let catalog = LocalCatalog::in_memory();
        let s = session(dir.path());

        let first = catalog.register(&s, "Trials", &[file(&path)]).await;
        stdfs::write(&path, "[[0, 2]]").unwrap();
        let second = catalog.register(&s, "Trials", &[file(&path)]).await;

        assert_eq!(second.records[0].outcome, RegistrationOutcome::Superseded);
        assert_eq!(second.records[0].supersedes, Some(first.records[0].id));
        assert_eq!(catalog.records().await.len(), 1);
        assert_eq!(catalog.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_registration() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("alf/spikes.times.json");
        stdfs::create_dir_all(good.parent().unwrap()).unwrap();
        stdfs::write(&good, "[]").unwrap();
        let missing = dir.path().join("alf/spikes.amps.json");
        let untyped = dir.path().join("alf/README");
        stdfs::write(&untyped, "x").unwrap();

        let catalog = LocalCatalog::in_memory();
        let report = catalog
            .register(
                &session(dir.path()),
                "SpikeSync_probe00",
                &[file(&good), file(&missing), file(&untyped)],
            )
            .await;
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.failures.len(), 2);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_catalog_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog/datasets.json");
        let data = dir.path().join("session/alf/spikes.times.json");
        stdfs::create_dir_all(data.parent().unwrap()).unwrap();
        stdfs::write(&data, "[1.0]").unwrap();
        let s = session(&dir.path().join("session"));

        let catalog = LocalCatalog::open(&catalog_path).await.unwrap();
        catalog.register(&s, "SpikeSync", &[file(&data)]).await;
        drop(catalog);

        let reopened = LocalCatalog::open(&catalog_path).await.unwrap();
        assert_eq!(reopened.records_for(s.id).await.len(), 1);
        let again = reopened.register(&s, "SpikeSync", &[file(&data)]).await;
        assert_eq!(again.count(RegistrationOutcome::Unchanged), 1);
    }
}
