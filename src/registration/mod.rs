//! Dataset registration.
//!
//! The executor publishes produced files through a [`RegistrationClient`]
//! passed in at construction. Registration is per file: a call returns the
//! records it could create alongside the files it could not, and is made for
//! every task whatever its final status.
//!
//! Two clients are provided:
//! - [`LocalCatalog`]: JSON catalog on disk (or in memory for tests)
//! - [`RestCatalog`]: HTTP catalog service

pub mod local;
pub mod rest;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::error::RegistrationError;
use crate::session::Session;

pub use local::LocalCatalog;
pub use rest::{RestCatalog, RestCatalogConfig};

/// Read buffer used while hashing.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// A produced file handed to registration.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetFile {
    pub path: PathBuf,
    /// Declared semantic type; derived from the file name when absent.
    pub dataset_type: Option<String>,
    pub version: Version,
}

impl DatasetFile {
    pub fn new(path: impl Into<PathBuf>, version: Version) -> Self {
        Self {
            path: path.into(),
            dataset_type: None,
            version,
        }
    }

    pub fn with_dataset_type(mut self, dataset_type: impl Into<String>) -> Self {
        self.dataset_type = Some(dataset_type.into());
        self
    }
}

/// What registering a file did to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    /// No record existed for the dataset key.
    Created,
    /// Same content already registered; nothing written.
    Unchanged,
    /// Content changed; the prior record was replaced.
    Superseded,
}

impl RegistrationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationOutcome::Created => "created",
            RegistrationOutcome::Unchanged => "unchanged",
            RegistrationOutcome::Superseded => "superseded",
        }
    }
}

impl fmt::Display for RegistrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered dataset as returned by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub dataset_type: String,
    /// Directory of the file relative to the session root (`""` at the root).
    pub collection: String,
    pub relative_path: String,
    /// Hex encoded SHA-256 of the content.
    pub hash: String,
    pub size: u64,
    pub version: Version,
    /// Task that produced the file.
    pub task: String,
    pub outcome: RegistrationOutcome,
    pub registered_at: DateTime<Utc>,
    /// Record this one replaced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
}

impl DatasetRecord {
    /// Catalog uniqueness key.
    pub fn key(&self) -> (Uuid, &str, &str) {
        (self.session_id, &self.relative_path, &self.dataset_type)
    }
}

/// A file that could not be registered.
#[derive(Debug)]
pub struct RegistrationFailure {
    pub path: PathBuf,
    pub error: RegistrationError,
}

/// Result of one registration call.
#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub records: Vec<DatasetRecord>,
    pub failures: Vec<RegistrationFailure>,
}

impl RegistrationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Report in which every file failed with the same error.
    pub fn all_failed(files: &[DatasetFile], error: impl Fn() -> RegistrationError) -> Self {
        Self {
            records: Vec::new(),
            failures: files
                .iter()
                .map(|f| RegistrationFailure {
                    path: f.path.clone(),
                    error: error(),
                })
                .collect(),
        }
    }

    pub fn count(&self, outcome: RegistrationOutcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }
}

/// Catalog collaborator used by the executor.
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    /// Registers files produced by `task` for `session`.
    ///
    /// Fails per file: the report lists records for files that were
    /// registered and failures for the rest. Registering an unchanged file
    /// twice must not create a second record.
    async fn register(
        &self,
        session: &Session,
        task: &str,
        files: &[DatasetFile],
    ) -> RegistrationReport;
}

/// Hash, size and catalog key of a file about to be registered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedDataset {
    pub session_id: Uuid,
    pub dataset_type: String,
    pub collection: String,
    pub relative_path: String,
    pub hash: String,
    pub size: u64,
    pub version: Version,
}

impl PreparedDataset {
    /// Reads and hashes a file, deriving its catalog key.
    pub async fn from_file(session: &Session, file: &DatasetFile) -> Result<Self, RegistrationError> {
        let relative = file.path.strip_prefix(&session.root).map_err(|_| {
            RegistrationError::OutsideSession {
                path: file.path.clone(),
                root: session.root.clone(),
            }
        })?;
        let relative_path = to_slash(relative);
        let dataset_type = match &file.dataset_type {
            Some(t) => t.clone(),
            None => dataset_type_from_name(&relative_path)?,
        };
        let collection = relative.parent().map(to_slash).unwrap_or_default();
        let (hash, size) = hash_file(&file.path).await?;

        Ok(Self {
            session_id: session.id,
            dataset_type,
            collection,
            relative_path,
            hash,
            size,
            version: file.version.clone(),
        })
    }

    /// Builds the catalog record for this dataset.
    pub fn into_record(
        self,
        task: &str,
        outcome: RegistrationOutcome,
        supersedes: Option<Uuid>,
    ) -> DatasetRecord {
        DatasetRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            dataset_type: self.dataset_type,
            collection: self.collection,
            relative_path: self.relative_path,
            hash: self.hash,
            size: self.size,
            version: self.version,
            task: task.to_string(),
            outcome,
            registered_at: Utc::now(),
            supersedes,
        }
    }
}

pub(crate) fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Derives `object.attribute` from a `object.attribute.extension` file name.
pub fn dataset_type_from_name(relative_path: &str) -> Result<String, RegistrationError> {
    let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(RegistrationError::UnknownDatasetType(name.to_string()));
    }
    Ok(format!("{}.{}", parts[0], parts[1]))
}

/// SHA-256 (hex) and size of a file.
pub async fn hash_file(path: &Path) -> Result<(String, u64), RegistrationError> {
    let mut file = fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RegistrationError::FileNotFound(path.to_path_buf())
        } else {
            RegistrationError::Io(e)
        }
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}
