//! HTTP catalog client.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::RegistrationError;
use crate::session::Session;

use super::{
    DatasetFile, DatasetRecord, PreparedDataset, RegistrationClient, RegistrationFailure,
    RegistrationReport,
};

#[derive(Debug, Clone)]
pub struct RestCatalogConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl RestCatalogConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    session_id: Uuid,
    subject: &'a str,
    task: &'a str,
    datasets: &'a [PreparedDataset],
}

#[derive(Debug, Deserialize)]
struct RejectedDataset {
    relative_path: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    records: Vec<DatasetRecord>,
    #[serde(default)]
    rejected: Vec<RejectedDataset>,
}

/// Registers datasets with a remote catalog service.
///
/// Hashing happens locally; the service upserts by dataset key and answers
/// with the records it holds, so dedup and supersede are its responsibility.
pub struct RestCatalog {
    client: Client,
    config: RestCatalogConfig,
}

impl RestCatalog {
    pub fn new(config: RestCatalogConfig) -> Result<Self, RegistrationError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RegistrationError::Catalog(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/datasets/register", self.config.base_url.trim_end_matches('/'))
    }

    fn request_error(&self, e: reqwest::Error) -> RegistrationError {
        if e.is_timeout() {
            RegistrationError::Timeout(self.config.timeout)
        } else {
            RegistrationError::Catalog(e.to_string())
        }
    }

    async fn send(
        &self,
        session: &Session,
        task: &str,
        datasets: &[PreparedDataset],
    ) -> Result<RegisterResponse, RegistrationError> {
        let body = RegisterRequest {
            session_id: session.id,
            subject: &session.subject,
            task,
            datasets,
        };
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| self.request_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RegistrationError::Catalog(format!("HTTP {}: {}", status, text)));
        }
        resp.json().await.map_err(|e| self.request_error(e))
    }
}

#[async_trait]
impl RegistrationClient for RestCatalog {
    async fn register(
        &self,
        session: &Session,
        task: &str,
        files: &[DatasetFile],
    ) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        let mut prepared = Vec::with_capacity(files.len());
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            match PreparedDataset::from_file(session, file).await {
                Ok(p) => {
                    paths.push(file.path.clone());
                    prepared.push(p);
                }
                Err(error) => report.failures.push(RegistrationFailure {
                    path: file.path.clone(),
                    error,
                }),
            }
        }
        if prepared.is_empty() {
            return report;
        }

        match self.send(session, task, &prepared).await {
            Ok(response) => {
                for rejected in response.rejected {
                    report.failures.push(RegistrationFailure {
                        path: session.root.join(&rejected.relative_path),
                        error: RegistrationError::Catalog(rejected.reason),
                    });
                }
                report.records = response.records;
                info!(session = %session, task = task, registered = report.records.len(), "Registered with catalog");
            }
            Err(e) => {
                warn!(session = %session, task = task, error = %e, "Catalog registration failed");
                let message = e.to_string();
                let timeout = matches!(e, RegistrationError::Timeout(_));
                report.failures.extend(paths.into_iter().map(|path: PathBuf| {
                    RegistrationFailure {
                        path,
                        error: if timeout {
                            RegistrationError::Timeout(self.config.timeout)
                        } else {
                            RegistrationError::Catalog(message.clone())
                        },
                    }
                }));
            }
        }
        report
    }
}

impl std::fmt::Debug for RestCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCatalog")
            .field("base_url", &self.config.base_url)
            .field("timeout", &self.config.timeout)
            .finish()
    }
}
