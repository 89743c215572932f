//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use neuropipe::registration::{
    DatasetFile, LocalCatalog, RegistrationClient, RegistrationFailure, RegistrationReport,
};
use neuropipe::session::Session;
use neuropipe::RegistrationError;
use tempfile::TempDir;

/// Irregularly spaced pulse train so clock offsets are unambiguous.
pub fn irregular_pulses(n: usize) -> Vec<f64> {
    let mut t = 1.0;
    (0..n)
        .map(|i| {
            t += 0.5 + ((i * 37) % 11) as f64 * 0.1;
            t
        })
        .collect()
}

pub fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_vec(value).unwrap()).unwrap();
}

/// Raw electrophysiology session without behaviour, laid out as
/// `<tmp>/mainenlab/Subjects/ZM_2240/2020-01-22/001`.
pub struct EphysSessionFixture {
    _dir: TempDir,
    pub root: PathBuf,
    pub reference: Vec<f64>,
}

impl EphysSessionFixture {
    pub fn new(probes: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir
            .path()
            .join("mainenlab/Subjects/ZM_2240/2020-01-22/001");
        let reference = irregular_pulses(100);
        write_json(
            &root.join("raw_ephys_data/_spikeglx_sync.times.json"),
            &reference,
        );

        let fixture = Self {
            _dir: dir,
            root,
            reference,
        };
        for (i, probe) in probes.iter().enumerate() {
            fixture.add_probe(probe, 2.0 + i as f64);
        }
        fixture
    }

    pub fn probe_dir(&self, probe: &str) -> PathBuf {
        self.root.join("raw_ephys_data").join(probe)
    }

    /// Writes meta, sync pulses shifted by `offset_s`, and sorted spikes.
    pub fn add_probe(&self, probe: &str, offset_s: f64) {
        let dir = self.probe_dir(probe);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("_spikeglx_g0_t0.imec0.ap.meta"),
            "imSampRate=30000\nimDatPrb_sn=18005116\nimDatPrb_type=0\nfileName=_spikeglx_g0_t0.imec0.ap.bin\n",
        )
        .unwrap();
        let local: Vec<f64> = self.reference.iter().map(|r| r - offset_s).collect();
        write_json(&dir.join("_spikeglx_sync.times.json"), &local);
        write_json(&dir.join("spikes.samples.json"), &[30_000u64, 60_000, 90_000, 300_000]);
        self.set_amplitudes(probe, &[12.5, 40.0, 33.1, 18.2]);
    }

    pub fn set_amplitudes(&self, probe: &str, amplitudes: &[f64]) {
        write_json(&self.probe_dir(probe).join("spikes.amplitudes.json"), amplitudes);
    }

    pub fn set_probe_pulses(&self, probe: &str, pulses: &[f64]) {
        write_json(&self.probe_dir(probe).join("_spikeglx_sync.times.json"), pulses);
    }

    pub fn remove_reference(&self) {
        fs::remove_file(self.root.join("raw_ephys_data/_spikeglx_sync.times.json")).unwrap();
    }
}

/// Catalog double that records every call and rejects chosen file names.
pub struct RecordingClient {
    inner: LocalCatalog,
    reject: Vec<String>,
    pub calls: Mutex<Vec<(String, Vec<PathBuf>)>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self {
            inner: LocalCatalog::in_memory(),
            reject: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(mut self, file_name: &str) -> Self {
        self.reject.push(file_name.to_string());
        self
    }

    pub fn calls_for(&self, task: &str) -> Vec<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == task)
            .flat_map(|(_, files)| files.clone())
            .collect()
    }
}

#[async_trait]
impl RegistrationClient for RecordingClient {
    async fn register(
        &self,
        session: &Session,
        task: &str,
        files: &[DatasetFile],
    ) -> RegistrationReport {
        self.calls.lock().unwrap().push((
            task.to_string(),
            files.iter().map(|f| f.path.clone()).collect(),
        ));

        let (rejected, accepted): (Vec<DatasetFile>, Vec<DatasetFile>) =
            files.iter().cloned().partition(|f| {
                f.path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| self.reject.iter().any(|r| r == n))
            });

        let mut report = self.inner.register(session, task, &accepted).await;
        report
            .failures
            .extend(rejected.into_iter().map(|f| RegistrationFailure {
                path: f.path,
                error: RegistrationError::Timeout(std::time::Duration::from_secs(60)),
            }));
        report
    }
}
