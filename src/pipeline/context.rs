//! Context handed to extraction logic.
//!
//! A context carries the session identity, the files produced by upstream
//! nodes and a read-only snapshot of the sync mappings computed so far. It
//! also collects the files a task reports while it runs, so that they can be
//! registered even if the task later fails or panics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::SyncError;
use crate::session::{Session, SessionClassification};
use crate::sync::SyncMapping;

/// Immutable set of mapping results keyed by device.
#[derive(Debug, Clone, Default)]
pub struct MappingSet {
    entries: BTreeMap<String, Result<Arc<SyncMapping>, SyncError>>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mappings(mappings: impl IntoIterator<Item = SyncMapping>) -> Self {
        Self {
            entries: mappings
                .into_iter()
                .map(|m| (m.device.clone(), Ok(Arc::new(m))))
                .collect(),
        }
    }

    /// Mapping for a device, the error that prevented computing it, or
    /// `MissingMapping`.
    pub fn get(&self, device: &str) -> Result<Arc<SyncMapping>, SyncError> {
        match self.entries.get(device) {
            Some(Ok(mapping)) => Ok(Arc::clone(mapping)),
            Some(Err(e)) => Err(e.clone()),
            None => Err(SyncError::MissingMapping(device.to_string())),
        }
    }

    /// Successfully computed mappings.
    pub fn mappings(&self) -> impl Iterator<Item = &Arc<SyncMapping>> {
        self.entries.values().filter_map(|r| r.as_ref().ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// New set with `published` entries replacing existing ones.
    pub fn merged(&self, published: BTreeMap<String, Result<Arc<SyncMapping>, SyncError>>) -> Self {
        let mut entries = self.entries.clone();
        entries.extend(published);
        Self { entries }
    }
}

/// Per-dispatch context for one task node.
#[derive(Debug)]
pub struct TaskContext {
    session: Arc<Session>,
    classification: Arc<SessionClassification>,
    task_name: String,
    attempt: u32,
    inputs: BTreeMap<String, Vec<PathBuf>>,
    mappings: Arc<MappingSet>,
    recorded: Mutex<Vec<PathBuf>>,
    published: Mutex<BTreeMap<String, Result<Arc<SyncMapping>, SyncError>>>,
}

impl TaskContext {
    pub fn new(
        classification: Arc<SessionClassification>,
        task_name: impl Into<String>,
        mappings: Arc<MappingSet>,
    ) -> Self {
        Self {
            session: Arc::new(classification.session.clone()),
            classification,
            task_name: task_name.into(),
            attempt: 1,
            inputs: BTreeMap::new(),
            mappings,
            recorded: Mutex::new(Vec::new()),
            published: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Files produced by an upstream node.
    pub fn with_input(mut self, upstream: impl Into<String>, files: Vec<PathBuf>) -> Self {
        self.inputs.insert(upstream.into(), files);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn classification(&self) -> &SessionClassification {
        &self.classification
    }

    pub fn root(&self) -> &Path {
        &self.session.root
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn inputs(&self, upstream: &str) -> &[PathBuf] {
        self.inputs.get(upstream).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Read access to an already computed mapping.
    pub fn mapping(&self, device: &str) -> Result<Arc<SyncMapping>, SyncError> {
        self.mappings.get(device)
    }

    pub fn mappings(&self) -> &MappingSet {
        &self.mappings
    }

    /// Reports a file as written. Recorded files are registered whatever
    /// the task's outcome.
    pub fn record_output(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut recorded = lock(&self.recorded);
        if !recorded.contains(&path) {
            recorded.push(path);
        }
    }

    pub fn recorded_outputs(&self) -> Vec<PathBuf> {
        lock(&self.recorded).clone()
    }

    /// Publishes a mapping for dependents of this node.
    pub fn publish_mapping(&self, mapping: Arc<SyncMapping>) {
        lock(&self.published).insert(mapping.device.clone(), Ok(mapping));
    }

    /// Publishes the reason a device could not be synchronized.
    pub fn publish_sync_failure(&self, device: impl Into<String>, error: SyncError) {
        lock(&self.published).insert(device.into(), Err(error));
    }

    pub fn take_published(&self) -> BTreeMap<String, Result<Arc<SyncMapping>, SyncError>> {
        std::mem::take(&mut *lock(&self.published))
    }
}

/// Locks a mutex, recovering the data when a panicking task poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Procedure, ProtocolFamily};
    use chrono::NaiveDate;

    fn classification() -> Arc<SessionClassification> {
        Arc::new(SessionClassification {
            session: Session::new(
                "SWC_043",
                NaiveDate::from_ymd_opt(2020, 9, 21).unwrap(),
                1,
                "/data/SWC_043/2020-09-21/001",
                "_iblrig_tasks_trainingChoiceWorld6.4.2",
                Procedure::BehaviorTraining,
            ),
            family: ProtocolFamily::Training,
            probes: vec![],
            cameras: vec![],
            has_behavior: true,
            has_passive: false,
            has_opto: false,
        })
    }

    #[test]
    fn test_record_output_dedups() {
        let ctx = TaskContext::new(classification(), "Trials", Arc::new(MappingSet::new()));
        ctx.record_output("/tmp/a.json");
        ctx.record_output("/tmp/a.json");
        ctx.record_output("/tmp/b.json");
        assert_eq!(ctx.recorded_outputs().len(), 2);
    }

    #[test]
    fn test_mapping_lookup() {
        let set = MappingSet::from_mappings([SyncMapping::identity("bpod", 10)]);
        let ctx = TaskContext::new(classification(), "Trials", Arc::new(set));
        assert!(ctx.mapping("bpod").is_ok());
        assert_eq!(
            ctx.mapping("probe00").unwrap_err(),
            SyncError::MissingMapping("probe00".to_string())
        );
    }

    #[test]
    fn test_published_failures_are_returned_to_dependents() {
        let ctx = TaskContext::new(classification(), "EphysSync", Arc::new(MappingSet::new()));
        ctx.publish_mapping(Arc::new(SyncMapping::identity("probe00", 5)));
        ctx.publish_sync_failure("probe01", SyncError::NoPulses("probe01".to_string()));

        let merged = MappingSet::new().merged(ctx.take_published());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.mappings().count(), 1);
        assert_eq!(
            merged.get("probe01").unwrap_err(),
            SyncError::NoPulses("probe01".to_string())
        );
        assert!(ctx.take_published().is_empty());
    }
}
