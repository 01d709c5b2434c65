//! Experiment tracking: the store interface, a file-backed store, an
//! in-memory store, and the reporter that shields training from store
//! failures.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::TrackingError;
use crate::params::ParamMap;
use crate::training::metrics::EpochSummary;

/// An experiment-tracking backend.
pub trait TrackingStore: Send + Sync {
    fn log_params(&self, run_id: &str, params: &ParamMap) -> Result<(), TrackingError>;

    fn log_metric(
        &self,
        run_id: &str,
        name: &str,
        value: f64,
        step: usize,
    ) -> Result<(), TrackingError>;

    fn log_artifact(&self, run_id: &str, path: &Path) -> Result<(), TrackingError>;
}

/// One logged metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub run_id: String,
    pub name: String,
    pub value: f64,
    pub step: usize,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Tracking store writing under `<tracking_dir>/<experiment>/<run_id>/`:
/// `params.json`, `metrics.jsonl` and copied files in `artifacts/`.
#[derive(Debug, Clone)]
pub struct FileTrackingStore {
    root: PathBuf,
}

impl FileTrackingStore {
    pub fn new(tracking_dir: &Path, experiment: &str) -> Self {
        Self {
            root: tracking_dir.join(experiment),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }
}

impl TrackingStore for FileTrackingStore {
    fn log_params(&self, run_id: &str, params: &ParamMap) -> Result<(), TrackingError> {
        let path = self.run_dir(run_id).join("params.json");
        tailtune_core::persistence::atomic_write_json(&path, params)?;
        Ok(())
    }

    fn log_metric(
        &self,
        run_id: &str,
        name: &str,
        value: f64,
        step: usize,
    ) -> Result<(), TrackingError> {
        let record = MetricRecord {
            run_id: run_id.to_string(),
            name: name.to_string(),
            value,
            step,
            timestamp: Utc::now(),
        };
        let path = self.run_dir(run_id).join("metrics.jsonl");
        tailtune_core::persistence::append_json_line(&path, &record)?;
        Ok(())
    }

    fn log_artifact(&self, run_id: &str, path: &Path) -> Result<(), TrackingError> {
        let file_name = path.file_name().ok_or_else(|| {
            TrackingError::Unavailable(format!("artifact {} has no file name", path.display()))
        })?;
        let dir = self.run_dir(run_id).join("artifacts");
        std::fs::create_dir_all(&dir)?;
        std::fs::copy(path, dir.join(file_name))?;
        Ok(())
    }
}

/// Store that accepts and discards everything; used when tracking is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTrackingStore;

impl TrackingStore for NullTrackingStore {
    fn log_params(&self, _run_id: &str, _params: &ParamMap) -> Result<(), TrackingError> {
        Ok(())
    }

    fn log_metric(&self, _: &str, _: &str, _: f64, _: usize) -> Result<(), TrackingError> {
        Ok(())
    }

    fn log_artifact(&self, _run_id: &str, _path: &Path) -> Result<(), TrackingError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    params: Vec<(String, ParamMap)>,
    metrics: Vec<MetricRecord>,
    artifacts: Vec<(String, PathBuf)>,
    fail_next: usize,
    unavailable: bool,
}

/// In-memory store with failure injection. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrackingStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `n` calls, whatever they are.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Fail every call until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn params(&self, run_id: &str) -> Option<ParamMap> {
        self.lock()
            .params
            .iter()
            .rev()
            .find(|(id, _)| id == run_id)
            .map(|(_, p)| p.clone())
    }

    pub fn metric_values(&self, run_id: &str, name: &str) -> Vec<(usize, f64)> {
        self.lock()
            .metrics
            .iter()
            .filter(|m| m.run_id == run_id && m.name == name)
            .map(|m| (m.step, m.value))
            .collect()
    }

    pub fn artifacts(&self, run_id: &str) -> Vec<PathBuf> {
        self.lock()
            .artifacts
            .iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn check(state: &mut MemoryState) -> Result<(), TrackingError> {
        if state.unavailable {
            return Err(TrackingError::Unavailable("store marked unavailable".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TrackingError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl TrackingStore for MemoryTrackingStore {
    fn log_params(&self, run_id: &str, params: &ParamMap) -> Result<(), TrackingError> {
        let mut state = self.lock();
        Self::check(&mut state)?;
        state.params.push((run_id.to_string(), params.clone()));
        Ok(())
    }

    fn log_metric(
        &self,
        run_id: &str,
        name: &str,
        value: f64,
        step: usize,
    ) -> Result<(), TrackingError> {
        let mut state = self.lock();
        Self::check(&mut state)?;
        state.metrics.push(MetricRecord {
            run_id: run_id.to_string(),
            name: name.to_string(),
            value,
            step,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn log_artifact(&self, run_id: &str, path: &Path) -> Result<(), TrackingError> {
        let mut state = self.lock();
        Self::check(&mut state)?;
        state.artifacts.push((run_id.to_string(), path.to_path_buf()));
        Ok(())
    }
}

/// Relays run data to a [`TrackingStore`]. A failing call is retried once,
/// then dropped with a warning; nothing here ever fails a run.
#[derive(Clone)]
pub struct RunReporter {
    store: Arc<dyn TrackingStore>,
    dropped: Arc<AtomicUsize>,
}

impl RunReporter {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self {
            store,
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NullTrackingStore))
    }

    /// Number of calls given up on so far.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn params(&self, run_id: &str, params: &ParamMap) {
        self.relay(run_id, "params", || self.store.log_params(run_id, params));
    }

    pub fn metric(&self, run_id: &str, name: &str, value: f64, step: usize) {
        self.relay(run_id, name, || self.store.log_metric(run_id, name, value, step));
    }

    pub fn artifact(&self, run_id: &str, path: &Path) {
        self.relay(run_id, "artifact", || self.store.log_artifact(run_id, path));
    }

    /// Every metric of an epoch summary, at step `summary.epoch`.
    pub fn epoch(&self, run_id: &str, summary: &EpochSummary) {
        for (name, value) in summary.metric_pairs() {
            self.metric(run_id, &name, value, summary.epoch);
        }
    }

    fn relay(&self, run_id: &str, what: &str, call: impl Fn() -> Result<(), TrackingError>) {
        let Err(first) = call() else {
            return;
        };
        tracing::debug!(run_id, what, error = %first, "Tracking call failed, retrying once");
        if let Err(second) = call() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(run_id, what, error = %second, "Dropping tracking call");
        }
    }
}

impl std::fmt::Debug for RunReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunReporter")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_failure_is_retried() {
        let store = MemoryTrackingStore::new();
        let reporter = RunReporter::new(Arc::new(store.clone()));
        store.fail_next(1);
        reporter.metric("r", "val_accuracy", 0.5, 0);
        assert_eq!(store.metric_values("r", "val_accuracy"), vec![(0, 0.5)]);
        assert_eq!(reporter.dropped(), 0);
    }

    #[test]
    fn test_persistent_failure_is_dropped() {
        let store = MemoryTrackingStore::new();
        let reporter = RunReporter::new(Arc::new(store.clone()));
        store.set_unavailable(true);
        reporter.metric("r", "val_accuracy", 0.5, 0);
        reporter.params("r", &ParamMap::new());
        assert_eq!(reporter.dropped(), 2);

        store.set_unavailable(false);
        reporter.metric("r", "val_accuracy", 0.6, 1);
        assert_eq!(store.metric_values("r", "val_accuracy"), vec![(1, 0.6)]);
    }

    #[test]
    fn test_file_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTrackingStore::new(dir.path(), "exp");
        let mut params = ParamMap::new();
        params.insert("lr".into(), 0.001.into());
        store.log_params("run-1", &params).unwrap();
        store.log_metric("run-1", "val_loss", 0.9, 0).unwrap();
        store.log_metric("run-1", "val_loss", 0.8, 1).unwrap();

        let artifact = dir.path().join("report.json");
        std::fs::write(&artifact, "{}").unwrap();
        store.log_artifact("run-1", &artifact).unwrap();

        let run_dir = dir.path().join("exp").join("run-1");
        let saved: ParamMap =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("params.json")).unwrap())
                .unwrap();
        assert_eq!(saved, params);
        let lines = std::fs::read_to_string(run_dir.join("metrics.jsonl")).unwrap();
        let records: Vec<MetricRecord> = lines
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, 0.8);
        assert!(run_dir.join("artifacts").join("report.json").exists());
    }

    #[test]
    fn test_missing_artifact_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTrackingStore::new(dir.path(), "exp");
        assert!(store.log_artifact("r", &dir.path().join("nope.json")).is_err());
    }
}
