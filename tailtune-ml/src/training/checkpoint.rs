//! Checkpoint storage for training runs.
//!
//! Every run owns a directory under the store root holding two slots,
//! `last.ckpt.json` (rewritten after every epoch) and `best.ckpt.json`
//! (rewritten on improvement). Writes go through a temporary sibling and a
//! rename, so a crash mid-save leaves the previous file intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{MlError, Result};
use crate::training::early_stopping::{MonitorSnapshot, MonitorState};
use crate::training::metrics::EpochSummary;

/// Checkpoint slot of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Last,
    Best,
}

impl Slot {
    fn file_name(&self) -> &'static str {
        match self {
            Self::Last => "last.ckpt.json",
            Self::Best => "best.ckpt.json",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Last => write!(f, "last"),
            Self::Best => write!(f, "best"),
        }
    }
}

impl FromStr for Slot {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last" => Ok(Self::Last),
            "best" => Ok(Self::Best),
            other => Err(MlError::config(format!(
                "unknown checkpoint slot '{other}' (expected last or best)"
            ))),
        }
    }
}

/// Where the per-epoch random streams continue from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: u64,
    pub next_epoch: usize,
}

/// Snapshot of a run at the end of an epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last completed epoch (0-based).
    pub epoch: usize,
    pub model_state: serde_json::Value,
    pub optimizer_state: serde_json::Value,
    pub scheduler_state: serde_json::Value,
    pub best_metric_at_save: Option<f64>,
    pub monitor: MonitorSnapshot,
    pub rng_state: RngState,
    pub config_hash: String,
    pub history: Vec<EpochSummary>,
    pub saved_at: DateTime<Utc>,
}

/// Checkpoint metadata, without the model payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub run_id: String,
    pub slot: Slot,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub epoch: usize,
    pub best_metric_at_save: Option<f64>,
    pub monitor_state: MonitorState,
    pub epochs_without_improvement: usize,
    pub config_hash: String,
    pub epochs_recorded: usize,
    pub saved_at: DateTime<Utc>,
}

impl fmt::Display for CheckpointSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Checkpoint {} ({})", self.run_id, self.slot)?;
        writeln!(f, "  Path:        {}", self.path.display())?;
        writeln!(f, "  Size:        {} bytes", self.size_bytes)?;
        writeln!(f, "  Epoch:       {}", self.epoch)?;
        match self.best_metric_at_save {
            Some(best) => writeln!(f, "  Best metric: {best:.6}")?,
            None => writeln!(f, "  Best metric: -")?,
        }
        writeln!(
            f,
            "  Monitor:     {:?} ({} epochs without improvement)",
            self.monitor_state, self.epochs_without_improvement
        )?;
        writeln!(f, "  History:     {} epochs", self.epochs_recorded)?;
        writeln!(f, "  Config hash: {}", self.config_hash)?;
        write!(f, "  Saved at:    {}", self.saved_at.to_rfc3339())
    }
}

/// Owner of every checkpoint path below `root`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn path(&self, run_id: &str, slot: Slot) -> PathBuf {
        self.run_dir(run_id).join(slot.file_name())
    }

    pub fn exists(&self, run_id: &str, slot: Slot) -> bool {
        self.path(run_id, slot).is_file()
    }

    /// Atomically replace the slot's checkpoint.
    pub fn save(&self, run_id: &str, slot: Slot, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.path(run_id, slot);
        tailtune_core::persistence::atomic_write_json(&path, checkpoint)?;
        tracing::debug!(
            run_id,
            %slot,
            epoch = checkpoint.epoch,
            path = %path.display(),
            "Saved checkpoint"
        );
        Ok(path)
    }

    /// Load a slot. `Ok(None)` when it does not exist; a corrupt file or a
    /// config hash other than `expected_config_hash` is an error.
    pub fn load(
        &self,
        run_id: &str,
        slot: Slot,
        expected_config_hash: &str,
    ) -> Result<Option<Checkpoint>> {
        let Some(checkpoint) = self.read(run_id, slot)? else {
            return Ok(None);
        };
        if checkpoint.config_hash != expected_config_hash {
            return Err(MlError::CorruptCheckpoint {
                run_id: run_id.to_string(),
                slot: slot.to_string(),
                reason: format!(
                    "config hash mismatch (stored {}, expected {})",
                    checkpoint.config_hash, expected_config_hash
                ),
            });
        }
        Ok(Some(checkpoint))
    }

    /// Metadata of a slot, without checking the config hash.
    pub fn inspect(&self, run_id: &str, slot: Slot) -> Result<Option<CheckpointSummary>> {
        let path = self.path(run_id, slot);
        let Some(checkpoint) = self.read(run_id, slot)? else {
            return Ok(None);
        };
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(Some(CheckpointSummary {
            run_id: run_id.to_string(),
            slot,
            path,
            size_bytes,
            epoch: checkpoint.epoch,
            best_metric_at_save: checkpoint.best_metric_at_save,
            monitor_state: checkpoint.monitor.state,
            epochs_without_improvement: checkpoint.monitor.epochs_without_improvement,
            config_hash: checkpoint.config_hash,
            epochs_recorded: checkpoint.history.len(),
            saved_at: checkpoint.saved_at,
        }))
    }

    fn read(&self, run_id: &str, slot: Slot) -> Result<Option<Checkpoint>> {
        let path = self.path(run_id, slot);
        match tailtune_core::persistence::load_json::<Checkpoint>(&path) {
            Ok(found) => Ok(found),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(MlError::CorruptCheckpoint {
                run_id: run_id.to_string(),
                slot: slot.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn checkpoint(epoch: usize, hash: &str) -> Checkpoint {
        Checkpoint {
            epoch,
            model_state: serde_json::json!({"params": [0.1, -0.30000000000000004, 1e-300]}),
            optimizer_state: serde_json::json!({"step": 3}),
            scheduler_state: serde_json::json!({"last_epoch": epoch + 1}),
            best_metric_at_save: Some(0.5),
            monitor: MonitorSnapshot {
                best: Some(0.5),
                epochs_without_improvement: 1,
                state: MonitorState::Stalled,
            },
            rng_state: RngState {
                seed: 42,
                next_epoch: epoch + 1,
            },
            config_hash: hash.to_string(),
            history: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_slot_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("run", Slot::Last, "h").unwrap().is_none());
        assert!(store.inspect("run", Slot::Best).unwrap().is_none());
        assert!(!store.exists("run", Slot::Last));
    }

    #[test]
    fn test_save_load_roundtrip_is_exact() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ckpt = checkpoint(4, "abc");
        let path = store.save("run-1", Slot::Last, &ckpt).unwrap();

        assert_eq!(path, dir.path().join("run-1").join("last.ckpt.json"));
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(store.load("run-1", Slot::Last, "abc").unwrap(), Some(ckpt));
    }

    #[test]
    fn test_hash_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save("run", Slot::Last, &checkpoint(1, "old")).unwrap();
        let err = store.load("run", Slot::Last, "new").unwrap_err();
        assert!(matches!(err, MlError::CorruptCheckpoint { .. }), "{err}");
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.path("run", Slot::Best);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{\"epoch\": 3, \"model_st").unwrap();
        assert!(matches!(
            store.load("run", Slot::Best, "h"),
            Err(MlError::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn test_inspect_ignores_hash() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save("run", Slot::Best, &checkpoint(7, "xyz")).unwrap();
        let summary = store.inspect("run", Slot::Best).unwrap().unwrap();
        assert_eq!(summary.epoch, 7);
        assert_eq!(summary.config_hash, "xyz");
        assert_eq!(summary.monitor_state, MonitorState::Stalled);
        assert!(summary.size_bytes > 0);
        assert!(summary.to_string().contains("Epoch:       7"));
    }

    #[test]
    fn test_slot_parsing() {
        assert_eq!("best".parse::<Slot>().unwrap(), Slot::Best);
        assert!("first".parse::<Slot>().is_err());
    }
}
