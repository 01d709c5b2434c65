//! Training run outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::training::config::TrainingConfig;
use crate::training::metrics::EpochSummary;

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    EarlyStopped,
    Pruned,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether the run's best metric counts as an objective value.
    pub fn has_objective(&self) -> bool {
        matches!(self, Self::Completed | Self::EarlyStopped)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::EarlyStopped => "early_stopped",
            Self::Pruned => "pruned",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One training run and what happened to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: String,
    pub config: TrainingConfig,
    /// Next epoch to run (0-based); equals the number of completed epochs.
    pub current_epoch: usize,
    pub best_metric: Option<f64>,
    pub best_epoch: Option<usize>,
    pub epochs_without_improvement: usize,
    pub status: RunStatus,
    pub history: Vec<EpochSummary>,
    pub error: Option<String>,
    /// Epoch the run resumed from, when it was restored from a checkpoint.
    pub resumed_from: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrainingRun {
    pub fn new(run_id: &str, config: TrainingConfig) -> Self {
        Self {
            run_id: run_id.to_string(),
            config,
            current_epoch: 0,
            best_metric: None,
            best_epoch: None,
            epochs_without_improvement: 0,
            status: RunStatus::Running,
            history: Vec::new(),
            error: None,
            resumed_from: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
        self.finish(RunStatus::Failed);
    }

    /// `(epoch, monitored value)` pairs.
    pub fn trajectory(&self) -> Vec<(usize, f64)> {
        self.history.iter().map(|s| (s.epoch, s.monitored)).collect()
    }
}
