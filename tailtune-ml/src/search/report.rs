//! End-of-study report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::error::Result;
use crate::params::ParamMap;
use crate::search::history::{SearchHistory, TrialRecord};
use crate::search::pruner::PrunerKind;
use crate::tracking::RunReporter;
use crate::training::config::Direction;
use crate::training::run::RunStatus;

/// One line of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub number: usize,
    pub run_id: String,
    pub status: RunStatus,
    /// Objective for completed and early-stopped trials only.
    pub value: Option<f64>,
    pub epochs: usize,
    pub error: Option<String>,
    pub params: ParamMap,
}

impl From<&TrialRecord> for TrialSummary {
    fn from(record: &TrialRecord) -> Self {
        Self {
            number: record.number,
            run_id: record.run_id.clone(),
            status: record.status,
            value: if record.status.has_objective() {
                record.value
            } else {
                None
            },
            epochs: record.intermediate.len(),
            error: record.error.clone(),
            params: record.params.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub completed: usize,
    pub early_stopped: usize,
    pub pruned: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyReport {
    pub study_id: Uuid,
    pub experiment: String,
    pub direction: Direction,
    pub sampler: String,
    pub pruner: PrunerKind,
    pub trials: Vec<TrialSummary>,
    pub best_trial: Option<usize>,
    pub best_value: Option<f64>,
    pub best_params: Option<ParamMap>,
    pub counts: StatusCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StudyReport {
    pub fn new(
        experiment: &str,
        direction: Direction,
        sampler: &str,
        pruner: PrunerKind,
        history: &SearchHistory,
        started_at: DateTime<Utc>,
    ) -> Self {
        let best = history.best(direction);
        Self {
            study_id: Uuid::new_v4(),
            experiment: experiment.to_string(),
            direction,
            sampler: sampler.to_string(),
            pruner,
            trials: history.trials().iter().map(TrialSummary::from).collect(),
            best_trial: best.map(|t| t.number),
            best_value: best.and_then(|t| t.value),
            best_params: best.map(|t| t.params.clone()),
            counts: StatusCounts {
                completed: history.count(RunStatus::Completed),
                early_stopped: history.count(RunStatus::EarlyStopped),
                pruned: history.count(RunStatus::Pruned),
                failed: history.count(RunStatus::Failed),
            },
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Tracking run id the study-level records are filed under.
    pub fn tracking_run_id(&self) -> String {
        format!("{}-study", self.experiment)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        tailtune_core::persistence::atomic_write_json(path, self)?;
        Ok(())
    }

    /// Send the best params, best value and the saved report file to tracking.
    pub fn relay(&self, reporter: &RunReporter, saved_at: &Path) {
        let run_id = self.tracking_run_id();
        if let Some(params) = &self.best_params {
            reporter.params(&run_id, params);
        }
        if let (Some(trial), Some(value)) = (self.best_trial, self.best_value) {
            reporter.metric(&run_id, "best_value", value, trial);
        }
        reporter.artifact(&run_id, saved_at);
    }
}

impl fmt::Display for StudyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Study {} ({}, {}, sampler={}, pruner={})",
            self.experiment, self.study_id, self.direction, self.sampler, self.pruner
        )?;
        writeln!(
            f,
            "{:>6}  {:<14} {:>10} {:>7}  detail",
            "trial", "status", "value", "epochs"
        )?;
        for t in &self.trials {
            let value = t.value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
            let detail = match &t.error {
                Some(error) => error.clone(),
                None => t
                    .params
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(" "),
            };
            writeln!(
                f,
                "{:>6}  {:<14} {:>10} {:>7}  {}",
                t.number,
                t.status.to_string(),
                value,
                t.epochs,
                detail
            )?;
        }
        writeln!(
            f,
            "completed={} early_stopped={} pruned={} failed={}",
            self.counts.completed, self.counts.early_stopped, self.counts.pruned, self.counts.failed
        )?;
        match (self.best_trial, self.best_value) {
            (Some(trial), Some(value)) => write!(f, "best: trial {trial} with {value:.4}"),
            _ => write!(f, "best: none (no trial completed)"),
        }
    }
}
