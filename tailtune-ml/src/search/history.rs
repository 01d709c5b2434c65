//! Append-only record of finished trials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::ParamMap;
use crate::training::config::Direction;
use crate::training::run::RunStatus;

/// One finished trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub number: usize,
    pub run_id: String,
    pub params: ParamMap,
    pub status: RunStatus,
    /// Best monitored value; for pruned trials the best intermediate value.
    pub value: Option<f64>,
    /// `(epoch, monitored value)` for every epoch the trial ran.
    pub intermediate: Vec<(usize, f64)>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrialRecord {
    pub fn value_at(&self, epoch: usize) -> Option<f64> {
        self.intermediate
            .iter()
            .find(|(e, _)| *e == epoch)
            .map(|(_, v)| *v)
    }

    /// Completed or early-stopped with a value.
    pub fn is_finished(&self) -> bool {
        self.status.has_objective() && self.value.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchHistory {
    trials: Vec<TrialRecord>,
}

impl SearchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: TrialRecord) {
        self.trials.push(record);
    }

    pub fn trials(&self) -> &[TrialRecord] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Trials that count as results: completed or early-stopped.
    pub fn finished(&self) -> impl Iterator<Item = &TrialRecord> {
        self.trials.iter().filter(|t| t.is_finished())
    }

    /// Best finished trial; ties go to the earlier trial.
    pub fn best(&self, direction: Direction) -> Option<&TrialRecord> {
        self.finished().reduce(|best, t| match (t.value, best.value) {
            (Some(v), Some(b)) if direction.improves(v, b, 0.0) => t,
            _ => best,
        })
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(number: usize, status: RunStatus, curve: &[f64]) -> TrialRecord {
        let intermediate: Vec<(usize, f64)> = curve.iter().copied().enumerate().collect();
        let value = match status {
            RunStatus::Failed => None,
            _ => curve.iter().copied().reduce(f64::max),
        };
        TrialRecord {
            number,
            run_id: format!("exp-trial-{number:04}"),
            params: ParamMap::new(),
            status,
            value,
            intermediate,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_best_ignores_pruned_and_failed() {
        let mut h = SearchHistory::new();
        h.append(record(0, RunStatus::Completed, &[0.3, 0.5]));
        h.append(record(1, RunStatus::Pruned, &[0.9]));
        h.append(record(2, RunStatus::Failed, &[]));
        h.append(record(3, RunStatus::EarlyStopped, &[0.6, 0.55]));

        assert_eq!(h.len(), 4);
        assert_eq!(h.finished().count(), 2);
        assert_eq!(h.best(Direction::Maximize).unwrap().number, 3);
        assert_eq!(h.best(Direction::Minimize).unwrap().number, 0);
        assert_eq!(h.count(RunStatus::Pruned), 1);
    }

    #[test]
    fn test_value_at() {
        let r = record(0, RunStatus::Completed, &[0.1, 0.2, 0.3]);
        assert_eq!(r.value_at(1), Some(0.2));
        assert_eq!(r.value_at(9), None);
    }
}
