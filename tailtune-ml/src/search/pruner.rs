//! Trial pruning on intermediate values.
//!
//! At an epoch boundary, the running trial's best value so far is compared
//! with a percentile of the values that finished trials reported at the same
//! epoch. Falling on the wrong side of it prunes the trial.
//!
//! Successive halving instead judges trials only at rung epochs (after
//! `min_resource * reduction_factor^k` epochs) and keeps the best
//! `1 / reduction_factor` of every trial that reached the rung.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MlError, Result};
use crate::search::history::{SearchHistory, TrialRecord};
use crate::training::config::Direction;
use crate::training::metrics::percentile;
use crate::training::run::RunStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrunerKind {
    None,
    #[default]
    Median,
    Percentile,
    SuccessiveHalving,
}

impl fmt::Display for PrunerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Median => write!(f, "median"),
            Self::Percentile => write!(f, "percentile"),
            Self::SuccessiveHalving => write!(f, "successive_halving"),
        }
    }
}

/// `[study.pruner]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrunerConfig {
    #[serde(rename = "type")]
    pub kind: PrunerKind,
    /// Required for `percentile`; median is the 50th.
    pub percentile: Option<f64>,
    /// Finished trials needed before anything is pruned.
    pub n_startup_trials: usize,
    /// Epochs a trial always runs before it can be pruned.
    pub n_warmup_steps: usize,
    /// Finished trials that must have reported the epoch being judged.
    pub n_min_trials: usize,
    /// Epochs before the first successive-halving rung.
    pub min_resource: usize,
    /// Rung spacing and survivor fraction for successive halving.
    pub reduction_factor: usize,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            kind: PrunerKind::default(),
            percentile: None,
            n_startup_trials: 5,
            n_warmup_steps: 0,
            n_min_trials: 1,
            min_resource: 1,
            reduction_factor: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pruner {
    kind: PrunerKind,
    percentile: f64,
    n_startup_trials: usize,
    n_warmup_steps: usize,
    n_min_trials: usize,
    min_resource: usize,
    reduction_factor: usize,
    direction: Direction,
}

impl Pruner {
    pub fn from_config(config: &PrunerConfig, direction: Direction) -> Result<Self> {
        let percentile = match config.kind {
            PrunerKind::Percentile => config.percentile.ok_or_else(|| {
                MlError::config("percentile pruner requires 'percentile'")
            })?,
            _ => 50.0,
        };
        if !(percentile > 0.0 && percentile <= 100.0) {
            return Err(MlError::config(format!(
                "pruner percentile must be in (0, 100], got {percentile}"
            )));
        }
        if config.min_resource == 0 {
            return Err(MlError::config("pruner min_resource must be > 0"));
        }
        if config.reduction_factor < 2 {
            return Err(MlError::config(format!(
                "pruner reduction_factor must be >= 2, got {}",
                config.reduction_factor
            )));
        }
        Ok(Self {
            kind: config.kind,
            percentile,
            n_startup_trials: config.n_startup_trials,
            n_warmup_steps: config.n_warmup_steps,
            n_min_trials: config.n_min_trials.max(1),
            min_resource: config.min_resource,
            reduction_factor: config.reduction_factor,
            direction,
        })
    }

    pub fn disabled(direction: Direction) -> Self {
        Self {
            kind: PrunerKind::None,
            percentile: 50.0,
            n_startup_trials: 0,
            n_warmup_steps: 0,
            n_min_trials: 1,
            min_resource: 1,
            reduction_factor: 3,
            direction,
        }
    }

    pub fn kind(&self) -> PrunerKind {
        self.kind
    }

    /// The value a trial must reach at `epoch` to survive, if pruning is
    /// active there.
    pub fn threshold(&self, epoch: usize, history: &SearchHistory) -> Option<f64> {
        if self.kind == PrunerKind::None || epoch < self.n_warmup_steps {
            return None;
        }
        if history.finished().count() < self.n_startup_trials {
            return None;
        }
        match self.kind {
            PrunerKind::None => None,
            PrunerKind::Median | PrunerKind::Percentile => self.percentile_threshold(epoch, history),
            PrunerKind::SuccessiveHalving => self.rung_threshold(epoch, history),
        }
    }

    fn percentile_threshold(&self, epoch: usize, history: &SearchHistory) -> Option<f64> {
        let values: Vec<f64> = history
            .finished()
            .filter_map(|t| t.value_at(epoch))
            .filter(|v| !v.is_nan())
            .collect();
        if values.len() < self.n_min_trials {
            return None;
        }
        // For maximization the kept fraction sits at the top of the distribution.
        let q = match self.direction {
            Direction::Maximize => 100.0 - self.percentile,
            Direction::Minimize => self.percentile,
        };
        percentile(&values, q)
    }

    /// Cut-off at a rung: the worst value that still ranks among the top
    /// `1 / reduction_factor` once the judged trial joins the rung.
    fn rung_threshold(&self, epoch: usize, history: &SearchHistory) -> Option<f64> {
        if !self.is_rung(epoch) {
            return None;
        }
        let mut values: Vec<f64> = history
            .trials()
            .iter()
            .filter(|t| t.status != RunStatus::Failed && t.value_at(epoch).is_some())
            .filter_map(|t| self.best_until(t, epoch))
            .collect();
        if values.len() < self.n_min_trials {
            return None;
        }
        let keep = ((values.len() + 1) / self.reduction_factor).max(1);
        values.sort_by(|a, b| match self.direction {
            Direction::Maximize => b.total_cmp(a),
            Direction::Minimize => a.total_cmp(b),
        });
        values.get(keep - 1).copied()
    }

    /// Whether `epoch` (0-based) closes a rung.
    fn is_rung(&self, epoch: usize) -> bool {
        let completed = epoch + 1;
        let mut rung = self.min_resource;
        while rung < completed {
            match rung.checked_mul(self.reduction_factor) {
                Some(next) => rung = next,
                None => return false,
            }
        }
        rung == completed
    }

    fn best_until(&self, trial: &TrialRecord, epoch: usize) -> Option<f64> {
        trial
            .intermediate
            .iter()
            .filter(|(e, v)| *e <= epoch && !v.is_nan())
            .map(|(_, v)| *v)
            .reduce(|a, b| match self.direction {
                Direction::Maximize => a.max(b),
                Direction::Minimize => a.min(b),
            })
    }

    /// Whether a trial whose best value so far is `best_so_far` should stop
    /// at `epoch`.
    pub fn should_prune(&self, epoch: usize, best_so_far: f64, history: &SearchHistory) -> bool {
        let Some(threshold) = self.threshold(epoch, history) else {
            return false;
        };
        if best_so_far.is_nan() {
            return true;
        }
        match self.direction {
            Direction::Maximize => best_so_far < threshold,
            Direction::Minimize => best_so_far > threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::history::tests::record;
    use crate::training::run::RunStatus;

    fn history() -> SearchHistory {
        let mut h = SearchHistory::new();
        h.append(record(0, RunStatus::Completed, &[0.40, 0.50, 0.60]));
        h.append(record(1, RunStatus::Completed, &[0.30, 0.45, 0.55]));
        h.append(record(2, RunStatus::EarlyStopped, &[0.50, 0.70, 0.70]));
        h.append(record(3, RunStatus::Pruned, &[0.01]));
        h
    }

    fn median(n_startup: usize, warmup: usize) -> Pruner {
        let cfg = PrunerConfig {
            n_startup_trials: n_startup,
            n_warmup_steps: warmup,
            ..Default::default()
        };
        Pruner::from_config(&cfg, Direction::Maximize).unwrap()
    }

    #[test]
    fn test_median_rule() {
        let h = history();
        let p = median(2, 0);
        // Epoch 1 values: 0.50, 0.45, 0.70 -> median 0.50; the pruned trial is ignored.
        assert_eq!(p.threshold(1, &h), Some(0.50));
        assert!(p.should_prune(1, 0.40, &h));
        assert!(!p.should_prune(1, 0.50, &h));
        assert!(p.should_prune(1, f64::NAN, &h));
    }

    #[test]
    fn test_startup_and_warmup_gate_pruning() {
        let h = history();
        assert!(!median(4, 0).should_prune(1, 0.0, &h));
        assert!(!median(2, 2).should_prune(1, 0.0, &h));
        assert!(median(2, 2).should_prune(2, 0.0, &h));
    }

    #[test]
    fn test_min_trials_at_step() {
        let h = history();
        let cfg = PrunerConfig {
            n_startup_trials: 0,
            n_min_trials: 4,
            ..Default::default()
        };
        let p = Pruner::from_config(&cfg, Direction::Maximize).unwrap();
        assert_eq!(p.threshold(0, &h), None);
    }

    #[test]
    fn test_percentile_direction() {
        let h = history();
        let cfg = PrunerConfig {
            kind: PrunerKind::Percentile,
            percentile: Some(25.0),
            n_startup_trials: 0,
            ..Default::default()
        };
        // Maximize keeps the top 25%: threshold is the 75th percentile.
        let max = Pruner::from_config(&cfg, Direction::Maximize).unwrap();
        assert!((max.threshold(0, &h).unwrap() - 0.45).abs() < 1e-12);
        // Minimize keeps the bottom 25%.
        let min = Pruner::from_config(&cfg, Direction::Minimize).unwrap();
        assert!((min.threshold(0, &h).unwrap() - 0.35).abs() < 1e-12);
        assert!(min.should_prune(0, 0.4, &h));
    }

    fn halving(min_resource: usize) -> Pruner {
        let cfg = PrunerConfig {
            kind: PrunerKind::SuccessiveHalving,
            n_startup_trials: 0,
            min_resource,
            reduction_factor: 3,
            ..Default::default()
        };
        Pruner::from_config(&cfg, Direction::Maximize).unwrap()
    }

    #[test]
    fn test_successive_halving_rungs() {
        let p = halving(1);
        let rungs: Vec<usize> = (0..30).filter(|&e| p.is_rung(e)).collect();
        assert_eq!(rungs, vec![0, 2, 8, 26]);
        let late = halving(2);
        let rungs: Vec<usize> = (0..20).filter(|&e| late.is_rung(e)).collect();
        assert_eq!(rungs, vec![1, 5, 17]);
    }

    #[test]
    fn test_successive_halving_keeps_top_fraction() {
        let h = history();
        let p = halving(1);
        // Epoch 0: four trials reached the rung (the pruned one included); with
        // the judged trial that is five, so only the best survives.
        assert_eq!(p.threshold(0, &h), Some(0.50));
        assert!(p.should_prune(0, 0.45, &h));
        assert!(!p.should_prune(0, 0.50, &h));
        // Epoch 1 is not a rung.
        assert_eq!(p.threshold(1, &h), None);
        assert!(!p.should_prune(1, 0.0, &h));
        // Epoch 2 compares best-so-far values of the three trials that got there.
        assert_eq!(p.threshold(2, &h), Some(0.70));
    }

    #[test]
    fn test_config_validation() {
        let flat = PrunerConfig {
            kind: PrunerKind::SuccessiveHalving,
            reduction_factor: 1,
            ..Default::default()
        };
        assert!(Pruner::from_config(&flat, Direction::Maximize).is_err());
        let missing = PrunerConfig {
            kind: PrunerKind::Percentile,
            ..Default::default()
        };
        assert!(Pruner::from_config(&missing, Direction::Maximize).is_err());
        let none = PrunerConfig {
            kind: PrunerKind::None,
            n_startup_trials: 0,
            ..Default::default()
        };
        let p = Pruner::from_config(&none, Direction::Maximize).unwrap();
        assert!(!p.should_prune(0, -1.0, &history()));
    }
}
