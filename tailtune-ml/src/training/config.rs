//! Typed training configuration extracted from a flat hyperparameter map.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::data::{DataConfig, SamplingMode};
use crate::error::{MlError, Result};
use crate::model::Backbone;
use crate::params::{ParamMap, ParamMapExt};
use crate::training::loss::LossFunction;

/// Whether larger or smaller metric values are better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

impl Direction {
    /// True when `candidate` beats `reference` by more than `min_delta`.
    pub fn improves(&self, candidate: f64, reference: f64, min_delta: f64) -> bool {
        match self {
            Self::Maximize => candidate > reference + min_delta,
            Self::Minimize => candidate < reference - min_delta,
        }
    }

    /// The better of two values; NaN loses to anything.
    pub fn better(&self, a: f64, b: f64) -> f64 {
        if a.is_nan() {
            return b;
        }
        if b.is_nan() {
            return a;
        }
        match self {
            Self::Maximize => a.max(b),
            Self::Minimize => a.min(b),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Maximize => write!(f, "maximize"),
            Self::Minimize => write!(f, "minimize"),
        }
    }
}

/// Validation metric that drives early stopping, the `best` slot and the
/// trial objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMetric {
    #[default]
    ValAccuracy,
    MacroF1,
    TailAccuracy,
    ValLoss,
}

impl MonitorMetric {
    pub fn direction(&self) -> Direction {
        match self {
            Self::ValLoss => Direction::Minimize,
            _ => Direction::Maximize,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ValAccuracy => "val_accuracy",
            Self::MacroF1 => "macro_f1",
            Self::TailAccuracy => "tail_accuracy",
            Self::ValLoss => "val_loss",
        }
    }
}

impl FromStr for MonitorMetric {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "val_accuracy" | "val_acc" => Ok(Self::ValAccuracy),
            "macro_f1" => Ok(Self::MacroF1),
            "tail_accuracy" => Ok(Self::TailAccuracy),
            "val_loss" => Ok(Self::ValLoss),
            other => Err(MlError::config(format!(
                "unknown monitor metric '{other}' (expected val_accuracy, macro_f1, tail_accuracy or val_loss)"
            ))),
        }
    }
}

/// Immutable configuration of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub weight_decay: f64,
    pub backbone: Backbone,
    pub loss: LossFunction,
    pub patience: usize,
    pub min_delta: f64,
    pub monitor: MonitorMetric,
    pub sampling: SamplingMode,
    pub seed: u64,
    /// Percentile of training class counts at or above which a class is "head".
    pub head_percentile: f64,
    /// The hyperparameter map this config was built from.
    pub params: ParamMap,
}

impl TrainingConfig {
    /// Build and validate a config. Unknown keys are kept in `params` (and
    /// therefore in the hash) but otherwise ignored.
    pub fn from_params(params: ParamMap) -> Result<Self> {
        let epochs = params.usize_or("epochs", 50)?;
        if epochs == 0 {
            return Err(MlError::config("epochs must be > 0"));
        }
        let batch_size = params.usize_or("batch_size", 32)?;
        if batch_size == 0 {
            return Err(MlError::config("batch_size must be > 0"));
        }
        let lr = params.float_or("lr", 1e-4)?;
        if !(lr.is_finite() && lr > 0.0) {
            return Err(MlError::config(format!("lr must be > 0, got {lr}")));
        }
        let weight_decay = params.float_or("weight_decay", 1e-4)?;
        if !(weight_decay.is_finite() && weight_decay >= 0.0) {
            return Err(MlError::config(format!(
                "weight_decay must be >= 0, got {weight_decay}"
            )));
        }
        let min_delta = params.float_or("min_delta", 0.0)?;
        if !(min_delta.is_finite() && min_delta >= 0.0) {
            return Err(MlError::config(format!("min_delta must be >= 0, got {min_delta}")));
        }
        let head_percentile = params.float_or("head_percentile", 50.0)?;
        if !(0.0..=100.0).contains(&head_percentile) {
            return Err(MlError::config(format!(
                "head_percentile must be in [0, 100], got {head_percentile}"
            )));
        }
        let monitor = match params.text("monitor")? {
            Some(name) => name.parse()?,
            None => MonitorMetric::default(),
        };
        let balanced = match params.flag("balanced_sampling")? {
            Some(flag) => flag,
            None => params.flag("use_weighted_sampler")?.unwrap_or(false),
        };
        let seed = params.int("seed")?.unwrap_or(42);
        if seed < 0 {
            return Err(MlError::config(format!("seed must be >= 0, got {seed}")));
        }

        Ok(Self {
            epochs,
            batch_size,
            lr,
            weight_decay,
            backbone: Backbone::from_params(&params)?,
            loss: LossFunction::from_params(&params, epochs)?,
            patience: params.usize_or("patience", 10)?,
            min_delta,
            monitor,
            sampling: if balanced {
                SamplingMode::ClassBalanced
            } else {
                SamplingMode::Shuffle
            },
            seed: seed as u64,
            head_percentile,
            params,
        })
    }

    /// SHA-256 of the canonical JSON form of the hyperparameter map.
    pub fn config_hash(&self) -> String {
        config_hash(&self.params)
    }
}

/// SHA-256 of the canonical JSON form of `params` (keys sorted by the map).
pub fn config_hash(params: &ParamMap) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Standalone run document (`run-training --run-config`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Defaults to `<experiment>-run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub params: ParamMap,
    #[serde(default)]
    pub data: DataConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(tailtune_core::load_document(path)?)
    }

    pub fn run_id(&self, experiment: &str) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| format!("{experiment}-run"))
    }

    pub fn training_config(&self) -> Result<TrainingConfig> {
        TrainingConfig::from_params(self.params.clone())
    }

    /// Write as TOML, readable by [`RunConfig::load`].
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| MlError::config(format!("cannot write run config as TOML: {e}")))?;
        tailtune_core::persistence::atomic_write(path, text.as_bytes())?;
        Ok(())
    }
}
