//! Epoch-dependent class reweighting for long-tail training.
//!
//! Each class gets a rarity term `(1 / n_c)^tau`. A modulation factor
//! `m(epoch)` in `[0, 1]` blends every weight from `1.0` (balanced) towards
//! its rarity term (tail-emphasized) as training progresses, and the vector is
//! rescaled to mean 1 so the overall loss magnitude stays put.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::error::{MlError, Result};

/// How the modulation factor grows over training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationType {
    Linear,
    #[default]
    Cosine,
    Step,
}

impl fmt::Display for ModulationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Cosine => write!(f, "cosine"),
            Self::Step => write!(f, "step"),
        }
    }
}

impl FromStr for ModulationType {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            "step" => Ok(Self::Step),
            other => Err(MlError::config(format!(
                "unknown modulation_type '{other}' (expected linear, cosine or step)"
            ))),
        }
    }
}

/// Parameters of the class-weight curriculum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeightSchedule {
    pub tau: f64,
    pub max_epoch: usize,
    pub modulation: ModulationType,
}

impl ClassWeightSchedule {
    pub fn new(tau: f64, max_epoch: usize, modulation: ModulationType) -> Result<Self> {
        if !tau.is_finite() || !(0.0..=1.0).contains(&tau) {
            return Err(MlError::config(format!("tau must be in [0, 1], got {tau}")));
        }
        Ok(Self {
            tau,
            max_epoch,
            modulation,
        })
    }

    /// Modulation factor for a 0-based epoch.
    pub fn modulation_at(&self, epoch: usize) -> f64 {
        if self.max_epoch == 0 {
            return 1.0;
        }
        let t = (epoch as f64 / self.max_epoch as f64).min(1.0);
        match self.modulation {
            ModulationType::Linear => t,
            ModulationType::Cosine => 0.5 * (1.0 - (PI * t).cos()),
            ModulationType::Step => {
                if t < 0.5 {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }

    /// Per-class weights for `epoch`, normalized to mean 1.
    ///
    /// Counts of zero are clamped to one in the denominator; such a class has
    /// no samples and so never contributes to the loss.
    pub fn weights(&self, class_counts: &[usize], epoch: usize) -> Result<Vec<f64>> {
        if class_counts.is_empty() {
            return Err(MlError::config("class_counts must not be empty"));
        }
        let m = self.modulation_at(epoch);
        let raw: Vec<f64> = class_counts
            .iter()
            .map(|&n| {
                let base = (1.0 / n.max(1) as f64).powf(self.tau);
                1.0 + m * (base - 1.0)
            })
            .collect();

        let mean = raw.iter().sum::<f64>() / raw.len() as f64;
        // Every raw weight lies in (0, 1], so the mean is strictly positive.
        Ok(raw.into_iter().map(|w| w / mean).collect())
    }

    /// Weight of a single class for `epoch`.
    pub fn weight(&self, class_counts: &[usize], class_index: usize, epoch: usize) -> Result<f64> {
        let weights = self.weights(class_counts, epoch)?;
        weights.get(class_index).copied().ok_or_else(|| {
            MlError::config(format!(
                "class index {class_index} out of range for {} classes",
                weights.len()
            ))
        })
    }
}
