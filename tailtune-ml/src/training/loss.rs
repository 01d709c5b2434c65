//! Loss evaluation: modulated cross-entropy and focal loss.
//!
//! Both variants take raw logits and integer targets and average over the
//! batch. The trainer additionally needs `dL/dlogits`, which
//! [`LossFunction::evaluate_with_grad`] returns alongside the scalar.

use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::params::{ParamMap, ParamMapExt};
use crate::training::class_weights::{ClassWeightSchedule, ModulationType};

/// Scalar loss plus per-sample gradients w.r.t. the logits (already divided
/// by the batch size).
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f64,
    pub grad_logits: Vec<Vec<f64>>,
}

/// Closed set of supported losses, selected when the run config is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossFunction {
    ModulatedCrossEntropy { schedule: ClassWeightSchedule },
    Focal { gamma: f64, alpha: f64 },
}

impl LossFunction {
    /// Build the loss named by `params["loss"]` (default: modulated
    /// cross-entropy). Required parameters must be present.
    pub fn from_params(params: &ParamMap, max_epoch: usize) -> Result<Self> {
        let name = match params.text("loss")? {
            Some(name) => name,
            None => params.text("loss_fn")?.unwrap_or("modulated_ce"),
        };
        match name {
            "modulated_ce" | "smooth_modulation" => {
                let tau = params
                    .float("tau")?
                    .ok_or_else(|| MlError::config("modulated cross-entropy requires 'tau'"))?;
                let modulation = match params.text("modulation_type")? {
                    Some(m) => m.parse::<ModulationType>()?,
                    None => ModulationType::default(),
                };
                Ok(Self::ModulatedCrossEntropy {
                    schedule: ClassWeightSchedule::new(tau, max_epoch, modulation)?,
                })
            }
            "focal" => {
                let gamma = params
                    .float("focal_gamma")?
                    .ok_or_else(|| MlError::config("focal loss requires 'focal_gamma'"))?;
                let alpha = params
                    .float("focal_alpha")?
                    .ok_or_else(|| MlError::config("focal loss requires 'focal_alpha'"))?;
                if !(gamma.is_finite() && gamma >= 0.0) {
                    return Err(MlError::config(format!("focal_gamma must be >= 0, got {gamma}")));
                }
                if !(alpha.is_finite() && alpha > 0.0) {
                    return Err(MlError::config(format!("focal_alpha must be > 0, got {alpha}")));
                }
                Ok(Self::Focal { gamma, alpha })
            }
            other => Err(MlError::config(format!(
                "unknown loss '{other}' (expected modulated_ce or focal)"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ModulatedCrossEntropy { .. } => "modulated_ce",
            Self::Focal { .. } => "focal",
        }
    }

    /// Class weights in effect for `epoch`; `None` for losses that do not
    /// reweight classes.
    pub fn epoch_weights(&self, class_counts: &[usize], epoch: usize) -> Result<Option<Vec<f64>>> {
        match self {
            Self::ModulatedCrossEntropy { schedule } => {
                schedule.weights(class_counts, epoch).map(Some)
            }
            Self::Focal { .. } => Ok(None),
        }
    }

    /// Scalar batch loss at `epoch`.
    pub fn evaluate(
        &self,
        logits: &[Vec<f64>],
        targets: &[usize],
        epoch: usize,
        class_counts: &[usize],
    ) -> Result<f64> {
        let weights = self.epoch_weights(class_counts, epoch)?;
        Ok(self.evaluate_with_grad(logits, targets, weights.as_deref())?.loss)
    }

    /// Batch loss and gradient, given precomputed class weights.
    ///
    /// `weights = None` means uniform weighting for the modulated variant.
    pub fn evaluate_with_grad(
        &self,
        logits: &[Vec<f64>],
        targets: &[usize],
        weights: Option<&[f64]>,
    ) -> Result<LossOutput> {
        let num_classes = validate_batch(logits, targets)?;
        if let Some(w) = weights {
            if w.len() != num_classes {
                return Err(MlError::config(format!(
                    "{} class weights for {num_classes} classes",
                    w.len()
                )));
            }
        }

        let batch = logits.len() as f64;
        let mut total = 0.0;
        let mut grad_logits = Vec::with_capacity(logits.len());

        for (row, &target) in logits.iter().zip(targets) {
            let probs = softmax(row);
            let ce = -(probs[target].max(f64::MIN_POSITIVE)).ln();

            // Per-sample loss and the scale applied to (p - onehot).
            let (sample_loss, scale) = match self {
                Self::ModulatedCrossEntropy { .. } => {
                    let w = weights.map_or(1.0, |w| w[target]);
                    (w * ce, w)
                }
                Self::Focal { gamma, alpha } => {
                    let pt = probs[target];
                    let one_minus = (1.0 - pt).max(0.0);
                    let modulating = one_minus.powf(*gamma);
                    let slope = if one_minus > 0.0 {
                        gamma * pt * ce * one_minus.powf(gamma - 1.0)
                    } else {
                        0.0
                    };
                    (alpha * modulating * ce, alpha * (modulating + slope))
                }
            };
            total += sample_loss;

            let grad: Vec<f64> = probs
                .iter()
                .enumerate()
                .map(|(j, &p)| {
                    let onehot = if j == target { 1.0 } else { 0.0 };
                    scale * (p - onehot) / batch
                })
                .collect();
            grad_logits.push(grad);
        }

        Ok(LossOutput {
            loss: total / batch,
            grad_logits,
        })
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|z| (z - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn validate_batch(logits: &[Vec<f64>], targets: &[usize]) -> Result<usize> {
    if logits.is_empty() {
        return Err(MlError::config("empty batch"));
    }
    if logits.len() != targets.len() {
        return Err(MlError::config(format!(
            "{} logit rows for {} targets",
            logits.len(),
            targets.len()
        )));
    }
    let num_classes = logits[0].len();
    if num_classes == 0 || logits.iter().any(|row| row.len() != num_classes) {
        return Err(MlError::config("logit rows must share a non-zero width"));
    }
    if let Some(&bad) = targets.iter().find(|&&t| t >= num_classes) {
        return Err(MlError::config(format!(
            "target {bad} out of range for {num_classes} classes"
        )));
    }
    Ok(num_classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, crate::params::ParamValue)]) -> ParamMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn plain_ce(row: &[f64], target: usize) -> f64 {
        -softmax(row)[target].ln()
    }

    #[test]
    fn test_missing_required_params() {
        let modulated = params(&[("loss", "modulated_ce".into())]);
        assert!(matches!(
            LossFunction::from_params(&modulated, 10),
            Err(MlError::Configuration(_))
        ));

        let focal = params(&[("loss", "focal".into()), ("focal_gamma", 2.0.into())]);
        assert!(matches!(
            LossFunction::from_params(&focal, 10),
            Err(MlError::Configuration(_))
        ));

        let unknown = params(&[("loss", "hinge".into())]);
        assert!(LossFunction::from_params(&unknown, 10).is_err());
    }

    #[test]
    fn test_smooth_modulation_alias_and_default_modulation() {
        let p = params(&[("loss_fn", "smooth_modulation".into()), ("tau", 0.5.into())]);
        let loss = LossFunction::from_params(&p, 10).unwrap();
        match loss {
            LossFunction::ModulatedCrossEntropy { schedule } => {
                assert_eq!(schedule.modulation, ModulationType::Cosine);
                assert_eq!(schedule.max_epoch, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_uniform_weights_equal_plain_cross_entropy() {
        let logits = vec![vec![2.0, 0.5, -1.0], vec![0.1, 0.2, 0.3]];
        let targets = [0, 2];
        let p = params(&[("loss", "modulated_ce".into()), ("tau", 0.5.into())]);
        let loss = LossFunction::from_params(&p, 10).unwrap();

        // Epoch 0 of a cosine schedule is fully balanced.
        let value = loss.evaluate(&logits, &targets, 0, &[100, 10, 1]).unwrap();
        let expected = (plain_ce(&logits[0], 0) + plain_ce(&logits[1], 2)) / 2.0;
        assert!((value - expected).abs() < 1e-12);
    }

    #[test]
    fn test_tail_samples_weigh_more_late_in_training() {
        let logits = vec![vec![0.0, 0.0, 0.0]];
        let p = params(&[
            ("loss", "modulated_ce".into()),
            ("tau", 1.0.into()),
            ("modulation_type", "linear".into()),
        ]);
        let loss = LossFunction::from_params(&p, 10).unwrap();
        let head = loss.evaluate(&logits, &[0], 10, &[100, 10, 1]).unwrap();
        let tail = loss.evaluate(&logits, &[2], 10, &[100, 10, 1]).unwrap();
        assert!(tail > head * 50.0);
    }

    #[test]
    fn test_focal_gamma_zero_is_scaled_cross_entropy() {
        let logits = vec![vec![1.0, -0.5, 0.25]];
        let focal = LossFunction::Focal { gamma: 0.0, alpha: 0.25 };
        let value = focal.evaluate(&logits, &[1], 3, &[5, 5, 5]).unwrap();
        assert!((value - 0.25 * plain_ce(&logits[0], 1)).abs() < 1e-12);
    }

    #[test]
    fn test_focal_downweights_confident_samples() {
        let confident = vec![vec![6.0, 0.0]];
        let focal = LossFunction::Focal { gamma: 2.0, alpha: 1.0 };
        let ce = plain_ce(&confident[0], 0);
        let fl = focal.evaluate(&confident, &[0], 0, &[1, 1]).unwrap();
        assert!(fl < ce * 0.01);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let logits = vec![vec![0.3, -1.2, 0.8], vec![-0.4, 0.9, 0.1]];
        let targets = [2, 0];
        let weights = [0.5, 1.0, 1.5];
        let cases = [
            LossFunction::ModulatedCrossEntropy {
                schedule: ClassWeightSchedule::new(0.5, 10, ModulationType::Linear).unwrap(),
            },
            LossFunction::Focal { gamma: 2.0, alpha: 0.75 },
        ];

        for loss in cases {
            let out = loss.evaluate_with_grad(&logits, &targets, Some(&weights)).unwrap();
            let h = 1e-6;
            for i in 0..logits.len() {
                for j in 0..3 {
                    let mut plus = logits.clone();
                    plus[i][j] += h;
                    let mut minus = logits.clone();
                    minus[i][j] -= h;
                    let numeric = (loss.evaluate_with_grad(&plus, &targets, Some(&weights)).unwrap().loss
                        - loss.evaluate_with_grad(&minus, &targets, Some(&weights)).unwrap().loss)
                        / (2.0 * h);
                    assert!(
                        (numeric - out.grad_logits[i][j]).abs() < 1e-6,
                        "{}: d/dz[{i}][{j}] numeric {numeric} analytic {}",
                        loss.name(),
                        out.grad_logits[i][j]
                    );
                }
            }
        }
    }

    #[test]
    fn test_shape_errors() {
        let focal = LossFunction::Focal { gamma: 1.0, alpha: 1.0 };
        assert!(focal.evaluate_with_grad(&[], &[], None).is_err());
        assert!(focal.evaluate_with_grad(&[vec![0.0, 1.0]], &[2], None).is_err());
        assert!(focal
            .evaluate_with_grad(&[vec![0.0, 1.0], vec![0.0]], &[0, 0], None)
            .is_err());
        assert!(focal
            .evaluate_with_grad(&[vec![0.0, 1.0]], &[0], Some(&[1.0]))
            .is_err());
    }

    #[test]
    fn test_softmax_is_stable() {
        let p = softmax(&[1000.0, 1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-12);
    }
}
