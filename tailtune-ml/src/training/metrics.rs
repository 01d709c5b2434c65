//! Per-epoch validation metrics and the epoch summary.

use serde::{Deserialize, Serialize};

use crate::training::config::MonitorMetric;

/// Metrics computed on the validation split after an epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub macro_f1: f64,
    /// `None` when the split has no head-class samples.
    pub head_accuracy: Option<f64>,
    /// `None` when the split has no tail-class samples.
    pub tail_accuracy: Option<f64>,
}

impl ValidationMetrics {
    pub fn compute(
        predictions: &[usize],
        targets: &[usize],
        val_loss: f64,
        head_mask: &[bool],
        tail_mask: &[bool],
    ) -> Self {
        let num_classes = head_mask.len();
        Self {
            val_loss,
            val_accuracy: accuracy(predictions, targets),
            macro_f1: macro_f1(predictions, targets, num_classes),
            head_accuracy: subset_accuracy(predictions, targets, head_mask),
            tail_accuracy: subset_accuracy(predictions, targets, tail_mask),
        }
    }

    /// Value of the monitored metric. A missing tail accuracy reads as 0.
    pub fn get(&self, metric: MonitorMetric) -> f64 {
        match metric {
            MonitorMetric::ValAccuracy => self.val_accuracy,
            MonitorMetric::MacroF1 => self.macro_f1,
            MonitorMetric::TailAccuracy => self.tail_accuracy.unwrap_or(0.0),
            MonitorMetric::ValLoss => self.val_loss,
        }
    }
}

/// Everything reported for one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub validation: ValidationMetrics,
    pub lr: f64,
    /// Class weights used this epoch, when the loss reweights classes.
    pub class_weights: Option<Vec<f64>>,
    /// Value of the monitored metric.
    pub monitored: f64,
}

impl EpochSummary {
    /// Flat `(name, value)` pairs for the tracking store.
    pub fn metric_pairs(&self) -> Vec<(String, f64)> {
        let v = &self.validation;
        let mut pairs = vec![
            ("train_loss".to_string(), self.train_loss),
            ("train_accuracy".to_string(), self.train_accuracy),
            ("val_loss".to_string(), v.val_loss),
            ("val_accuracy".to_string(), v.val_accuracy),
            ("macro_f1".to_string(), v.macro_f1),
            ("lr".to_string(), self.lr),
        ];
        if let Some(head) = v.head_accuracy {
            pairs.push(("head_accuracy".to_string(), head));
        }
        if let Some(tail) = v.tail_accuracy {
            pairs.push(("tail_accuracy".to_string(), tail));
        }
        if let Some(weights) = &self.class_weights {
            for (c, w) in weights.iter().enumerate() {
                pairs.push((format!("class_weight_{c}"), *w));
            }
        }
        pairs
    }
}

pub fn accuracy(predictions: &[usize], targets: &[usize]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(targets)
        .filter(|(p, t)| p == t)
        .count();
    correct as f64 / targets.len() as f64
}

/// Unweighted mean of per-class F1 over the classes present in either
/// `targets` or `predictions`.
pub fn macro_f1(predictions: &[usize], targets: &[usize], num_classes: usize) -> f64 {
    let mut tp = vec![0usize; num_classes];
    let mut fp = vec![0usize; num_classes];
    let mut fn_ = vec![0usize; num_classes];
    for (&p, &t) in predictions.iter().zip(targets) {
        if p >= num_classes || t >= num_classes {
            continue;
        }
        if p == t {
            tp[t] += 1;
        } else {
            fp[p] += 1;
            fn_[t] += 1;
        }
    }

    let scores: Vec<f64> = (0..num_classes)
        .filter(|&c| tp[c] + fp[c] + fn_[c] > 0)
        .map(|c| {
            let denom = 2 * tp[c] + fp[c] + fn_[c];
            2.0 * tp[c] as f64 / denom as f64
        })
        .collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

fn subset_accuracy(predictions: &[usize], targets: &[usize], mask: &[bool]) -> Option<f64> {
    let (correct, total) = predictions
        .iter()
        .zip(targets)
        .filter(|(_, t)| mask.get(**t).copied().unwrap_or(false))
        .fold((0usize, 0usize), |(c, n), (p, t)| (c + usize::from(p == t), n + 1));
    (total > 0).then(|| correct as f64 / total as f64)
}

/// Linear-interpolated percentile (`q` in `[0, 100]`) of `values`.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Head and tail class masks from training counts.
///
/// Head classes have a count at or above the `head_percentile` of all
/// counts; tail classes are the remaining classes that have samples.
pub fn head_tail_masks(class_counts: &[usize], head_percentile: f64) -> (Vec<bool>, Vec<bool>) {
    let counts: Vec<f64> = class_counts.iter().map(|&n| n as f64).collect();
    let threshold = percentile(&counts, head_percentile).unwrap_or(0.0);
    let head: Vec<bool> = counts.iter().map(|&n| n >= threshold && n > 0.0).collect();
    let tail = counts
        .iter()
        .zip(&head)
        .map(|(&n, &is_head)| !is_head && n > 0.0)
        .collect();
    (head, tail)
}
