//! Data collaborator: labelled feature vectors, batch sampling, and the
//! dataset sources a run config can name.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MlError, Result};

/// One labelled example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub features: Vec<f64>,
    pub label: usize,
}

/// How training batches are drawn each epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Every training sample once, in shuffled order.
    #[default]
    Shuffle,
    /// With replacement, each sample weighted by `1 / count(label)`.
    ClassBalanced,
}

/// Interface between the training loop and a dataset.
pub trait DataSource {
    fn num_classes(&self) -> usize;

    fn feature_dim(&self) -> usize;

    /// Training-set sample count per class.
    fn class_counts(&self) -> Vec<usize>;

    /// Batches for one training epoch. All randomness comes from `rng`.
    fn train_batches(
        &self,
        epoch: usize,
        batch_size: usize,
        sampling: SamplingMode,
        rng: &mut StdRng,
    ) -> Result<Vec<Vec<&Sample>>>;

    fn validation(&self) -> &[Sample];
}

/// A dataset held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    num_classes: usize,
    feature_dim: usize,
    train: Vec<Sample>,
    val: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(num_classes: usize, train: Vec<Sample>, val: Vec<Sample>) -> Result<Self> {
        if num_classes == 0 {
            return Err(MlError::config("dataset must have at least one class"));
        }
        let feature_dim = train
            .first()
            .map(|s| s.features.len())
            .ok_or_else(|| MlError::config("training split is empty"))?;
        if feature_dim == 0 {
            return Err(MlError::config("samples must have at least one feature"));
        }
        for (split, samples) in [("train", &train), ("validation", &val)] {
            for (i, s) in samples.iter().enumerate() {
                if s.features.len() != feature_dim {
                    return Err(MlError::config(format!(
                        "{split} sample {i} has {} features, expected {feature_dim}",
                        s.features.len()
                    )));
                }
                if s.label >= num_classes {
                    return Err(MlError::config(format!(
                        "{split} sample {i} has label {} but only {num_classes} classes",
                        s.label
                    )));
                }
            }
        }
        Ok(Self {
            num_classes,
            feature_dim,
            train,
            val,
        })
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }
}

impl DataSource for InMemoryDataset {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_classes];
        for s in &self.train {
            counts[s.label] += 1;
        }
        counts
    }

    fn train_batches(
        &self,
        epoch: usize,
        batch_size: usize,
        sampling: SamplingMode,
        rng: &mut StdRng,
    ) -> Result<Vec<Vec<&Sample>>> {
        if batch_size == 0 {
            return Err(MlError::config("batch_size must be > 0"));
        }
        let order: Vec<usize> = match sampling {
            SamplingMode::Shuffle => {
                let mut idx: Vec<usize> = (0..self.train.len()).collect();
                idx.shuffle(rng);
                idx
            }
            SamplingMode::ClassBalanced => {
                let counts = self.class_counts();
                let weights = self.train.iter().map(|s| 1.0 / counts[s.label] as f64);
                let dist = WeightedIndex::new(weights)
                    .map_err(|e| MlError::training(format!("balanced sampler: {e}")))?;
                (0..self.train.len()).map(|_| dist.sample(rng)).collect()
            }
        };
        tracing::trace!(epoch, samples = order.len(), ?sampling, "Drew training order");

        Ok(order
            .chunks(batch_size)
            .map(|chunk| chunk.iter().map(|&i| &self.train[i]).collect())
            .collect())
    }

    fn validation(&self) -> &[Sample] {
        &self.val
    }
}

/// Gaussian clusters with exponentially decaying class sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticLongTail {
    pub num_classes: usize,
    pub feature_dim: usize,
    /// Training samples of the largest class.
    pub head_samples: usize,
    /// Ratio between the largest and the smallest class.
    pub imbalance_ratio: f64,
    pub val_per_class: usize,
    /// Standard deviation of each cluster around its centre.
    pub noise: f64,
    pub seed: u64,
}

impl Default for SyntheticLongTail {
    fn default() -> Self {
        Self {
            num_classes: 10,
            feature_dim: 16,
            head_samples: 200,
            imbalance_ratio: 50.0,
            val_per_class: 20,
            noise: 1.0,
            seed: 0,
        }
    }
}

impl SyntheticLongTail {
    /// Training count for each class: `head * ratio^(-c / (C - 1))`, at least 1.
    pub fn class_sizes(&self) -> Vec<usize> {
        let c = self.num_classes;
        (0..c)
            .map(|k| {
                let frac = if c > 1 { k as f64 / (c - 1) as f64 } else { 0.0 };
                let n = self.head_samples as f64 * self.imbalance_ratio.powf(-frac);
                (n.round() as usize).max(1)
            })
            .collect()
    }

    pub fn generate(&self) -> Result<InMemoryDataset> {
        if self.num_classes == 0 || self.feature_dim == 0 || self.head_samples == 0 {
            return Err(MlError::config(
                "synthetic data needs num_classes, feature_dim and head_samples > 0",
            ));
        }
        if !(self.imbalance_ratio.is_finite() && self.imbalance_ratio >= 1.0) {
            return Err(MlError::config(format!(
                "imbalance_ratio must be >= 1, got {}",
                self.imbalance_ratio
            )));
        }
        if !(self.noise.is_finite() && self.noise >= 0.0) {
            return Err(MlError::config(format!("noise must be >= 0, got {}", self.noise)));
        }

        let centre_dist = Normal::new(0.0, 2.0).map_err(|e| MlError::config(e.to_string()))?;
        let noise_dist = Normal::new(0.0, self.noise).map_err(|e| MlError::config(e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let centres: Vec<Vec<f64>> = (0..self.num_classes)
            .map(|_| centre_dist.sample_iter(&mut rng).take(self.feature_dim).collect())
            .collect();

        let draw = |label: usize, rng: &mut StdRng| Sample {
            features: centres[label]
                .iter()
                .map(|c| c + noise_dist.sample(rng))
                .collect(),
            label,
        };

        let mut train = Vec::new();
        for (label, &n) in self.class_sizes().iter().enumerate() {
            for _ in 0..n {
                train.push(draw(label, &mut rng));
            }
        }
        let mut val = Vec::new();
        for label in 0..self.num_classes {
            for _ in 0..self.val_per_class {
                val.push(draw(label, &mut rng));
            }
        }
        InMemoryDataset::new(self.num_classes, train, val)
    }
}

/// The `[data]` section of a run or search config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataConfig {
    Synthetic(SyntheticLongTail),
    Jsonl {
        train: PathBuf,
        val: PathBuf,
        /// Inferred from the largest label when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_classes: Option<usize>,
    },
}

impl Default for DataConfig {
    fn default() -> Self {
        Self::Synthetic(SyntheticLongTail::default())
    }
}

impl DataConfig {
    /// The same source with relative JSONL paths joined onto `base_dir`, for
    /// writing into a config that lives somewhere else.
    pub fn rebased(&self, base_dir: &Path) -> Self {
        match self {
            Self::Synthetic(_) => self.clone(),
            Self::Jsonl {
                train,
                val,
                num_classes,
            } => Self::Jsonl {
                train: base_dir.join(train),
                val: base_dir.join(val),
                num_classes: *num_classes,
            },
        }
    }

    /// Materialize the dataset. Relative JSONL paths resolve against `base_dir`.
    pub fn load(&self, base_dir: &Path) -> Result<InMemoryDataset> {
        match self {
            Self::Synthetic(synthetic) => synthetic.generate(),
            Self::Jsonl {
                train,
                val,
                num_classes,
            } => {
                let train = read_jsonl(&base_dir.join(train))?;
                let val = read_jsonl(&base_dir.join(val))?;
                let inferred = train
                    .iter()
                    .chain(&val)
                    .map(|s| s.label + 1)
                    .max()
                    .unwrap_or(0);
                InMemoryDataset::new(num_classes.unwrap_or(inferred), train, val)
            }
        }
    }
}

/// Read one `{"features": [...], "label": n}` object per line.
pub fn read_jsonl(path: &Path) -> Result<Vec<Sample>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MlError::config(format!("cannot read data file {}: {e}", path.display()))
    })?;
    let mut samples = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let sample: Sample = serde_json::from_str(line).map_err(|e| {
            MlError::config(format!("{}:{}: {e}", path.display(), lineno + 1))
        })?;
        samples.push(sample);
    }
    tracing::debug!(path = %path.display(), samples = samples.len(), "Loaded JSONL samples");
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tiny() -> InMemoryDataset {
        let train = vec![
            Sample { features: vec![0.0, 1.0], label: 0 },
            Sample { features: vec![0.1, 0.9], label: 0 },
            Sample { features: vec![0.2, 0.8], label: 0 },
            Sample { features: vec![1.0, 0.0], label: 1 },
        ];
        let val = vec![Sample { features: vec![0.5, 0.5], label: 1 }];
        InMemoryDataset::new(2, train, val).unwrap()
    }

    #[test]
    fn test_counts_and_dims() {
        let ds = tiny();
        assert_eq!(ds.class_counts(), vec![3, 1]);
        assert_eq!(ds.feature_dim(), 2);
        assert_eq!(ds.validation().len(), 1);
    }

    #[test]
    fn test_rejects_bad_samples() {
        let bad_label = vec![Sample { features: vec![0.0], label: 3 }];
        assert!(InMemoryDataset::new(2, bad_label, vec![]).is_err());
        let ragged = vec![
            Sample { features: vec![0.0], label: 0 },
            Sample { features: vec![0.0, 1.0], label: 0 },
        ];
        assert!(InMemoryDataset::new(1, ragged, vec![]).is_err());
        assert!(InMemoryDataset::new(1, vec![], vec![]).is_err());
    }

    #[test]
    fn test_shuffle_covers_every_sample_once() {
        let ds = tiny();
        let mut rng = StdRng::seed_from_u64(3);
        let batches = ds.train_batches(0, 3, SamplingMode::Shuffle, &mut rng).unwrap();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 1]);
        let mut labels: Vec<usize> = batches.iter().flatten().map(|s| s.label).collect();
        labels.sort();
        assert_eq!(labels, vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_same_seed_same_batches() {
        let ds = SyntheticLongTail::default().generate().unwrap();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            ds.train_batches(0, 16, SamplingMode::ClassBalanced, &mut rng)
                .unwrap()
                .iter()
                .flatten()
                .map(|s| s.features.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(9), draw(9));
    }

    #[test]
    fn test_balanced_sampling_evens_out_classes() {
        let mut train: Vec<Sample> = (0..90)
            .map(|_| Sample { features: vec![0.0], label: 0 })
            .collect();
        train.extend((0..10).map(|_| Sample { features: vec![1.0], label: 1 }));
        let ds = InMemoryDataset::new(2, train, vec![]).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let mut minority = 0;
        let mut total = 0;
        for epoch in 0..50 {
            for batch in ds.train_batches(epoch, 25, SamplingMode::ClassBalanced, &mut rng).unwrap() {
                minority += batch.iter().filter(|s| s.label == 1).count();
                total += batch.len();
            }
        }
        let share = minority as f64 / total as f64;
        assert!((0.4..0.6).contains(&share), "minority share {share}");
    }

    #[test]
    fn test_synthetic_is_long_tailed_and_deterministic() {
        let cfg = SyntheticLongTail {
            num_classes: 5,
            head_samples: 100,
            imbalance_ratio: 100.0,
            ..Default::default()
        };
        assert_eq!(cfg.class_sizes(), vec![100, 32, 10, 3, 1]);
        let a = cfg.generate().unwrap();
        let b = cfg.generate().unwrap();
        assert_eq!(a.class_counts(), vec![100, 32, 10, 3, 1]);
        assert_eq!(a.validation(), b.validation());
    }

    #[test]
    fn test_jsonl_config_loads_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("train.jsonl"),
            "{\"features\": [0.0, 1.0], \"label\": 0}\n\n{\"features\": [1.0, 0.0], \"label\": 2}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("val.jsonl"),
            "{\"features\": [0.5, 0.5], \"label\": 1}\n",
        )
        .unwrap();

        let cfg: DataConfig = serde_json::from_str(
            r#"{"kind": "jsonl", "train": "train.jsonl", "val": "val.jsonl"}"#,
        )
        .unwrap();
        let ds = cfg.load(dir.path()).unwrap();
        assert_eq!(ds.num_classes(), 3);
        assert_eq!(ds.class_counts(), vec![1, 0, 1]);

        // Rebased onto the data directory, the config loads from anywhere.
        let moved = cfg.rebased(dir.path());
        let elsewhere = tempfile::tempdir().unwrap();
        assert_eq!(moved.load(elsewhere.path()).unwrap().class_counts(), vec![1, 0, 1]);
        assert_eq!(DataConfig::default().rebased(dir.path()), DataConfig::default());
    }

    #[test]
    fn test_jsonl_parse_error_names_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"features\": [0.0], \"label\": 0}\nnot json\n").unwrap();
        let err = read_jsonl(&path).unwrap_err().to_string();
        assert!(err.contains(":2:"), "{err}");
    }
}
