//! The classifier interface the trainer drives, plus a small dense
//! reference implementation.
//!
//! The trainer never looks inside a model: it asks for logits, hands back
//! `dL/dlogits`, lets the optimizer update the flat parameter buffer, and
//! round-trips the state through [`Classifier::state_dict`] for checkpoints.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::params::{ParamMap, ParamMapExt};

/// Interface between the training loop and a model.
pub trait Classifier {
    fn num_classes(&self) -> usize;

    /// Logits for one sample.
    fn forward(&self, input: &[f64]) -> Vec<f64>;

    /// Accumulate parameter gradients for one sample, given `dL/dlogits`.
    fn backward(&mut self, input: &[f64], grad_logits: &[f64]);

    fn zero_grad(&mut self);

    /// Flat parameter buffer and the matching accumulated gradients.
    fn params_and_grads(&mut self) -> (&mut [f64], &[f64]);

    fn state_dict(&self) -> serde_json::Value;

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()>;
}

/// Architecture choice for the reference classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backbone {
    /// Softmax regression.
    Linear,
    /// One ReLU hidden layer.
    Mlp { hidden_units: usize },
}

impl Backbone {
    pub fn from_params(params: &ParamMap) -> Result<Self> {
        match params.text("backbone")?.unwrap_or("linear") {
            "linear" => Ok(Self::Linear),
            "mlp" => {
                let hidden_units = params.usize_or("hidden_units", 32)?;
                if hidden_units == 0 {
                    return Err(MlError::config("hidden_units must be > 0"));
                }
                Ok(Self::Mlp { hidden_units })
            }
            other => Err(MlError::config(format!(
                "unknown backbone '{other}' (expected linear or mlp)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LayerShape {
    fan_in: usize,
    fan_out: usize,
    weights: usize,
    biases: usize,
}

/// Fully connected classifier over dense feature vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseClassifier {
    input_dim: usize,
    num_classes: usize,
    backbone: Backbone,
    params: Vec<f64>,
    #[serde(skip)]
    grads: Vec<f64>,
}

impl DenseClassifier {
    /// Xavier-uniform weights and zero biases, drawn from `seed`.
    pub fn new(input_dim: usize, num_classes: usize, backbone: Backbone, seed: u64) -> Self {
        let mut model = Self {
            input_dim,
            num_classes,
            backbone,
            params: Vec::new(),
            grads: Vec::new(),
        };
        let shapes = model.layer_shapes();
        let total = shapes.last().map_or(0, |s| s.biases + s.fan_out);
        model.params = vec![0.0; total];
        model.grads = vec![0.0; total];

        let mut rng = StdRng::seed_from_u64(seed);
        for shape in &shapes {
            let bound = (6.0 / (shape.fan_in + shape.fan_out) as f64).sqrt();
            for w in &mut model.params[shape.weights..shape.biases] {
                *w = rng.gen_range(-bound..bound);
            }
        }
        model
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    fn layer_shapes(&self) -> Vec<LayerShape> {
        let dims = match self.backbone {
            Backbone::Linear => vec![self.input_dim, self.num_classes],
            Backbone::Mlp { hidden_units } => {
                vec![self.input_dim, hidden_units, self.num_classes]
            }
        };
        let mut offset = 0;
        dims.windows(2)
            .map(|pair| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let shape = LayerShape {
                    fan_in,
                    fan_out,
                    weights: offset,
                    biases: offset + fan_in * fan_out,
                };
                offset = shape.biases + fan_out;
                shape
            })
            .collect()
    }

    /// Pre-activations of every layer; the last entry is the logits.
    fn pre_activations(&self, input: &[f64]) -> Vec<Vec<f64>> {
        let shapes = self.layer_shapes();
        let mut outputs: Vec<Vec<f64>> = Vec::with_capacity(shapes.len());
        for (l, shape) in shapes.iter().enumerate() {
            let activation: Vec<f64> = if l == 0 {
                input.to_vec()
            } else {
                outputs[l - 1].iter().map(|z| z.max(0.0)).collect()
            };
            let z = (0..shape.fan_out)
                .map(|o| {
                    let row = &self.params[shape.weights + o * shape.fan_in..][..shape.fan_in];
                    self.params[shape.biases + o]
                        + row.iter().zip(&activation).map(|(w, a)| w * a).sum::<f64>()
                })
                .collect();
            outputs.push(z);
        }
        outputs
    }
}

impl Classifier for DenseClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.pre_activations(input).pop().unwrap_or_default()
    }

    fn backward(&mut self, input: &[f64], grad_logits: &[f64]) {
        if self.grads.len() != self.params.len() {
            self.grads = vec![0.0; self.params.len()];
        }
        let shapes = self.layer_shapes();
        let pre = self.pre_activations(input);
        let mut delta = grad_logits.to_vec();

        for l in (0..shapes.len()).rev() {
            let shape = shapes[l];
            let activation: Vec<f64> = if l == 0 {
                input.to_vec()
            } else {
                pre[l - 1].iter().map(|z| z.max(0.0)).collect()
            };

            for (o, d) in delta.iter().enumerate() {
                let row = shape.weights + o * shape.fan_in;
                for (i, a) in activation.iter().enumerate() {
                    self.grads[row + i] += d * a;
                }
                self.grads[shape.biases + o] += d;
            }

            if l > 0 {
                delta = (0..shape.fan_in)
                    .map(|i| {
                        if pre[l - 1][i] <= 0.0 {
                            return 0.0;
                        }
                        delta
                            .iter()
                            .enumerate()
                            .map(|(o, d)| self.params[shape.weights + o * shape.fan_in + i] * d)
                            .sum()
                    })
                    .collect();
            }
        }
    }

    fn zero_grad(&mut self) {
        self.grads.clear();
        self.grads.resize(self.params.len(), 0.0);
    }

    fn params_and_grads(&mut self) -> (&mut [f64], &[f64]) {
        if self.grads.len() != self.params.len() {
            self.grads = vec![0.0; self.params.len()];
        }
        (&mut self.params, &self.grads)
    }

    fn state_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()> {
        let loaded: DenseClassifier = serde_json::from_value(state.clone())?;
        if loaded.input_dim != self.input_dim
            || loaded.num_classes != self.num_classes
            || loaded.backbone != self.backbone
            || loaded.params.len() != self.params.len()
        {
            return Err(MlError::training(format!(
                "model state has shape {}x{} ({:?}), expected {}x{} ({:?})",
                loaded.input_dim,
                loaded.num_classes,
                loaded.backbone,
                self.input_dim,
                self.num_classes,
                self.backbone
            )));
        }
        self.params = loaded.params;
        self.zero_grad();
        Ok(())
    }
}
