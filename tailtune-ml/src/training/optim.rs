//! AdamW and cosine-annealed learning rate, both serializable so their state
//! travels inside checkpoints.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Adam with decoupled weight decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamW {
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    step: u64,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl AdamW {
    pub fn new(weight_decay: f64) -> Self {
        Self {
            weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    /// One update of `params` from `grads` at learning rate `lr`.
    pub fn step(&mut self, params: &mut [f64], grads: &[f64], lr: f64) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
        }
        self.step += 1;
        let t = self.step as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        for (i, (p, g)) in params.iter_mut().zip(grads).enumerate() {
            *p -= lr * self.weight_decay * *p;
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;
            *p -= lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}

/// Cosine annealing from `base_lr` down to `eta_min` over `t_max` epochs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosineAnnealingLr {
    pub base_lr: f64,
    pub eta_min: f64,
    pub t_max: usize,
    last_epoch: usize,
}

impl CosineAnnealingLr {
    pub fn new(base_lr: f64, t_max: usize) -> Self {
        Self {
            base_lr,
            eta_min: 0.0,
            t_max,
            last_epoch: 0,
        }
    }

    /// Learning rate for the current epoch.
    pub fn lr(&self) -> f64 {
        if self.t_max == 0 {
            return self.base_lr;
        }
        let t = self.last_epoch.min(self.t_max) as f64 / self.t_max as f64;
        self.eta_min + (self.base_lr - self.eta_min) * 0.5 * (1.0 + (PI * t).cos())
    }

    pub fn step(&mut self) {
        self.last_epoch += 1;
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }
}
