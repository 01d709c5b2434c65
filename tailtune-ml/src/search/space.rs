//! Hyperparameter search space.

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MlError, Result};
use crate::params::{ParamMap, ParamValue};

/// Distribution of one searched hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSpec {
    Categorical {
        choices: Vec<ParamValue>,
    },
    Float {
        low: f64,
        high: f64,
        #[serde(default)]
        log: bool,
    },
    Int {
        low: i64,
        high: i64,
        #[serde(default)]
        log: bool,
    },
}

impl ParamSpec {
    pub fn validate(&self, name: &str) -> Result<()> {
        match self {
            Self::Categorical { choices } if choices.is_empty() => Err(MlError::config(format!(
                "hyperparameter '{name}': choices must not be empty"
            ))),
            Self::Categorical { .. } => Ok(()),
            Self::Float { low, high, log } => check_range(name, *low, *high, *log),
            Self::Int { low, high, log } => check_range(name, *low as f64, *high as f64, *log),
        }
    }

    /// Numeric bounds in the space the samplers work in (log-transformed
    /// when `log`). `None` for categoricals.
    pub fn internal_bounds(&self) -> Option<(f64, f64)> {
        match self {
            Self::Categorical { .. } => None,
            Self::Float { low, high, log } => Some(to_internal_bounds(*low, *high, *log)),
            Self::Int { low, high, log } => Some(to_internal_bounds(*low as f64, *high as f64, *log)),
        }
    }

    /// Parameter value at an internal-space coordinate.
    pub fn decode(&self, t: f64) -> ParamValue {
        match self {
            Self::Categorical { choices } => {
                let idx = (t.max(0.0) as usize).min(choices.len().saturating_sub(1));
                choices[idx].clone()
            }
            Self::Float { low, high, log } => {
                let x = if *log { t.exp() } else { t };
                ParamValue::Float(x.clamp(*low, *high))
            }
            Self::Int { low, high, log } => {
                let x = if *log { t.exp() } else { t };
                ParamValue::Int((x.round() as i64).clamp(*low, *high))
            }
        }
    }

    /// Internal-space coordinate of a value, if it belongs to this spec.
    pub fn encode(&self, value: &ParamValue) -> Option<f64> {
        match self {
            Self::Categorical { choices } => choices.iter().position(|c| c == value).map(|i| i as f64),
            Self::Float { log, .. } | Self::Int { log, .. } => {
                let x = value.as_f64()?;
                Some(if *log { x.ln() } else { x })
            }
        }
    }

    pub fn sample(&self, rng: &mut StdRng) -> ParamValue {
        match self {
            Self::Categorical { choices } => choices[rng.gen_range(0..choices.len())].clone(),
            Self::Int { low, high, log: false } => ParamValue::Int(rng.gen_range(*low..=*high)),
            Self::Int { low, high, log: true } => {
                let (lo, hi) = to_internal_bounds(*low as f64, *high as f64, true);
                self.decode(uniform(rng, lo, hi))
            }
            Self::Float { low, high, log } => {
                let (lo, hi) = to_internal_bounds(*low, *high, *log);
                self.decode(uniform(rng, lo, hi))
            }
        }
    }

    /// Values this parameter takes in a grid search. Floats (and integer
    /// ranges wider than `points`) are discretised into `points` values.
    pub fn grid_values(&self, points: usize) -> Vec<ParamValue> {
        let points = points.max(1);
        match self {
            Self::Categorical { choices } => choices.clone(),
            Self::Int { low, high, log: false }
                if int_span(*low, *high).is_some_and(|n| n <= points as u64) =>
            {
                (*low..=*high).map(ParamValue::Int).collect()
            }
            _ => {
                let Some((lo, hi)) = self.internal_bounds() else {
                    return Vec::new();
                };
                let mut values: Vec<ParamValue> = Vec::with_capacity(points);
                for i in 0..points {
                    let t = if points == 1 {
                        lo
                    } else {
                        lo + (hi - lo) * i as f64 / (points - 1) as f64
                    };
                    let v = self.decode(t);
                    if !values.contains(&v) {
                        values.push(v);
                    }
                }
                values
            }
        }
    }
}

fn check_range(name: &str, low: f64, high: f64, log: bool) -> Result<()> {
    if !(low.is_finite() && high.is_finite()) {
        return Err(MlError::config(format!(
            "hyperparameter '{name}': bounds must be finite"
        )));
    }
    if low > high {
        return Err(MlError::config(format!(
            "hyperparameter '{name}': low ({low}) > high ({high})"
        )));
    }
    if log && low <= 0.0 {
        return Err(MlError::config(format!(
            "hyperparameter '{name}': log scale requires low > 0, got {low}"
        )));
    }
    Ok(())
}

/// Number of integers in `low..=high`; `None` when that does not fit in an `i64`.
fn int_span(low: i64, high: i64) -> Option<u64> {
    let span = high.checked_sub(low)?.checked_add(1)?;
    u64::try_from(span).ok()
}

fn uniform(rng: &mut StdRng, lo: f64, hi: f64) -> f64 {
    if hi > lo { rng.gen_range(lo..=hi) } else { lo }
}

fn to_internal_bounds(low: f64, high: f64, log: bool) -> (f64, f64) {
    if log { (low.ln(), high.ln()) } else { (low, high) }
}

/// Named hyperparameter distributions, in name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    params: BTreeMap<String, ParamSpec>,
}

impl SearchSpace {
    pub fn new(params: BTreeMap<String, ParamSpec>) -> Result<Self> {
        let space = Self { params };
        space.validate()?;
        Ok(space)
    }

    pub fn validate(&self) -> Result<()> {
        self.params
            .iter()
            .try_for_each(|(name, spec)| spec.validate(name))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamSpec)> {
        self.params.iter()
    }

    pub fn sample(&self, rng: &mut StdRng) -> ParamMap {
        self.params
            .iter()
            .map(|(name, spec)| (name.clone(), spec.sample(rng)))
            .collect()
    }

    /// Cartesian product of every parameter's grid values.
    pub fn grid(&self, points: usize) -> Vec<ParamMap> {
        let mut combos = vec![ParamMap::new()];
        for (name, spec) in &self.params {
            let values = spec.grid_values(points);
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in &values {
                    let mut c = combo.clone();
                    c.insert(name.clone(), value.clone());
                    next.push(c);
                }
            }
            combos = next;
        }
        combos
    }
}
