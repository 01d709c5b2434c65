//! Search strategies: Tree-structured Parzen Estimator, random and grid.
//!
//! TPE splits past trials into a "good" fraction `gamma` and the rest, fits
//! one Parzen estimator per parameter to each group, and proposes the
//! candidate (drawn from the good estimator) with the largest
//! `log l(x) - log g(x)`. Parameters are treated independently.

use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};

use crate::error::{MlError, Result};
use crate::params::{ParamMap, ParamValue};
use crate::search::history::SearchHistory;
use crate::search::space::{ParamSpec, SearchSpace};
use crate::training::config::Direction;
use crate::training::run::RunStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    Tpe,
    Random,
    Grid,
}

/// `[study.sampler]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    #[serde(rename = "type")]
    pub kind: SamplerKind,
    pub seed: u64,
    /// Random proposals before TPE takes over.
    pub n_startup_trials: usize,
    /// Fraction of trials that form the "good" group.
    pub gamma: f64,
    /// Candidates drawn from the good estimator per proposal.
    pub n_ei_candidates: usize,
    /// Values per float parameter in a grid search.
    pub grid_points: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: SamplerKind::default(),
            seed: 42,
            n_startup_trials: 10,
            gamma: 0.25,
            n_ei_candidates: 24,
            grid_points: 3,
        }
    }
}

#[derive(Debug)]
pub struct TpeSampler {
    rng: StdRng,
    n_startup_trials: usize,
    gamma: f64,
    n_ei_candidates: usize,
}

#[derive(Debug)]
pub struct GridSampler {
    grid: Vec<ParamMap>,
    cursor: usize,
}

/// Closed set of strategies, chosen when the search config is loaded.
#[derive(Debug)]
pub enum SearchStrategy {
    Tpe(TpeSampler),
    Random(StdRng),
    Grid(GridSampler),
}

impl SearchStrategy {
    pub fn from_config(config: &SamplerConfig, space: &SearchSpace) -> Result<Self> {
        let rng = StdRng::seed_from_u64(config.seed);
        match config.kind {
            SamplerKind::Tpe => {
                if !(config.gamma > 0.0 && config.gamma < 1.0) {
                    return Err(MlError::config(format!(
                        "sampler gamma must be in (0, 1), got {}",
                        config.gamma
                    )));
                }
                if config.n_ei_candidates == 0 {
                    return Err(MlError::config("n_ei_candidates must be > 0"));
                }
                Ok(Self::Tpe(TpeSampler {
                    rng,
                    n_startup_trials: config.n_startup_trials,
                    gamma: config.gamma,
                    n_ei_candidates: config.n_ei_candidates,
                }))
            }
            SamplerKind::Random => Ok(Self::Random(rng)),
            SamplerKind::Grid => {
                if config.grid_points == 0 {
                    return Err(MlError::config("grid_points must be > 0"));
                }
                Ok(Self::Grid(GridSampler {
                    grid: space.grid(config.grid_points),
                    cursor: 0,
                }))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tpe(_) => "tpe",
            Self::Random(_) => "random",
            Self::Grid(_) => "grid",
        }
    }

    /// Next parameter set, or `None` once a grid is exhausted.
    pub fn propose(
        &mut self,
        space: &SearchSpace,
        history: &SearchHistory,
        direction: Direction,
    ) -> Option<ParamMap> {
        match self {
            Self::Tpe(tpe) => Some(tpe.propose(space, history, direction)),
            Self::Random(rng) => Some(space.sample(rng)),
            Self::Grid(grid) => {
                let next = grid.grid.get(grid.cursor).cloned();
                grid.cursor += 1;
                next
            }
        }
    }
}

impl TpeSampler {
    fn propose(
        &mut self,
        space: &SearchSpace,
        history: &SearchHistory,
        direction: Direction,
    ) -> ParamMap {
        let observed = ranked_observations(history, direction);
        if observed.len() < self.n_startup_trials.max(2) {
            return space.sample(&mut self.rng);
        }
        let n_below = ((self.gamma * observed.len() as f64).ceil() as usize).clamp(1, observed.len() - 1);
        let (below, above) = observed.split_at(n_below);

        space
            .iter()
            .map(|(name, spec)| {
                let coords = |group: &[&ParamMap]| -> Vec<f64> {
                    group
                        .iter()
                        .filter_map(|p| p.get(name).and_then(|v| spec.encode(v)))
                        .collect()
                };
                let value = self.propose_param(spec, &coords(below), &coords(above));
                (name.clone(), value)
            })
            .collect()
    }

    fn propose_param(&mut self, spec: &ParamSpec, below: &[f64], above: &[f64]) -> ParamValue {
        match spec {
            ParamSpec::Categorical { choices } => {
                let l = categorical_probs(choices.len(), below);
                let g = categorical_probs(choices.len(), above);
                let Ok(good) = WeightedIndex::new(&l) else {
                    return spec.sample(&mut self.rng);
                };
                let best = (0..self.n_ei_candidates)
                    .map(|_| good.sample(&mut self.rng))
                    .max_by(|&a, &b| {
                        let score = |i: usize| l[i].ln() - g[i].ln();
                        score(a).total_cmp(&score(b))
                    })
                    .unwrap_or(0);
                spec.decode(best as f64)
            }
            _ => {
                let Some((lo, hi)) = spec.internal_bounds() else {
                    return spec.sample(&mut self.rng);
                };
                if hi <= lo {
                    return spec.decode(lo);
                }
                let l = Parzen::fit(below, lo, hi);
                let g = Parzen::fit(above, lo, hi);
                let mut best = (f64::NEG_INFINITY, lo);
                for _ in 0..self.n_ei_candidates {
                    let x = l.sample(&mut self.rng);
                    let score = l.log_pdf(x) - g.log_pdf(x);
                    if score > best.0 {
                        best = (score, x);
                    }
                }
                spec.decode(best.1)
            }
        }
    }
}

/// Params of usable trials, best first. Completed and early-stopped trials
/// rank ahead of pruned ones; failed trials are ignored.
fn ranked_observations(history: &SearchHistory, direction: Direction) -> Vec<&ParamMap> {
    let mut ranked: Vec<(bool, f64, &ParamMap)> = history
        .trials()
        .iter()
        .filter(|t| t.status != RunStatus::Failed)
        .filter_map(|t| {
            let v = t.value.filter(|v| !v.is_nan())?;
            let key = match direction {
                Direction::Maximize => -v,
                Direction::Minimize => v,
            };
            Some((t.status == RunStatus::Pruned, key, &t.params))
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    ranked.into_iter().map(|(_, _, p)| p).collect()
}

/// Add-one smoothed choice frequencies.
fn categorical_probs(n: usize, observed: &[f64]) -> Vec<f64> {
    let mut counts = vec![1.0; n];
    for &i in observed {
        if let Some(c) = counts.get_mut(i as usize) {
            *c += 1.0;
        }
    }
    let total: f64 = counts.iter().sum();
    counts.into_iter().map(|c| c / total).collect()
}

/// Mixture of truncated Gaussians on `[lo, hi]`: one per observation plus a
/// broad prior component centred on the range.
#[derive(Debug)]
struct Parzen {
    mus: Vec<f64>,
    sigmas: Vec<f64>,
    lo: f64,
    hi: f64,
}

impl Parzen {
    fn fit(observed: &[f64], lo: f64, hi: f64) -> Self {
        let range = hi - lo;
        let prior_mu = 0.5 * (lo + hi);
        let mut mus: Vec<f64> = observed.iter().map(|x| x.clamp(lo, hi)).collect();
        mus.push(prior_mu);

        let mut order: Vec<usize> = (0..mus.len()).collect();
        order.sort_by(|&a, &b| mus[a].total_cmp(&mus[b]));
        let min_sigma = range / (1.0 + mus.len() as f64).min(100.0);
        let mut sigmas = vec![range; mus.len()];
        for (rank, &i) in order.iter().enumerate() {
            if i == mus.len() - 1 {
                continue;
            }
            let left = if rank == 0 { mus[i] - lo } else { mus[i] - mus[order[rank - 1]] };
            let right = if rank + 1 == order.len() {
                hi - mus[i]
            } else {
                mus[order[rank + 1]] - mus[i]
            };
            sigmas[i] = left.max(right).clamp(min_sigma, range);
        }
        Self { mus, sigmas, lo, hi }
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        let k = rng.gen_range(0..self.mus.len());
        let Ok(component) = Normal::new(self.mus[k], self.sigmas[k]) else {
            return self.mus[k];
        };
        for _ in 0..64 {
            let x = component.sample(rng);
            if (self.lo..=self.hi).contains(&x) {
                return x;
            }
        }
        self.mus[k]
    }

    fn log_pdf(&self, x: f64) -> f64 {
        let weight = 1.0 / self.mus.len() as f64;
        let density: f64 = self
            .mus
            .iter()
            .zip(&self.sigmas)
            .map(|(&mu, &sigma)| {
                let mass = normal_cdf((self.hi - mu) / sigma) - normal_cdf((self.lo - mu) / sigma);
                let z = (x - mu) / sigma;
                weight * (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt() * mass.max(1e-12))
            })
            .sum();
        density.max(f64::MIN_POSITIVE).ln()
    }
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + libm::erf(z / SQRT_2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::history::TrialRecord;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn space() -> SearchSpace {
        let mut params = BTreeMap::new();
        params.insert("x".to_string(), ParamSpec::Float { low: 0.0, high: 10.0, log: false });
        params.insert(
            "loss".to_string(),
            ParamSpec::Categorical { choices: vec!["focal".into(), "modulated_ce".into()] },
        );
        SearchSpace::new(params).unwrap()
    }

    fn objective(p: &ParamMap) -> f64 {
        let x = p["x"].as_f64().unwrap();
        let bonus = if p["loss"] == ParamValue::Text("focal".into()) { 1.0 } else { 0.0 };
        -(x - 7.0).powi(2) + bonus
    }

    fn trial(number: usize, params: ParamMap, value: f64) -> TrialRecord {
        TrialRecord {
            number,
            run_id: format!("t{number}"),
            params,
            status: RunStatus::Completed,
            value: Some(value),
            intermediate: vec![(0, value)],
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn run_study(kind: SamplerKind, n: usize) -> SearchHistory {
        let space = space();
        let cfg = SamplerConfig {
            kind,
            seed: 7,
            n_startup_trials: 5,
            ..Default::default()
        };
        let mut strategy = SearchStrategy::from_config(&cfg, &space).unwrap();
        let mut history = SearchHistory::new();
        for i in 0..n {
            let Some(p) = strategy.propose(&space, &history, Direction::Maximize) else {
                break;
            };
            let v = objective(&p);
            history.append(trial(i, p, v));
        }
        history
    }

    #[test]
    fn test_tpe_beats_random_on_average_late_proposals() {
        let tpe = run_study(SamplerKind::Tpe, 60);
        let random = run_study(SamplerKind::Random, 60);
        let late_mean = |h: &SearchHistory| {
            let vals: Vec<f64> = h.trials()[30..].iter().filter_map(|t| t.value).collect();
            vals.iter().sum::<f64>() / vals.len() as f64
        };
        assert!(late_mean(&tpe) > late_mean(&random), "{} vs {}", late_mean(&tpe), late_mean(&random));
    }

    #[test]
    fn test_same_seed_same_proposals() {
        let a = run_study(SamplerKind::Tpe, 20);
        let b = run_study(SamplerKind::Tpe, 20);
        let params = |h: &SearchHistory| h.trials().iter().map(|t| t.params.clone()).collect::<Vec<_>>();
        assert_eq!(params(&a), params(&b));
    }

    #[test]
    fn test_grid_exhausts() {
        let h = run_study(SamplerKind::Grid, 100);
        assert_eq!(h.len(), 6);
    }

    #[test]
    fn test_proposals_stay_in_space() {
        let h = run_study(SamplerKind::Tpe, 40);
        for t in h.trials() {
            let x = t.params["x"].as_f64().unwrap();
            assert!((0.0..=10.0).contains(&x));
        }
    }

    #[test]
    fn test_failed_trials_are_ignored_and_pruned_rank_last() {
        let mut h = SearchHistory::new();
        let tagged = |x: f64| {
            let mut p = ParamMap::new();
            p.insert("x".into(), x.into());
            p
        };
        h.append(trial(0, tagged(0.0), 0.2));
        let mut pruned = trial(1, tagged(1.0), 0.9);
        pruned.status = RunStatus::Pruned;
        h.append(pruned);
        let mut failed = trial(2, tagged(2.0), 5.0);
        failed.status = RunStatus::Failed;
        h.append(failed);
        h.append(trial(3, tagged(3.0), 0.5));

        let xs: Vec<f64> = ranked_observations(&h, Direction::Maximize)
            .iter()
            .filter_map(|p| p["x"].as_f64())
            .collect();
        assert_eq!(xs, vec![3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_invalid_sampler_config() {
        let cfg = SamplerConfig { gamma: 1.5, ..Default::default() };
        assert!(SearchStrategy::from_config(&cfg, &space()).is_err());
    }

    #[test]
    fn test_normal_cdf() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-15);
        assert!((normal_cdf(1.0) - 0.841_344_746_068_543).abs() < 1e-12);
        assert!((normal_cdf(-1.96) - 0.024_997_895_148_220).abs() < 1e-12);
    }

    #[test]
    fn test_truncated_parzen_samples_stay_in_range() {
        let parzen = Parzen::fit(&[0.1, 0.9, 0.95], 0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let x = parzen.sample(&mut rng);
            assert!((0.0..=1.0).contains(&x));
            assert!(parzen.log_pdf(x).is_finite());
        }
    }
}
