//! Search configuration document (`run-search --search-config`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::data::DataConfig;
use crate::error::{MlError, Result};
use crate::params::{ParamMap, ParamMapExt};
use crate::search::pruner::PrunerConfig;
use crate::search::report::StudyReport;
use crate::search::space::SearchSpace;
use crate::search::strategy::SamplerConfig;
use crate::training::config::{Direction, MonitorMetric, RunConfig};

/// `[study]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// Experiment name used when the CLI does not pass one.
    pub name: Option<String>,
    pub n_trials: usize,
    /// Wall-clock budget; no new trial starts once it is spent.
    pub timeout_secs: Option<u64>,
    /// Defaults to the direction of the fixed `monitor` metric.
    pub direction: Option<Direction>,
    pub sampler: SamplerConfig,
    pub pruner: PrunerConfig,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            name: None,
            n_trials: 20,
            timeout_secs: None,
            direction: None,
            sampler: SamplerConfig::default(),
            pruner: PrunerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub study: StudyConfig,
    #[serde(default)]
    pub hyperparameters: SearchSpace,
    /// Non-searched params; a proposed value for the same key wins.
    #[serde(default)]
    pub fixed: ParamMap,
    #[serde(default)]
    pub data: DataConfig,
}

impl SearchConfig {
    /// Load a TOML or JSON search config and validate its search space.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = tailtune_core::load_document(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.hyperparameters.validate()?;
        if self.study.n_trials == 0 {
            return Err(MlError::config("study.n_trials must be > 0"));
        }
        if self.hyperparameters.iter().any(|(name, _)| name == "monitor") {
            return Err(MlError::config(
                "'monitor' cannot be searched; set it under [fixed]",
            ));
        }
        self.direction().map(|_| ())
    }

    /// Objective direction: explicit, or implied by the monitored metric.
    pub fn direction(&self) -> Result<Direction> {
        if let Some(direction) = self.study.direction {
            return Ok(direction);
        }
        Ok(match self.fixed.text("monitor")? {
            Some(name) => MonitorMetric::from_str(name)?.direction(),
            None => MonitorMetric::default().direction(),
        })
    }

    /// Fixed params overlaid with a proposal.
    pub fn merge(&self, proposal: &ParamMap) -> ParamMap {
        let mut params = self.fixed.clone();
        params.extend(proposal.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }

    /// Run config that retrains the study's best trial as `<experiment>-best`.
    pub fn best_run_config(&self, report: &StudyReport) -> Result<RunConfig> {
        let params = report.best_params.clone().ok_or_else(|| {
            MlError::not_found(format!(
                "study '{}' has no completed trial to export",
                report.experiment
            ))
        })?;
        Ok(RunConfig {
            run_id: Some(format!("{}-best", report.experiment)),
            params,
            data: self.data.clone(),
        })
    }
}
