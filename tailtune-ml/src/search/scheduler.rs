//! Sequential trial scheduler.
//!
//! Proposes a parameter set, trains it to a terminal state, records the
//! outcome and repeats until the trial budget, the time budget or the grid
//! runs out. Trials never overlap. Each finished trial is appended to
//! `<runs_dir>/<experiment>/trials.jsonl`; restarting a study with the same
//! config replays the recorded trials and continues after the last one.
//! When the study ends, the report goes to `study.json` and the best trial
//! is exported as `best_config.toml`, a run config for retraining it.

use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tailtune_core::CorruptCheckpointPolicy;

use crate::data::DataSource;
use crate::error::{MlError, Result};
use crate::params::ParamMap;
use crate::search::config::SearchConfig;
use crate::search::history::{SearchHistory, TrialRecord};
use crate::search::pruner::Pruner;
use crate::search::report::StudyReport;
use crate::search::strategy::SearchStrategy;
use crate::tracking::RunReporter;
use crate::training::checkpoint::CheckpointStore;
use crate::training::config::{Direction, TrainingConfig};
use crate::training::metrics::EpochSummary;
use crate::training::run::{RunStatus, TrainingRun};
use crate::training::trainer::{EpochObserver, Trainer};

const TRIALS_FILE: &str = "trials.jsonl";
const REPORT_FILE: &str = "study.json";
const BEST_CONFIG_FILE: &str = "best_config.toml";

/// Per-trial view of the study handed to the trainer as its epoch observer.
/// Signals pruning by returning [`MlError::Pruned`].
pub struct TrialContext<'h> {
    number: usize,
    direction: Direction,
    pruner: &'h Pruner,
    history: &'h SearchHistory,
}

impl<'h> TrialContext<'h> {
    pub fn new(
        number: usize,
        direction: Direction,
        pruner: &'h Pruner,
        history: &'h SearchHistory,
    ) -> Self {
        Self {
            number,
            direction,
            pruner,
            history,
        }
    }
}

impl EpochObserver for TrialContext<'_> {
    fn on_epoch_end(&mut self, run: &TrainingRun, summary: &EpochSummary) -> Result<()> {
        let best = best_of(&run.trajectory(), self.direction);
        if self.pruner.should_prune(summary.epoch, best, self.history) {
            tracing::info!(
                trial = self.number,
                epoch = summary.epoch,
                value = best,
                threshold = ?self.pruner.threshold(summary.epoch, self.history),
                "Pruning trial"
            );
            return Err(MlError::Pruned {
                epoch: summary.epoch,
                value: best,
            });
        }
        Ok(())
    }
}

/// Best monitored value of a trajectory; NaN when it is empty.
fn best_of(trajectory: &[(usize, f64)], direction: Direction) -> f64 {
    trajectory
        .iter()
        .fold(f64::NAN, |best, (_, v)| direction.better(best, *v))
}

pub struct TrialScheduler<'a> {
    experiment: String,
    config: SearchConfig,
    direction: Direction,
    data: &'a dyn DataSource,
    store: CheckpointStore,
    reporter: RunReporter,
    on_corrupt: CorruptCheckpointPolicy,
    study_dir: PathBuf,
    history: SearchHistory,
}

impl<'a> TrialScheduler<'a> {
    /// Checkpoints and study files go under `<runs_dir>/<experiment>/`.
    pub fn new(
        experiment: impl Into<String>,
        config: SearchConfig,
        data: &'a dyn DataSource,
        runs_dir: &Path,
        reporter: RunReporter,
    ) -> Result<Self> {
        let experiment = experiment.into();
        if experiment.is_empty() || experiment.contains(['/', '\\']) {
            return Err(MlError::config(format!(
                "invalid experiment name '{experiment}'"
            )));
        }
        config.validate()?;
        let direction = config.direction()?;
        let study_dir = runs_dir.join(&experiment);
        Ok(Self {
            store: CheckpointStore::new(&study_dir),
            experiment,
            config,
            direction,
            data,
            reporter,
            on_corrupt: CorruptCheckpointPolicy::default(),
            study_dir,
            history: SearchHistory::new(),
        })
    }

    pub fn with_corrupt_policy(mut self, policy: CorruptCheckpointPolicy) -> Self {
        self.on_corrupt = policy;
        self
    }

    pub fn history(&self) -> &SearchHistory {
        &self.history
    }

    pub fn study_dir(&self) -> &Path {
        &self.study_dir
    }

    pub fn run_id(&self, number: usize) -> String {
        format!("{}-trial-{number:04}", self.experiment)
    }

    /// Run the study and write `study.json`. Only configuration problems and
    /// failures to persist study state are returned as errors; a trial that
    /// fails is recorded and the study moves on.
    pub fn run(&mut self) -> Result<StudyReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let budget = self.config.study.timeout_secs.map(Duration::from_secs);
        let n_trials = self.config.study.n_trials;
        let space = self.config.hyperparameters.clone();
        let mut strategy = SearchStrategy::from_config(&self.config.study.sampler, &space)?;
        let pruner = Pruner::from_config(&self.config.study.pruner, self.direction)?;

        self.replay(&mut strategy)?;
        tracing::info!(
            experiment = %self.experiment,
            n_trials,
            recorded = self.history.len(),
            sampler = strategy.name(),
            pruner = %pruner.kind(),
            direction = %self.direction,
            "Study started"
        );

        while self.history.len() < n_trials {
            if budget.is_some_and(|b| clock.elapsed() >= b) {
                tracing::info!(
                    experiment = %self.experiment,
                    elapsed_secs = clock.elapsed().as_secs(),
                    "Time budget spent, no new trials"
                );
                break;
            }
            let Some(proposal) = strategy.propose(&space, &self.history, self.direction) else {
                tracing::info!(experiment = %self.experiment, "Search space exhausted");
                break;
            };
            let record = self.run_trial(self.history.len(), self.config.merge(&proposal), &pruner);
            tailtune_core::persistence::append_json_line(
                &self.study_dir.join(TRIALS_FILE),
                &record,
            )?;
            self.history.append(record);
        }

        let report = StudyReport::new(
            &self.experiment,
            self.direction,
            strategy.name(),
            pruner.kind(),
            &self.history,
            started_at,
        );
        let report_path = self.study_dir.join(REPORT_FILE);
        report.save(&report_path)?;
        report.relay(&self.reporter, &report_path);
        self.export_best(&report)?;
        tracing::info!(
            experiment = %self.experiment,
            trials = report.trials.len(),
            best_trial = ?report.best_trial,
            best_value = ?report.best_value,
            pruned = report.counts.pruned,
            failed = report.counts.failed,
            "Study finished"
        );
        Ok(report)
    }

    /// Write `best_config.toml` for retraining the best trial, replacing any
    /// earlier export.
    fn export_best(&self, report: &StudyReport) -> Result<()> {
        let path = self.study_dir.join(BEST_CONFIG_FILE);
        match self.config.best_run_config(report) {
            Ok(best) => {
                best.save(&path)?;
                tracing::info!(
                    experiment = %self.experiment,
                    path = %path.display(),
                    "Exported best trial config"
                );
                Ok(())
            }
            Err(MlError::NotFound(reason)) => {
                tracing::info!(experiment = %self.experiment, %reason, "No best config exported");
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn run_trial(&self, number: usize, params: ParamMap, pruner: &Pruner) -> TrialRecord {
        let run_id = self.run_id(number);
        let started_at = Utc::now();
        tracing::info!(trial = number, run_id = %run_id, ?params, "Trial started");

        let failed = |error: MlError| {
            tracing::warn!(trial = number, run_id = %run_id, error = %error, "Trial failed");
            TrialRecord {
                number,
                run_id: run_id.clone(),
                params: params.clone(),
                status: RunStatus::Failed,
                value: None,
                intermediate: Vec::new(),
                error: Some(error.to_string()),
                started_at,
                finished_at: Utc::now(),
            }
        };

        let config = match TrainingConfig::from_params(params.clone()) {
            Ok(config) => config,
            Err(e) => return failed(e),
        };
        if config.monitor.direction() != self.direction {
            tracing::warn!(
                trial = number,
                monitor = config.monitor.name(),
                direction = %self.direction,
                "Monitored metric and study direction disagree"
            );
        }

        let mut context = TrialContext::new(number, self.direction, pruner, &self.history);
        let run = match Trainer::new(
            &run_id,
            config,
            self.data,
            self.store.clone(),
            self.reporter.clone(),
        )
        .with_corrupt_policy(self.on_corrupt)
        .run(&mut context)
        {
            Ok(run) => run,
            Err(e) => return failed(e),
        };

        let intermediate = run.trajectory();
        let value = match run.status {
            RunStatus::Completed | RunStatus::EarlyStopped => run.best_metric,
            RunStatus::Pruned => Some(best_of(&intermediate, self.direction)).filter(|v| !v.is_nan()),
            RunStatus::Failed | RunStatus::Running => None,
        };
        tracing::info!(
            trial = number,
            run_id = %run_id,
            status = %run.status,
            value = ?value,
            epochs = intermediate.len(),
            "Trial finished"
        );
        TrialRecord {
            number,
            run_id,
            params,
            status: run.status,
            value,
            intermediate,
            error: run.error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Rebuild history from `trials.jsonl`, re-proposing each recorded trial
    /// so the strategy ends up where the interrupted study left it.
    fn replay(&mut self, strategy: &mut SearchStrategy) -> Result<()> {
        let recorded = read_trials(&self.study_dir.join(TRIALS_FILE))?;
        if recorded.is_empty() {
            return Ok(());
        }
        let space = &self.config.hyperparameters;
        for record in recorded {
            let proposal = strategy.propose(space, &self.history, self.direction);
            let matches = proposal.is_some_and(|p| self.config.merge(&p) == record.params)
                && record.number == self.history.len();
            if !matches {
                return Err(MlError::config(format!(
                    "recorded trial {} in {} does not match this search config; \
                     use a different experiment name",
                    record.number,
                    self.study_dir.display()
                )));
            }
            self.history.append(record);
        }
        tracing::info!(
            experiment = %self.experiment,
            trials = self.history.len(),
            "Resuming study from recorded trials"
        );
        Ok(())
    }
}

/// Recorded trials. A final line cut short by a crash is dropped; any other
/// unreadable line means the log cannot be trusted.
fn read_trials(path: &Path) -> Result<Vec<TrialRecord>> {
    tailtune_core::persistence::load_json_lines(path).map_err(|e| match e.kind() {
        io::ErrorKind::InvalidData => MlError::config(format!("{}: {e}", path.display())),
        _ => e.into(),
    })
}
