//! Integration tests for the trial scheduler: pruning, failures, grid
//! exhaustion, time budget, study resume, best-config export and tracking
//! isolation.

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tailtune_ml::error::MlError;
use tailtune_ml::search::{ParamSpec, SearchConfig, SearchSpace, TrialScheduler};
use tailtune_ml::tracking::{MemoryTrackingStore, RunReporter};
use tailtune_ml::training::{RunConfig, RunStatus};
use tailtune_ml::{InMemoryDataset, ParamValue};
use tempfile::TempDir;

const DATA: &str = r#"
[data]
kind = "synthetic"
num_classes = 3
feature_dim = 8
head_samples = 60
imbalance_ratio = 4.0
val_per_class = 10
noise = 0.3
seed = 1
"#;

fn load(dir: &Path, body: &str) -> (SearchConfig, InMemoryDataset) {
    let path = dir.join("search.toml");
    std::fs::write(&path, format!("{body}\n{DATA}")).unwrap();
    let config = SearchConfig::load(&path).unwrap();
    let data = config.data.load(dir).unwrap();
    (config, data)
}

#[test]
fn hopeless_trial_is_pruned_with_its_trajectory() {
    let dir = TempDir::new().unwrap();
    let (config, data) = load(
        dir.path(),
        r#"
        [study]
        n_trials = 2

        [study.sampler]
        type = "grid"

        [study.pruner]
        type = "median"
        n_startup_trials = 1

        [hyperparameters.lr]
        type = "categorical"
        choices = [0.05, 1e-9]

        [fixed]
        tau = 0.5
        epochs = 4
        batch_size = 16
        "#,
    );
    let mut scheduler =
        TrialScheduler::new("exp", config, &data, &dir.path().join("runs"), RunReporter::disabled())
            .unwrap();
    let report = scheduler.run().unwrap();

    let trials = scheduler.history().trials();
    assert_eq!(trials.len(), 2);
    assert_eq!(trials[0].status, RunStatus::Completed);
    assert_eq!(trials[0].intermediate.len(), 4);

    let pruned = &trials[1];
    assert_eq!(pruned.status, RunStatus::Pruned);
    assert_eq!(pruned.run_id, "exp-trial-0001");
    assert_eq!(pruned.params["lr"], ParamValue::Float(1e-9));
    assert_eq!(pruned.intermediate.len(), 1);
    assert_eq!(pruned.intermediate[0].0, 0);
    assert_eq!(pruned.value, Some(pruned.intermediate[0].1));

    assert_eq!(report.best_trial, Some(0));
    assert_eq!(report.counts.pruned, 1);
    assert!(dir.path().join("runs/exp/study.json").is_file());
    assert!(dir.path().join("runs/exp/exp-trial-0001/last.ckpt.json").is_file());
}

#[test]
fn failed_trial_does_not_stop_the_study_and_grid_exhausts() {
    let dir = TempDir::new().unwrap();
    let (config, data) = load(
        dir.path(),
        r#"
        [study]
        n_trials = 10

        [study.sampler]
        type = "grid"

        [study.pruner]
        type = "none"

        [hyperparameters.loss]
        type = "categorical"
        choices = ["focal", "modulated_ce"]

        [fixed]
        tau = 0.5
        epochs = 2
        "#,
    );
    let mut scheduler =
        TrialScheduler::new("exp", config, &data, &dir.path().join("runs"), RunReporter::disabled())
            .unwrap();
    let report = scheduler.run().unwrap();

    assert_eq!(report.trials.len(), 2);
    assert_eq!(report.trials[0].status, RunStatus::Failed);
    assert!(report.trials[0].error.as_deref().unwrap().contains("focal_gamma"));
    assert_eq!(report.trials[1].status, RunStatus::Completed);
    assert_eq!(report.best_trial, Some(1));
    assert_eq!(report.counts.failed, 1);

    let lines = std::fs::read_to_string(dir.path().join("runs/exp/trials.jsonl")).unwrap();
    assert_eq!(lines.lines().count(), 2);
}

const RANDOM_STUDY: &str = r#"
[study]
n_trials = 2

[study.sampler]
type = "random"
seed = 9

[study.pruner]
type = "none"

[hyperparameters.tau]
type = "float"
low = 0.0
high = 1.0

[hyperparameters.lr]
type = "float"
low = 1e-3
high = 1e-1
log = true

[fixed]
epochs = 2
"#;

#[test]
fn restarted_study_continues_after_recorded_trials() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let (config, data) = load(dir.path(), RANDOM_STUDY);

    let mut first = TrialScheduler::new("exp", config.clone(), &data, &runs, RunReporter::disabled())
        .unwrap();
    first.run().unwrap();
    let recorded = first.history().trials().to_vec();

    let mut longer = config.clone();
    longer.study.n_trials = 3;
    let mut second = TrialScheduler::new("exp", longer, &data, &runs, RunReporter::disabled())
        .unwrap();
    let report = second.run().unwrap();

    assert_eq!(report.trials.len(), 3);
    assert_eq!(&second.history().trials()[..2], recorded.as_slice());
    assert_eq!(report.trials[2].run_id, "exp-trial-0002");

    let mut reseeded = config;
    reseeded.study.sampler.seed = 10;
    let err = TrialScheduler::new("exp", reseeded, &data, &runs, RunReporter::disabled())
        .unwrap()
        .run()
        .unwrap_err();
    assert!(matches!(err, MlError::Configuration(_)));
}

#[test]
fn torn_final_trial_line_is_dropped_on_restart() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let (config, data) = load(dir.path(), RANDOM_STUDY);
    TrialScheduler::new("exp", config.clone(), &data, &runs, RunReporter::disabled())
        .unwrap()
        .run()
        .unwrap();

    let trials_path = runs.join("exp/trials.jsonl");
    let intact = std::fs::read_to_string(&trials_path).unwrap();
    std::fs::write(&trials_path, format!("{intact}{{\"number\":2,\"params\":{{\"lr\":0.0")).unwrap();

    let mut longer = config;
    longer.study.n_trials = 3;
    let report = TrialScheduler::new("exp", longer, &data, &runs, RunReporter::disabled())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(report.trials.len(), 3);
    assert_eq!(report.trials[2].run_id, "exp-trial-0002");

    let lines = std::fs::read_to_string(&trials_path).unwrap();
    assert_eq!(lines.lines().count(), 3);
    assert!(lines.starts_with(&intact));
    for line in lines.lines() {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
}

#[test]
fn corrupt_interior_trial_line_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let (config, data) = load(dir.path(), RANDOM_STUDY);
    TrialScheduler::new("exp", config.clone(), &data, &runs, RunReporter::disabled())
        .unwrap()
        .run()
        .unwrap();

    let trials_path = runs.join("exp/trials.jsonl");
    let intact = std::fs::read_to_string(&trials_path).unwrap();
    std::fs::write(&trials_path, format!("garbage\n{intact}")).unwrap();

    let err = TrialScheduler::new("exp", config, &data, &runs, RunReporter::disabled())
        .unwrap()
        .run()
        .unwrap_err();
    assert!(matches!(err, MlError::Configuration(ref msg) if msg.contains("line 1")), "{err}");
}

#[test]
fn spent_time_budget_starts_no_trials_but_still_reports() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let (mut config, data) = load(dir.path(), RANDOM_STUDY);
    config.study.n_trials = 5;
    config.study.timeout_secs = Some(0);

    let report = TrialScheduler::new("exp", config, &data, &runs, RunReporter::disabled())
        .unwrap()
        .run()
        .unwrap();

    assert!(report.trials.is_empty());
    assert_eq!(report.best_trial, None);
    assert!(runs.join("exp/study.json").is_file());
    assert!(!runs.join("exp/trials.jsonl").exists());
    assert!(!runs.join("exp/best_config.toml").exists());
}

#[test]
fn best_trial_is_exported_as_a_run_config() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let (config, data) = load(dir.path(), RANDOM_STUDY);
    let report = TrialScheduler::new("exp", config.clone(), &data, &runs, RunReporter::disabled())
        .unwrap()
        .run()
        .unwrap();

    let best = RunConfig::load(&runs.join("exp/best_config.toml")).unwrap();
    assert_eq!(best.run_id("exp"), "exp-best");
    assert_eq!(Some(best.params.clone()), report.best_params);
    assert_eq!(best.data, config.data);
    assert_eq!(best.training_config().unwrap().epochs, 2);
}

#[test]
fn tracking_outage_does_not_affect_the_study() {
    let dir = TempDir::new().unwrap();
    let (config, data) = load(dir.path(), RANDOM_STUDY);
    let tracking = MemoryTrackingStore::new();
    tracking.set_unavailable(true);
    let reporter = RunReporter::new(Arc::new(tracking.clone()));

    let report = TrialScheduler::new("exp", config, &data, &dir.path().join("runs"), reporter.clone())
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.trials.len(), 2);
    assert!(report.trials.iter().all(|t| t.status == RunStatus::Completed));
    assert!(reporter.dropped() > 0);
    assert!(tracking.artifacts("exp-study").is_empty());
}

#[test]
fn reversed_bounds_are_rejected() {
    let mut params = BTreeMap::new();
    params.insert(
        "lr".to_string(),
        ParamSpec::Float { low: 0.1, high: 0.001, log: true },
    );
    let err = SearchSpace::new(params).unwrap_err();
    assert!(err.to_string().contains("low (0.1) > high (0.001)"));
}
