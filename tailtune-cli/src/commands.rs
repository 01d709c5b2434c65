//! CLI subcommand handlers.

use anyhow::Context;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tailtune_core::Settings;
use tailtune_core::config::resolve_path;
use tailtune_ml::data::DataConfig;
use tailtune_ml::params::{ParamMap, ParamValue};
use tailtune_ml::search::{ParamSpec, SearchConfig, SearchSpace, StudyConfig, TrialScheduler};
use tailtune_ml::tracking::{FileTrackingStore, RunReporter};
use tailtune_ml::training::trainer::NoopObserver;
use tailtune_ml::training::{CheckpointStore, RunConfig, RunStatus, Slot, Trainer};

use crate::{Commands, Template};

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, workspace: &Path, settings: &Settings) -> anyhow::Result<()> {
    match command {
        Commands::RunSearch {
            search_config,
            n_trials,
            experiment,
            json,
        } => handle_run_search(&search_config, n_trials, experiment, json, workspace, settings),
        Commands::RunTraining {
            run_config,
            experiment,
            epochs,
        } => handle_run_training(&run_config, &experiment, epochs, workspace, settings),
        Commands::InspectCheckpoint {
            experiment,
            run_id,
            slot,
            json,
        } => handle_inspect(&experiment, &run_id, slot, json, workspace, settings),
        Commands::InitConfig { template } => handle_init(template, workspace),
    }
}

fn runs_dir(workspace: &Path, settings: &Settings) -> PathBuf {
    resolve_path(workspace, &settings.paths.runs_dir)
}

fn reporter(workspace: &Path, settings: &Settings, experiment: &str) -> RunReporter {
    if !settings.tracking.enabled {
        return RunReporter::disabled();
    }
    let tracking_dir = resolve_path(workspace, &settings.paths.tracking_dir);
    RunReporter::new(Arc::new(FileTrackingStore::new(&tracking_dir, experiment)))
}

/// Directory relative data paths in a config file resolve against.
fn config_base(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

fn handle_run_search(
    path: &Path,
    n_trials: Option<usize>,
    experiment: Option<String>,
    json: bool,
    workspace: &Path,
    settings: &Settings,
) -> anyhow::Result<()> {
    let mut config = SearchConfig::load(path)
        .with_context(|| format!("Failed to load search config {}", path.display()))?;
    if let Some(n) = n_trials {
        config.study.n_trials = n;
    }
    let experiment = experiment
        .or_else(|| config.study.name.clone())
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "default".to_string());

    let base = std::path::absolute(config_base(path))?;
    let data = config.data.load(&base).context("Failed to load dataset")?;
    // The exported best config lives in the study directory, not next to this file.
    config.data = config.data.rebased(&base);
    let reporter = reporter(workspace, settings, &experiment);
    let mut scheduler = TrialScheduler::new(
        &experiment,
        config,
        &data,
        &runs_dir(workspace, settings),
        reporter.clone(),
    )?
    .with_corrupt_policy(settings.resume.on_corrupt);
    let report = scheduler.run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
        println!(
            "Report written to {}",
            scheduler.study_dir().join("study.json").display()
        );
        let best_config = scheduler.study_dir().join("best_config.toml");
        if best_config.is_file() {
            println!("Best config written to {}", best_config.display());
        }
    }
    if reporter.dropped() > 0 {
        eprintln!("Warning: {} tracking records could not be written", reporter.dropped());
    }
    Ok(())
}

fn handle_run_training(
    path: &Path,
    experiment: &str,
    epochs: Option<usize>,
    workspace: &Path,
    settings: &Settings,
) -> anyhow::Result<()> {
    let mut run_config = RunConfig::load(path)
        .with_context(|| format!("Failed to load run config {}", path.display()))?;
    if let Some(epochs) = epochs {
        run_config
            .params
            .insert("epochs".to_string(), ParamValue::Int(i64::try_from(epochs)?));
    }
    let config = run_config.training_config()?;
    let run_id = run_config.run_id(experiment);
    let data = run_config
        .data
        .load(config_base(path))
        .context("Failed to load dataset")?;
    let store = CheckpointStore::new(runs_dir(workspace, settings).join(experiment));

    let run = Trainer::new(
        &run_id,
        config,
        &data,
        store,
        reporter(workspace, settings, experiment),
    )
    .with_corrupt_policy(settings.resume.on_corrupt)
    .run(&mut NoopObserver)?;

    println!("Run {} finished: {}", run.run_id, run.status);
    println!("  Epochs:      {}", run.current_epoch);
    if let Some(epoch) = run.resumed_from {
        println!("  Resumed:     after epoch {epoch}");
    }
    match (run.best_metric, run.best_epoch) {
        (Some(best), Some(epoch)) => println!(
            "  Best {}: {best:.4} (epoch {epoch})",
            run.config.monitor.name()
        ),
        (Some(best), None) => println!("  Best {}: {best:.4}", run.config.monitor.name()),
        _ => println!("  Best {}: -", run.config.monitor.name()),
    }

    if run.status == RunStatus::Failed {
        anyhow::bail!(
            "Run {} failed: {}",
            run.run_id,
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn handle_inspect(
    experiment: &str,
    run_id: &str,
    slot: Slot,
    json: bool,
    workspace: &Path,
    settings: &Settings,
) -> anyhow::Result<()> {
    let store = CheckpointStore::new(runs_dir(workspace, settings).join(experiment));
    let Some(summary) = store.inspect(run_id, slot)? else {
        anyhow::bail!(
            "No {slot} checkpoint for run '{run_id}' at {}",
            store.path(run_id, slot).display()
        );
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }
    Ok(())
}

fn handle_init(template: Template, workspace: &Path) -> anyhow::Result<()> {
    let (path, content) = match template {
        Template::Search => (
            workspace.join("search.toml"),
            toml::to_string_pretty(&example_search_config())?,
        ),
        Template::Run => (
            workspace.join("run.toml"),
            toml::to_string_pretty(&example_run_config())?,
        ),
        Template::Settings => (
            workspace.join(".tailtune").join("config.toml"),
            toml::to_string_pretty(&Settings::default())?,
        ),
    };
    if path.exists() {
        println!("File already exists at: {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, content)?;
    println!("Created {}", path.display());
    Ok(())
}

fn params<const N: usize>(entries: [(&str, ParamValue); N]) -> ParamMap {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn example_search_config() -> SearchConfig {
    let mut space = BTreeMap::new();
    space.insert(
        "tau".to_string(),
        ParamSpec::Float { low: 0.0, high: 1.0, log: false },
    );
    space.insert(
        "lr".to_string(),
        ParamSpec::Float { low: 1e-4, high: 1e-1, log: true },
    );
    space.insert(
        "modulation_type".to_string(),
        ParamSpec::Categorical {
            choices: vec!["linear".into(), "cosine".into(), "step".into()],
        },
    );
    space.insert(
        "batch_size".to_string(),
        ParamSpec::Categorical {
            choices: vec![16i64.into(), 32i64.into(), 64i64.into()],
        },
    );
    SearchConfig {
        study: StudyConfig {
            name: Some("longtail".to_string()),
            ..Default::default()
        },
        hyperparameters: SearchSpace::new(space).unwrap_or_default(),
        fixed: params([
            ("epochs", 20i64.into()),
            ("loss", "modulated_ce".into()),
            ("monitor", "macro_f1".into()),
            ("patience", 5i64.into()),
        ]),
        data: DataConfig::default(),
    }
}

fn example_run_config() -> RunConfig {
    RunConfig {
        run_id: None,
        params: params([
            ("tau", 0.5.into()),
            ("modulation_type", "cosine".into()),
            ("epochs", 20i64.into()),
            ("lr", 0.01.into()),
            ("batch_size", 32i64.into()),
            ("monitor", "macro_f1".into()),
        ]),
        data: DataConfig::default(),
    }
}
