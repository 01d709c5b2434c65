//! Training loop controller.
//!
//! Drives one run epoch by epoch: seeded batches, class-reweighted loss,
//! AdamW update, cosine LR step, validation, early-stopping decision,
//! checkpoint writes, reporting and the epoch observer. A run restarted with
//! the same `run_id` and config resumes from its `last` checkpoint.

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tailtune_core::CorruptCheckpointPolicy;

use crate::data::DataSource;
use crate::error::{MlError, Result};
use crate::model::{Classifier, DenseClassifier};
use crate::tracking::RunReporter;
use crate::training::checkpoint::{Checkpoint, CheckpointStore, RngState, Slot};
use crate::training::config::TrainingConfig;
use crate::training::early_stopping::{EarlyStoppingMonitor, MonitorState};
use crate::training::metrics::{EpochSummary, ValidationMetrics, head_tail_masks};
use crate::training::optim::{AdamW, CosineAnnealingLr};
use crate::training::run::{RunStatus, TrainingRun};

/// Called after each epoch's checkpoint write. Returning
/// [`MlError::Pruned`] ends the run as pruned; any other error fails it.
pub trait EpochObserver {
    fn on_epoch_end(&mut self, run: &TrainingRun, summary: &EpochSummary) -> Result<()>;
}

/// Observer that never interrupts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl EpochObserver for NoopObserver {
    fn on_epoch_end(&mut self, _run: &TrainingRun, _summary: &EpochSummary) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    Initializing,
    RunningEpoch,
    Validating,
    Checkpointing,
    Finished,
    Failed,
}

/// Training-side results of one epoch.
struct EpochTraining {
    loss: f64,
    accuracy: f64,
    lr: f64,
    class_weights: Option<Vec<f64>>,
}

/// Mutable training state that checkpoints capture.
struct Session {
    optimizer: AdamW,
    scheduler: CosineAnnealingLr,
    monitor: EarlyStoppingMonitor,
}

pub struct Trainer<'a> {
    run_id: String,
    config: TrainingConfig,
    data: &'a dyn DataSource,
    store: CheckpointStore,
    reporter: RunReporter,
    on_corrupt: CorruptCheckpointPolicy,
    state: TrainerState,
}

impl<'a> Trainer<'a> {
    pub fn new(
        run_id: impl Into<String>,
        config: TrainingConfig,
        data: &'a dyn DataSource,
        store: CheckpointStore,
        reporter: RunReporter,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            config,
            data,
            store,
            reporter,
            on_corrupt: CorruptCheckpointPolicy::default(),
            state: TrainerState::Initializing,
        }
    }

    pub fn with_corrupt_policy(mut self, policy: CorruptCheckpointPolicy) -> Self {
        self.on_corrupt = policy;
        self
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Train the reference dense classifier described by the config.
    pub fn run(&mut self, observer: &mut dyn EpochObserver) -> Result<TrainingRun> {
        let mut model = DenseClassifier::new(
            self.data.feature_dim(),
            self.data.num_classes(),
            self.config.backbone,
            self.config.seed,
        );
        self.run_model(&mut model, observer)
    }

    /// Train `model`. Initialization problems (inconsistent data, corrupt
    /// checkpoint under the fail policy) are returned as errors; anything
    /// that goes wrong once epochs are running is recorded in the returned
    /// run with status `failed`.
    pub fn run_model(
        &mut self,
        model: &mut dyn Classifier,
        observer: &mut dyn EpochObserver,
    ) -> Result<TrainingRun> {
        self.transition(TrainerState::Initializing);
        let cfg = self.config.clone();
        let mut run = TrainingRun::new(&self.run_id, cfg.clone());

        let class_counts = self.data.class_counts();
        if class_counts.is_empty() || model.num_classes() != class_counts.len() {
            self.transition(TrainerState::Failed);
            return Err(MlError::config(format!(
                "model predicts {} classes but the dataset has {}",
                model.num_classes(),
                class_counts.len()
            )));
        }
        if self.data.validation().is_empty() {
            self.transition(TrainerState::Failed);
            return Err(MlError::config("validation split is empty"));
        }
        let (head_mask, tail_mask) = head_tail_masks(&class_counts, cfg.head_percentile);
        let config_hash = cfg.config_hash();

        let mut session = Session {
            optimizer: AdamW::new(cfg.weight_decay),
            scheduler: CosineAnnealingLr::new(cfg.lr, cfg.epochs),
            monitor: EarlyStoppingMonitor::new(
                cfg.patience,
                cfg.min_delta,
                cfg.monitor.direction(),
            ),
        };

        let start_epoch = match self.resume(&config_hash, model, &mut session) {
            Ok(Some(checkpoint)) => {
                run.history = checkpoint.history;
                run.resumed_from = Some(checkpoint.epoch);
                tracing::info!(
                    run_id = %self.run_id,
                    epoch = checkpoint.epoch,
                    best = ?session.monitor.best(),
                    "Resuming from checkpoint"
                );
                checkpoint.rng_state.next_epoch
            }
            Ok(None) => 0,
            Err(e) => {
                self.transition(TrainerState::Failed);
                return Err(e);
            }
        };
        self.sync_run(&mut run, &session.monitor, start_epoch);
        self.reporter.params(&self.run_id, &cfg.params);

        tracing::info!(
            run_id = %self.run_id,
            start_epoch,
            epochs = cfg.epochs,
            loss = cfg.loss.name(),
            monitor = cfg.monitor.name(),
            "Training started"
        );

        if session.monitor.is_stopped() {
            self.transition(TrainerState::Finished);
            run.finish(RunStatus::EarlyStopped);
            return Ok(run);
        }

        for epoch in start_epoch..cfg.epochs {
            self.transition(TrainerState::RunningEpoch);
            let trained = match self.train_epoch(epoch, model, &mut session, &class_counts) {
                Ok(trained) => trained,
                Err(e) => return Ok(self.fail(run, e)),
            };
            self.transition(TrainerState::Validating);
            let validation = match self.validate(epoch, model, &head_mask, &tail_mask) {
                Ok(validation) => validation,
                Err(e) => return Ok(self.fail(run, e)),
            };
            let summary = EpochSummary {
                epoch,
                train_loss: trained.loss,
                train_accuracy: trained.accuracy,
                monitored: validation.get(cfg.monitor),
                validation,
                lr: trained.lr,
                class_weights: trained.class_weights,
            };

            let observation = session.monitor.observe(summary.monitored);
            run.history.push(summary.clone());
            self.sync_run(&mut run, &session.monitor, epoch + 1);

            self.transition(TrainerState::Checkpointing);
            let checkpoint = match self.checkpoint(epoch, model, &session, &config_hash, &run) {
                Ok(checkpoint) => checkpoint,
                Err(e) => return Ok(self.fail(run, e)),
            };
            if let Err(e) = self.store.save(&self.run_id, Slot::Last, &checkpoint) {
                return Ok(self.fail(run, e));
            }
            if observation.improved {
                match self.store.save(&self.run_id, Slot::Best, &checkpoint) {
                    Ok(path) => self.reporter.artifact(&self.run_id, &path),
                    Err(e) => return Ok(self.fail(run, e)),
                }
            }

            self.reporter.epoch(&self.run_id, &summary);
            tracing::info!(
                run_id = %self.run_id,
                epoch,
                train_loss = summary.train_loss,
                val_loss = summary.validation.val_loss,
                val_accuracy = summary.validation.val_accuracy,
                macro_f1 = summary.validation.macro_f1,
                monitored = summary.monitored,
                improved = observation.improved,
                "Epoch finished"
            );

            if let Err(e) = observer.on_epoch_end(&run, &summary) {
                if e.is_pruned() {
                    tracing::info!(run_id = %self.run_id, epoch, "Run pruned");
                    self.transition(TrainerState::Finished);
                    run.finish(RunStatus::Pruned);
                    return Ok(run);
                }
                return Ok(self.fail(run, e));
            }

            if observation.state == MonitorState::Stopped {
                tracing::info!(
                    run_id = %self.run_id,
                    epoch,
                    patience = cfg.patience,
                    "Early stopping"
                );
                self.transition(TrainerState::Finished);
                run.finish(RunStatus::EarlyStopped);
                return Ok(run);
            }
        }

        self.transition(TrainerState::Finished);
        run.finish(RunStatus::Completed);
        tracing::info!(
            run_id = %self.run_id,
            best = ?run.best_metric,
            best_epoch = ?run.best_epoch,
            "Training completed"
        );
        Ok(run)
    }

    /// Restore the session from the `last` slot, if one matches.
    fn resume(
        &self,
        config_hash: &str,
        model: &mut dyn Classifier,
        session: &mut Session,
    ) -> Result<Option<Checkpoint>> {
        let loaded = self
            .store
            .load(&self.run_id, Slot::Last, config_hash)
            .and_then(|found| match found {
                Some(checkpoint) => {
                    restore(&self.run_id, &checkpoint, model, session).map(|()| Some(checkpoint))
                }
                None => Ok(None),
            });

        match loaded {
            Err(e @ MlError::CorruptCheckpoint { .. })
                if self.on_corrupt == CorruptCheckpointPolicy::StartFresh =>
            {
                tracing::warn!(
                    run_id = %self.run_id,
                    error = %e,
                    "Ignoring unusable checkpoint and starting fresh"
                );
                Ok(None)
            }
            other => other,
        }
    }

    fn train_epoch(
        &self,
        epoch: usize,
        model: &mut dyn Classifier,
        session: &mut Session,
        class_counts: &[usize],
    ) -> Result<EpochTraining> {
        let cfg = &self.config;
        let mut rng = epoch_rng(cfg.seed, epoch);
        let class_weights = cfg.loss.epoch_weights(class_counts, epoch)?;
        let lr = session.scheduler.lr();

        let batches = self
            .data
            .train_batches(epoch, cfg.batch_size, cfg.sampling, &mut rng)?;
        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for batch in batches {
            if batch.is_empty() {
                continue;
            }
            let logits: Vec<Vec<f64>> = batch.iter().map(|s| model.forward(&s.features)).collect();
            check_logits(epoch, &logits)?;
            let targets: Vec<usize> = batch.iter().map(|s| s.label).collect();
            let out = cfg
                .loss
                .evaluate_with_grad(&logits, &targets, class_weights.as_deref())?;
            if !out.loss.is_finite() {
                return Err(MlError::NumericalInstability {
                    epoch,
                    detail: format!("training loss is {}", out.loss),
                });
            }

            model.zero_grad();
            for (sample, grad) in batch.iter().zip(&out.grad_logits) {
                model.backward(&sample.features, grad);
            }
            let (params, grads) = model.params_and_grads();
            session.optimizer.step(params, grads, lr);
            if params.iter().any(|p| !p.is_finite()) {
                return Err(MlError::NumericalInstability {
                    epoch,
                    detail: "non-finite parameter after optimizer step".into(),
                });
            }

            loss_sum += out.loss * batch.len() as f64;
            correct += logits
                .iter()
                .zip(&targets)
                .filter(|(row, t)| argmax(row) == **t)
                .count();
            seen += batch.len();
        }
        session.scheduler.step();

        let seen = seen.max(1) as f64;
        Ok(EpochTraining {
            loss: loss_sum / seen,
            accuracy: correct as f64 / seen,
            lr,
            class_weights,
        })
    }

    /// Validation uses uniform class weights.
    fn validate(
        &self,
        epoch: usize,
        model: &dyn Classifier,
        head_mask: &[bool],
        tail_mask: &[bool],
    ) -> Result<ValidationMetrics> {
        let samples = self.data.validation();
        let logits: Vec<Vec<f64>> = samples.iter().map(|s| model.forward(&s.features)).collect();
        check_logits(epoch, &logits)?;
        let targets: Vec<usize> = samples.iter().map(|s| s.label).collect();
        let val_loss = self.config.loss.evaluate_with_grad(&logits, &targets, None)?.loss;
        if !val_loss.is_finite() {
            return Err(MlError::NumericalInstability {
                epoch,
                detail: format!("validation loss is {val_loss}"),
            });
        }
        let predictions: Vec<usize> = logits.iter().map(|row| argmax(row)).collect();
        Ok(ValidationMetrics::compute(
            &predictions,
            &targets,
            val_loss,
            head_mask,
            tail_mask,
        ))
    }

    fn checkpoint(
        &self,
        epoch: usize,
        model: &dyn Classifier,
        session: &Session,
        config_hash: &str,
        run: &TrainingRun,
    ) -> Result<Checkpoint> {
        Ok(Checkpoint {
            epoch,
            model_state: model.state_dict(),
            optimizer_state: serde_json::to_value(&session.optimizer)?,
            scheduler_state: serde_json::to_value(session.scheduler)?,
            best_metric_at_save: session.monitor.best(),
            monitor: session.monitor.snapshot(),
            rng_state: RngState {
                seed: self.config.seed,
                next_epoch: epoch + 1,
            },
            config_hash: config_hash.to_string(),
            history: run.history.clone(),
            saved_at: Utc::now(),
        })
    }

    fn sync_run(&self, run: &mut TrainingRun, monitor: &EarlyStoppingMonitor, next_epoch: usize) {
        run.current_epoch = next_epoch;
        run.best_metric = monitor.best();
        run.epochs_without_improvement = monitor.epochs_without_improvement();
        run.best_epoch = monitor.best().and_then(|best| {
            run.history
                .iter()
                .rev()
                .find(|s| s.monitored == best)
                .map(|s| s.epoch)
        });
    }

    fn fail(&mut self, mut run: TrainingRun, error: MlError) -> TrainingRun {
        tracing::error!(run_id = %self.run_id, error = %error, "Training failed");
        self.transition(TrainerState::Failed);
        run.fail(error);
        run
    }

    fn transition(&mut self, next: TrainerState) {
        if self.state != next {
            tracing::debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "Trainer state");
            self.state = next;
        }
    }
}

/// Apply a checkpoint to the model and session. Nothing is modified unless
/// every part decodes.
fn restore(
    run_id: &str,
    checkpoint: &Checkpoint,
    model: &mut dyn Classifier,
    session: &mut Session,
) -> Result<()> {
    let corrupt = |reason: String| MlError::CorruptCheckpoint {
        run_id: run_id.to_string(),
        slot: Slot::Last.to_string(),
        reason,
    };
    let optimizer: AdamW = serde_json::from_value(checkpoint.optimizer_state.clone())
        .map_err(|e| corrupt(format!("optimizer state: {e}")))?;
    let scheduler: CosineAnnealingLr = serde_json::from_value(checkpoint.scheduler_state.clone())
        .map_err(|e| corrupt(format!("scheduler state: {e}")))?;
    model
        .load_state_dict(&checkpoint.model_state)
        .map_err(|e| corrupt(format!("model state: {e}")))?;

    session.optimizer = optimizer;
    session.scheduler = scheduler;
    session.monitor.restore(&checkpoint.monitor);
    Ok(())
}

/// Random stream for one epoch, independent of how many epochs ran before
/// it in this process.
fn epoch_rng(seed: u64, epoch: usize) -> StdRng {
    let mixed = seed ^ (epoch as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(mixed)
}

fn check_logits(epoch: usize, logits: &[Vec<f64>]) -> Result<()> {
    if logits.iter().flatten().any(|z| !z.is_finite()) {
        return Err(MlError::NumericalInstability {
            epoch,
            detail: "model produced non-finite logits".into(),
        });
    }
    Ok(())
}

fn argmax(row: &[f64]) -> usize {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i)
}
