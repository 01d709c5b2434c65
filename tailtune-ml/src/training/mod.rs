//! Training: class reweighting, losses, the optimizer, checkpoints, early
//! stopping and the epoch loop.

pub mod checkpoint;
pub mod class_weights;
pub mod config;
pub mod early_stopping;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod run;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointSummary, Slot};
pub use class_weights::{ClassWeightSchedule, ModulationType};
pub use config::{Direction, MonitorMetric, RunConfig, TrainingConfig};
pub use early_stopping::{EarlyStoppingMonitor, MonitorState};
pub use loss::LossFunction;
pub use metrics::{EpochSummary, ValidationMetrics};
pub use run::{RunStatus, TrainingRun};
pub use trainer::{EpochObserver, NoopObserver, Trainer, TrainerState};
