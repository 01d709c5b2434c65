//! # tailtune-ml : long-tail training and hyperparameter search
//!
//! Trains classifiers on imbalanced data with a curriculum class-weight
//! schedule, checkpoints every epoch so interrupted runs resume where they
//! stopped, and drives sequential hyperparameter studies with pruning.

pub mod data;
pub mod error;
pub mod model;
pub mod params;
pub mod search;
pub mod tracking;
pub mod training;

// Re-exports
pub use data::{DataConfig, DataSource, InMemoryDataset, Sample, SyntheticLongTail};
pub use error::{MlError, Result, TrackingError};
pub use model::{Backbone, Classifier, DenseClassifier};
pub use params::{ParamMap, ParamValue};
pub use search::{SearchConfig, StudyReport, TrialScheduler};
pub use tracking::{FileTrackingStore, MemoryTrackingStore, RunReporter, TrackingStore};
pub use training::{CheckpointStore, Slot, Trainer, TrainingConfig, TrainingRun};
