//! Hyperparameter search: space, strategies, pruning and the trial scheduler.

pub mod config;
pub mod history;
pub mod pruner;
pub mod report;
pub mod scheduler;
pub mod space;
pub mod strategy;

pub use config::{SearchConfig, StudyConfig};
pub use history::{SearchHistory, TrialRecord};
pub use pruner::{Pruner, PrunerConfig, PrunerKind};
pub use report::StudyReport;
pub use scheduler::{TrialContext, TrialScheduler};
pub use space::{ParamSpec, SearchSpace};
pub use strategy::{SamplerConfig, SamplerKind, SearchStrategy};
