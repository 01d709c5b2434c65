//! Error types for the tailtune-ml crate.

use thiserror::Error;

/// Top-level error type for training and search operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Corrupt checkpoint for run '{run_id}' ({slot}): {reason}")]
    CorruptCheckpoint {
        run_id: String,
        slot: String,
        reason: String,
    },

    #[error("Trial pruned at epoch {epoch} (value {value:.4})")]
    Pruned { epoch: usize, value: f64 },

    #[error("Numerical instability at epoch {epoch}: {detail}")]
    NumericalInstability { epoch: usize, detail: String },

    #[error("Training error: {0}")]
    Training(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MlError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True for the cooperative pruning signal.
    pub fn is_pruned(&self) -> bool {
        matches!(self, Self::Pruned { .. })
    }
}

impl From<tailtune_core::ConfigError> for MlError {
    fn from(err: tailtune_core::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Errors from a tracking store. Never propagated past the run reporter.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("Tracking store unavailable: {0}")]
    Unavailable(String),

    #[error("Tracking IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MlError>;
