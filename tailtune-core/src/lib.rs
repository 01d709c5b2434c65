//! # tailtune-core
//!
//! Shared foundation for the tailtune workspace: layered orchestrator
//! settings and atomic persistence helpers.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{CorruptCheckpointPolicy, Settings, load_document, load_settings};
pub use error::ConfigError;
