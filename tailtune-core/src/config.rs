//! Configuration system for tailtune.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Settings are
//! read from `~/.config/tailtune/config.toml` and/or `.tailtune/config.toml`
//! in the workspace directory.
//!
//! Search and run documents (the files passed to `run-search` and
//! `run-training`) are loaded through [`load_document`], which picks the
//! provider from the file extension.

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Orchestrator-wide settings (not hyperparameters).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub resume: ResumeConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

impl Settings {
    /// Reject settings that would scatter run files into the workspace root.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("paths.runs_dir", &self.paths.runs_dir),
            ("paths.tracking_dir", &self.paths.tracking_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::invalid(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Where runs, tracking records and logs are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for checkpoints and study reports, relative to the workspace.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    /// Root for the file-backed tracking store.
    #[serde(default = "default_tracking_dir")]
    pub tracking_dir: PathBuf,
    /// Directory for the JSON log file. Falls back to the platform data dir.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            tracking_dir: default_tracking_dir(),
            log_dir: None,
        }
    }
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_tracking_dir() -> PathBuf {
    PathBuf::from("runs/tracking")
}

/// What to do when a run's `last` checkpoint cannot be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptCheckpointPolicy {
    /// Abort the run with a corrupt-checkpoint error.
    #[default]
    Fail,
    /// Discard the unusable checkpoint and train from epoch 0.
    StartFresh,
}

impl std::fmt::Display for CorruptCheckpointPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::StartFresh => write!(f, "start_fresh"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeConfig {
    #[serde(default)]
    pub on_corrupt: CorruptCheckpointPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Disable to run without writing tracking records.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Load settings from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TAILTUNE_`, nested with `__`)
/// 3. Explicit config file (`--config`)
/// 4. Workspace-local config (`.tailtune/config.toml`)
/// 5. User config (`~/.config/tailtune/config.toml`)
/// 6. Built-in defaults
pub fn load_settings(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&Settings>,
) -> Result<Settings, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "tailtune", "tailtune") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".tailtune").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // TAILTUNE_PATHS__RUNS_DIR, TAILTUNE_RESUME__ON_CORRUPT, ...
    figment = figment.merge(Env::prefixed("TAILTUNE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let settings: Settings = figment.extract().map_err(Box::new)?;
    settings.validate()?;
    tracing::debug!(
        runs_dir = %settings.paths.runs_dir.display(),
        on_corrupt = %settings.resume.on_corrupt,
        "Loaded settings"
    );
    Ok(settings)
}

/// Load a configuration document (TOML or JSON) into `T`.
///
/// Only the file itself is consulted; environment variables do not leak into
/// search spaces or run parameters.
pub fn load_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::from(Toml::file(path)),
        Some("json") => Figment::from(Json::file(path)),
        _ => {
            return Err(ConfigError::UnsupportedFormat {
                path: path.to_path_buf(),
            });
        }
    };
    figment.extract().map_err(|e| ConfigError::Parse(Box::new(e)))
}

/// Resolve a settings path against the workspace unless it is already absolute.
pub fn resolve_path(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.paths.runs_dir, PathBuf::from("runs"));
        assert_eq!(settings.resume.on_corrupt, CorruptCheckpointPolicy::Fail);
        assert!(settings.tracking.enabled);
    }

    #[test]
    fn test_settings_toml_roundtrip() {
        let settings = Settings::default();
        let toml_str = toml::to_string(&settings).unwrap();
        let parsed: Settings = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_workspace_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg_dir = dir.path().join(".tailtune");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[resume]\non_corrupt = \"start_fresh\"\n[paths]\nruns_dir = \"out\"\n",
        )
        .unwrap();

        let settings = load_settings(Some(dir.path()), None, None).unwrap();
        assert_eq!(settings.resume.on_corrupt, CorruptCheckpointPolicy::StartFresh);
        assert_eq!(settings.paths.runs_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_explicit_overrides_win() {
        let mut overrides = Settings::default();
        overrides.tracking.enabled = false;
        let settings = load_settings(None, None, Some(&overrides)).unwrap();
        assert!(!settings.tracking.enabled);
    }

    #[test]
    fn test_empty_runs_dir_is_invalid() {
        let mut overrides = Settings::default();
        overrides.paths.runs_dir = PathBuf::new();
        let err = load_settings(None, None, Some(&overrides)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("paths.runs_dir"));
    }

    #[test]
    fn test_missing_explicit_config_file() {
        let err = load_settings(None, Some(Path::new("/nonexistent/tailtune.toml")), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_document_by_extension() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Doc {
            name: String,
            n: u32,
        }

        let dir = TempDir::new().unwrap();
        let toml_path = dir.path().join("doc.toml");
        std::fs::write(&toml_path, "name = \"a\"\nn = 3\n").unwrap();
        let json_path = dir.path().join("doc.json");
        std::fs::write(&json_path, r#"{"name": "b", "n": 4}"#).unwrap();
        let yaml_path = dir.path().join("doc.yaml");
        std::fs::write(&yaml_path, "name: c").unwrap();

        let a: Doc = load_document(&toml_path).unwrap();
        let b: Doc = load_document(&json_path).unwrap();
        assert_eq!(a, Doc { name: "a".into(), n: 3 });
        assert_eq!(b, Doc { name: "b".into(), n: 4 });
        assert!(matches!(
            load_document::<Doc>(&yaml_path),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_resolve_path() {
        let ws = Path::new("/work");
        assert_eq!(resolve_path(ws, Path::new("runs")), PathBuf::from("/work/runs"));
        assert_eq!(resolve_path(ws, Path::new("/abs")), PathBuf::from("/abs"));
    }
}
