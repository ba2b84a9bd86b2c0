use std::{
    fs,
    path::{Path, PathBuf},
};

use argus_telemetry::LogLevel;
use serde::Deserialize;

use crate::{
    error::{MonitorError, MonitorResult},
    trainer::TrainingConfig,
};

/// Default logical model name.
pub const DEFAULT_MODEL_NAME: &str = "iargus";

/// Workspace configuration loaded from TOML.
#[derive(Debug, Clone)]
pub struct ArgusConfig {
    /// Logical model name used by the registry and the cycle lock.
    pub model_name: String,
    /// Resolved artifact locations.
    pub paths: PathsConfig,
    /// Training hyperparameters.
    pub training: TrainingConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    source_dir: PathBuf,
}

/// Filesystem locations; relative entries resolve against the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// JSON-lines record store.
    pub records: PathBuf,
    /// Model registry root.
    pub registry: PathBuf,
    /// Fitted encoder artifact.
    pub encoder: PathBuf,
    /// Monitoring state TOML.
    pub state: PathBuf,
    /// Alert outbox.
    pub outbox: PathBuf,
    /// Structured log file.
    pub log: PathBuf,
    /// Event log.
    pub events: PathBuf,
    /// Directory holding cycle locks.
    pub lock_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            records: "data/records.jsonl".into(),
            registry: "data/registry".into(),
            encoder: "data/encoder.json".into(),
            state: "monitoring.toml".into(),
            outbox: "data/alerts/outbox.jsonl".into(),
            log: "logs/monitor.log".into(),
            events: "logs/events.jsonl".into(),
            lock_dir: "data/locks".into(),
        }
    }
}

impl PathsConfig {
    fn resolve_against(&mut self, dir: &Path) {
        for path in [
            &mut self.records,
            &mut self.registry,
            &mut self.encoder,
            &mut self.state,
            &mut self.outbox,
            &mut self.log,
            &mut self.events,
            &mut self.lock_dir,
        ] {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Records below this level are dropped.
    pub min_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(default = "default_model_name")]
    model_name: String,
    #[serde(default)]
    paths: PathsConfig,
    #[serde(default)]
    training: TrainingConfig,
    #[serde(default)]
    logging: LoggingDocument,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingDocument {
    #[serde(default)]
    min_level: Option<String>,
}

fn default_model_name() -> String {
    DEFAULT_MODEL_NAME.to_string()
}

impl ArgusConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> MonitorResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            MonitorError::Config(format!("reading {}: {err}", path.display()))
        })?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml(&raw, source_dir)
    }

    /// Parses configuration text; relative paths resolve against `source_dir`.
    pub fn from_toml(raw: &str, source_dir: impl Into<PathBuf>) -> MonitorResult<Self> {
        let source_dir = source_dir.into();
        let document: ConfigDocument = toml::from_str(raw)?;
        if document.model_name.trim().is_empty() {
            return Err(MonitorError::Config("model_name must not be empty".into()));
        }
        document.training.validate()?;
        let min_level = match document.logging.min_level {
            Some(level) => level
                .parse()
                .map_err(|err: anyhow::Error| MonitorError::Config(err.to_string()))?,
            None => LogLevel::Info,
        };
        let mut paths = document.paths;
        paths.resolve_against(&source_dir);
        Ok(Self {
            model_name: document.model_name,
            paths,
            training: document.training,
            logging: LoggingConfig { min_level },
            source_dir,
        })
    }

    /// Defaults rooted at `dir`.
    #[must_use]
    pub fn with_root(dir: impl Into<PathBuf>) -> Self {
        let source_dir = dir.into();
        let mut paths = PathsConfig::default();
        paths.resolve_against(&source_dir);
        Self {
            model_name: default_model_name(),
            paths,
            training: TrainingConfig::default(),
            logging: LoggingConfig::default(),
            source_dir,
        }
    }

    /// Resolves a path relative to the configuration file.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        let candidate = candidate.as_ref();
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.source_dir.join(candidate)
        }
    }
}
