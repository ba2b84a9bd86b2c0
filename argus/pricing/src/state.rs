use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{MonitorError, MonitorResult},
    storage::write_atomic,
};

/// Default accuracy bound, as a fraction.
pub const DEFAULT_MAPE_THRESHOLD: f64 = 0.15;

/// Bookkeeping carried between monitoring cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitoringState {
    /// Date of the last successful registration; `None` before the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_training_date: Option<NaiveDate>,
    /// Highest acceptable MAPE (inclusive). Operator-set.
    #[serde(default = "default_threshold", alias = "MAPE_threshold")]
    pub mape_threshold: f64,
}

const fn default_threshold() -> f64 {
    DEFAULT_MAPE_THRESHOLD
}

impl Default for MonitoringState {
    fn default() -> Self {
        Self {
            last_training_date: None,
            mape_threshold: DEFAULT_MAPE_THRESHOLD,
        }
    }
}

impl MonitoringState {
    /// Rejects a threshold that is zero, negative, or not finite.
    pub fn validate(&self) -> MonitorResult<()> {
        if self.mape_threshold.is_finite() && self.mape_threshold > 0.0 {
            Ok(())
        } else {
            Err(MonitorError::InvalidState(format!(
                "mape_threshold {} must be a positive fraction",
                self.mape_threshold
            )))
        }
    }

    /// Copy with `last_training_date` moved to `date`.
    #[must_use]
    pub const fn trained_on(self, date: NaiveDate) -> Self {
        Self {
            last_training_date: Some(date),
            mape_threshold: self.mape_threshold,
        }
    }

    /// Inclusive accuracy check.
    #[must_use]
    pub fn accepts(&self, mape: f64) -> bool {
        mape <= self.mape_threshold
    }
}

/// Persistence for [`MonitoringState`].
pub trait StateStore: Send + Sync {
    /// Reads and validates the current state.
    fn load(&self) -> MonitorResult<MonitoringState>;
    /// Replaces the state in one step.
    fn save(&self, state: &MonitoringState) -> MonitorResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    monitoring: MonitoringState,
}

/// State kept in a TOML file under a `[monitoring]` table.
#[derive(Debug, Clone)]
pub struct TomlStateStore {
    path: PathBuf,
}

impl TomlStateStore {
    /// Store at `path`; a missing file reads as the default state.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for TomlStateStore {
    fn load(&self) -> MonitorResult<MonitoringState> {
        if !self.path.exists() {
            return Ok(MonitoringState::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        let document: StateDocument = toml::from_str(&raw)?;
        document.monitoring.validate()?;
        Ok(document.monitoring)
    }

    fn save(&self, state: &MonitoringState) -> MonitorResult<()> {
        state.validate()?;
        let document = StateDocument { monitoring: *state };
        let raw = toml::to_string_pretty(&document)?;
        write_atomic(&self.path, raw.as_bytes())
    }
}

/// In-process state store that counts saves.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<RwLock<MonitoringState>>,
    saves: Arc<RwLock<usize>>,
}

impl MemoryStateStore {
    /// Store seeded with `state`.
    #[must_use]
    pub fn new(state: MonitoringState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            saves: Arc::default(),
        }
    }

    /// Current state without validation.
    #[must_use]
    pub fn current(&self) -> MonitoringState {
        *self.state.read()
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.read()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> MonitorResult<MonitoringState> {
        let state = *self.state.read();
        state.validate()?;
        Ok(state)
    }

    fn save(&self, state: &MonitoringState) -> MonitorResult<()> {
        state.validate()?;
        *self.state.write() = *state;
        *self.saves.write() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::fixtures::date;
    use tempfile::tempdir;

    #[test]
    fn toml_store_defaults_then_round_trips() {
        let dir = tempdir().unwrap();
        let store = TomlStateStore::new(dir.path().join("monitoring.toml"));
        assert_eq!(store.load().unwrap(), MonitoringState::default());

        let state = MonitoringState {
            last_training_date: Some(date(2024, 6, 1)),
            mape_threshold: 0.12,
        };
        store.save(&state).unwrap();
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("[monitoring]"));
        assert!(raw.contains("last_training_date = \"2024-06-01\""));
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn accepts_operator_spelling_of_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitoring.toml");
        fs::write(&path, "[monitoring]\nMAPE_threshold = 0.2\n").unwrap();
        let state = TomlStateStore::new(&path).load().unwrap();
        assert!((state.mape_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(state.last_training_date, None);
    }

    #[test]
    fn rejects_non_positive_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitoring.toml");
        fs::write(&path, "[monitoring]\nmape_threshold = 0.0\n").unwrap();
        assert!(matches!(
            TomlStateStore::new(&path).load(),
            Err(MonitorError::InvalidState(_))
        ));
    }

    #[test]
    fn threshold_is_inclusive() {
        let state = MonitoringState::default();
        assert!(state.accepts(0.15));
        assert!(!state.accepts(0.150_001));
        let moved = state.trained_on(date(2024, 2, 2));
        assert_eq!(moved.last_training_date, Some(date(2024, 2, 2)));
        assert!((moved.mape_threshold - state.mape_threshold).abs() < f64::EPSILON);
    }
}
