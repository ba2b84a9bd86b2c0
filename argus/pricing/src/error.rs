use std::path::Path;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the pricing model, its gateways, and the monitoring loop.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// No fitted encoder artifact exists.
    #[error("no fitted feature encoder at {path}; fit the encoder before training or serving")]
    EncoderNotFound {
        /// Location that was searched.
        path: String,
    },
    /// The persisted encoder is not the fit the model was trained against.
    #[error("encoder {found} does not match encoder {expected} used by model version {version}")]
    EncoderMismatch {
        /// Fingerprint recorded in the model.
        expected: Uuid,
        /// Fingerprint of the loaded encoder.
        found: Uuid,
        /// Model version that was checked.
        version: u32,
    },
    /// No model registered under the requested name.
    #[error("no model registered under `{name}`")]
    ModelNotFound {
        /// Logical model name.
        name: String,
    },
    /// No records available for the requested window.
    #[error("no records available: {context}")]
    EmptyDataset {
        /// What was being computed.
        context: String,
    },
    /// Fitting raised or produced a non-finite loss.
    #[error("training failed: {reason}")]
    TrainingFailure {
        /// Failure description.
        reason: String,
    },
    /// A metric came out NaN or infinite.
    #[error("{metric} is not finite")]
    NonFiniteMetric {
        /// Metric name.
        metric: String,
    },
    /// A record violates the data model.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// A target price is zero, negative, or not finite.
    #[error("invalid target at row {row}: {value} (prices must be positive)")]
    InvalidTarget {
        /// Row index.
        row: usize,
        /// Offending value.
        value: f64,
    },
    /// Feature matrix and targets or weights disagree on shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Model registry operation failed.
    #[error("model registry {operation} failed: {message}")]
    Registry {
        /// Operation name.
        operation: String,
        /// Underlying failure.
        message: String,
    },
    /// Record store operation failed.
    #[error("record store {operation} failed: {message}")]
    RecordStore {
        /// Operation name.
        operation: String,
        /// Underlying failure.
        message: String,
    },
    /// Notification transport failed.
    #[error("alert delivery failed: {reason}")]
    AlertDelivery {
        /// Failure description.
        reason: String,
    },
    /// Another cycle holds the single-flight guard.
    #[error("a monitoring cycle for `{model}` is already running (lock {path})")]
    CycleInProgress {
        /// Logical model name.
        model: String,
        /// Lock file path.
        path: String,
    },
    /// Monitoring state failed validation.
    #[error("invalid monitoring state: {0}")]
    InvalidState(String),
    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// TOML decoding failure.
    #[error("toml parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
    /// TOML encoding failure.
    #[error("toml encode error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Result alias used across the crate.
pub type MonitorResult<T> = Result<T, MonitorError>;

impl MonitorError {
    /// Encoder missing at `path`.
    #[must_use]
    pub fn encoder_not_found(path: &Path) -> Self {
        Self::EncoderNotFound {
            path: path.display().to_string(),
        }
    }

    /// No model under `name`.
    #[must_use]
    pub fn model_not_found(name: impl Into<String>) -> Self {
        Self::ModelNotFound { name: name.into() }
    }

    /// Empty window while computing `context`.
    #[must_use]
    pub fn empty(context: impl Into<String>) -> Self {
        Self::EmptyDataset {
            context: context.into(),
        }
    }

    /// Training failure with a reason.
    #[must_use]
    pub fn training(reason: impl Into<String>) -> Self {
        Self::TrainingFailure {
            reason: reason.into(),
        }
    }

    /// Registry failure wrapping any displayable error.
    #[must_use]
    pub fn registry(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Registry {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Record store failure wrapping any displayable error.
    #[must_use]
    pub fn record_store(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::RecordStore {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// True for conditions that must reach an operator rather than being
    /// recovered inside the cycle.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        !matches!(
            self,
            Self::ModelNotFound { .. } | Self::EmptyDataset { .. } | Self::CycleInProgress { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_availability_is_not_infrastructure() {
        assert!(!MonitorError::model_not_found("iargus").is_infrastructure());
        assert!(!MonitorError::empty("incremental fetch").is_infrastructure());
        assert!(MonitorError::training("loss diverged").is_infrastructure());
        assert!(MonitorError::encoder_not_found(Path::new("enc.json")).is_infrastructure());
    }

    #[test]
    fn messages_name_the_condition() {
        let err = MonitorError::registry("register", "disk full");
        assert_eq!(err.to_string(), "model registry register failed: disk full");
        let err = MonitorError::InvalidTarget { row: 3, value: 0.0 };
        assert!(err.to_string().contains("row 3"));
    }
}
