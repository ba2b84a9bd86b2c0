#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(clippy::module_name_repetitions)]

//! Used-car price model and the accuracy monitoring loop that keeps it fresh.
//!
//! Records are one-hot encoded with a persisted vocabulary, fitted by a small
//! feed-forward network, registered as immutable versions, and re-scored on
//! newly observed sales by [`monitor::Monitor`]. When the error exceeds the
//! operator threshold the loop retrains once and alerts if that does not help.

/// Operator alerts and their transports.
pub mod alerting;
/// TOML workspace configuration.
pub mod config;
/// One-hot feature encoder and its persistence.
pub mod encoder;
/// Error type shared by every component.
pub mod error;
/// MAPE metric and model scoring.
pub mod evaluator;
/// Single-flight cycle lock.
pub mod guard;
/// The monitoring and retraining state machine.
pub mod monitor;
/// Feed-forward regression network.
pub mod network;
/// Car-sale records and record stores.
pub mod records;
/// Versioned model registry.
pub mod registry;
/// Prediction path.
pub mod serving;
/// Monitoring bookkeeping.
pub mod state;
mod storage;
/// Logging and event handle for the loop.
pub mod telemetry;
/// Holdout split, fitting, and registration.
pub mod trainer;

pub use alerting::{AlertKind, AlertMessage, Notifier, OutboxNotifier, TelemetryNotifier};
pub use config::ArgusConfig;
pub use encoder::{EncoderState, EncoderStore, FeatureEncoder, FileEncoderStore, MemoryEncoderStore};
pub use error::{MonitorError, MonitorResult};
pub use evaluator::{mape, Evaluation, Evaluator, ModelScorer};
pub use guard::{CycleGuard, LockHolder, StaleLock};
pub use monitor::{CycleOutcome, CycleReport, Monitor, MonitorDeps, MonitorPhase};
pub use network::PriceNetwork;
pub use records::{CarFeatures, CarRecord, JsonlRecordStore, MemoryRecordStore, RecordStore};
pub use registry::{FsModelRegistry, MemoryModelRegistry, ModelRegistry, ModelVersion, ScoredModel};
pub use serving::{PredictionResponse, PredictionService};
pub use state::{MemoryStateStore, MonitoringState, StateStore, TomlStateStore};
pub use telemetry::{MonitorTelemetry, MonitorTelemetryBuilder};
pub use trainer::{ModelTrainer, Trainer, TrainingConfig, TrainingRun};
