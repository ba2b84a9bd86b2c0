use std::{fmt, path::PathBuf, sync::Arc};

use argus_telemetry::LogLevel;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    alerting::{AlertMessage, Notifier},
    encoder::{EncoderState, EncoderStore, FeatureEncoder},
    error::{MonitorError, MonitorResult},
    evaluator::ModelScorer,
    guard::CycleGuard,
    records::{targets, CarRecord, RecordStore},
    registry::{ModelRegistry, ModelVersion, ScoredModel},
    state::{MonitoringState, StateStore},
    telemetry::MonitorTelemetry,
    trainer::{ModelTrainer, TrainingRun},
};

/// Phases a cycle moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    /// Waiting for a trigger.
    Idle,
    /// Loading state and records added since the last training.
    FetchingIncremental,
    /// First training run because no model is registered.
    Bootstrapping,
    /// Scoring the production model on the incremental records.
    Evaluating,
    /// Training against a re-fitted encoder or on operator request.
    Refreshing,
    /// Retraining on the full record set.
    Retraining,
    /// Scoring the new model on its held-out split.
    ReEvaluating,
    /// Accuracy is within the threshold.
    Pass,
    /// Notifying the operator.
    Alerting,
}

/// Terminal result of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Nothing was added since the last training.
    NoNewData,
    /// No model and no records; nothing to bootstrap from.
    EmptyStore,
    /// First model trained and registered.
    Bootstrapped {
        /// Held-out MAPE of the new model.
        mape: f64,
        /// Registered version.
        version: ModelVersion,
    },
    /// A model was trained for the current encoder outside the accuracy path,
    /// after an encoder re-fit or on operator request.
    Refreshed {
        /// Version that was current before, if any.
        previous_version: Option<ModelVersion>,
        /// Held-out MAPE of the new model.
        mape: f64,
        /// Registered version.
        version: ModelVersion,
    },
    /// Production model is within the threshold.
    Passed {
        /// MAPE on the incremental records.
        mape: f64,
    },
    /// Retraining restored accuracy.
    RetrainedPassed {
        /// MAPE of the previous model on the incremental records.
        old_mape: f64,
        /// Held-out MAPE of the retrained model.
        new_mape: f64,
        /// Registered version.
        version: ModelVersion,
    },
    /// Retraining did not restore accuracy; the operator was alerted.
    RetrainedFailedAlerted {
        /// MAPE of the previous model on the incremental records.
        old_mape: f64,
        /// Held-out MAPE of the retrained model.
        new_mape: f64,
        /// Registered version.
        version: ModelVersion,
        /// Whether the alert transport accepted the message.
        alert_delivered: bool,
    },
}

impl CycleOutcome {
    /// Short label used in logs and events.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NoNewData => "no_new_data",
            Self::EmptyStore => "empty_store",
            Self::Bootstrapped { .. } => "bootstrapped",
            Self::Refreshed { .. } => "refreshed",
            Self::Passed { .. } => "passed",
            Self::RetrainedPassed { .. } => "retrained_passed",
            Self::RetrainedFailedAlerted { .. } => "retrained_failed_alerted",
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoNewData | Self::EmptyStore => f.write_str(self.label()),
            Self::Bootstrapped { mape, version } => {
                write!(f, "bootstrapped(v{version}, {mape:.4})")
            }
            Self::Refreshed { mape, version, .. } => {
                write!(f, "refreshed(v{version}, {mape:.4})")
            }
            Self::Passed { mape } => write!(f, "passed({mape:.4})"),
            Self::RetrainedPassed {
                old_mape, new_mape, ..
            } => write!(f, "retrained_passed({old_mape:.4}, {new_mape:.4})"),
            Self::RetrainedFailedAlerted {
                old_mape, new_mape, ..
            } => write!(f, "retrained_failed_alerted({old_mape:.4}, {new_mape:.4})"),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Cycle identifier, also present in every log line of the cycle.
    pub cycle_id: Uuid,
    /// Terminal outcome.
    pub outcome: CycleOutcome,
    /// Phases visited, in order, starting and ending with `Idle`.
    pub phases: Vec<MonitorPhase>,
    /// State after the cycle: committed if a model was registered, otherwise the input.
    pub state: MonitoringState,
}

/// Collaborators of the monitoring loop.
#[derive(Clone)]
pub struct MonitorDeps {
    /// Source of sale records.
    pub records: Arc<dyn RecordStore>,
    /// Fitted encoder artifact.
    pub encoders: Arc<dyn EncoderStore>,
    /// Versioned models.
    pub registry: Arc<dyn ModelRegistry>,
    /// Fits and registers models.
    pub trainer: Arc<dyn ModelTrainer>,
    /// Scores models.
    pub scorer: Arc<dyn ModelScorer>,
    /// Operator alerts.
    pub notifier: Arc<dyn Notifier>,
    /// Bookkeeping.
    pub state: Arc<dyn StateStore>,
}

/// Accuracy monitoring and retraining loop for one logical model.
#[derive(Clone)]
pub struct Monitor {
    model_name: String,
    lock_dir: PathBuf,
    deps: MonitorDeps,
    telemetry: MonitorTelemetry,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("model_name", &self.model_name)
            .field("lock_dir", &self.lock_dir)
            .finish_non_exhaustive()
    }
}

struct Cycle<'a> {
    monitor: &'a Monitor,
    id: Uuid,
    phases: Vec<MonitorPhase>,
    state: MonitoringState,
}

impl Cycle<'_> {
    fn enter(&mut self, phase: MonitorPhase) {
        self.phases.push(phase);
        self.monitor.log(
            LogLevel::Debug,
            "monitor.phase",
            json!({ "cycle_id": self.id, "phase": phase }),
        );
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        let mut metadata = metadata;
        if let Value::Object(map) = &mut metadata {
            map.insert("cycle_id".into(), json!(self.id));
        }
        self.monitor.log(level, message, metadata);
    }
}

impl Monitor {
    /// Monitor for `model_name`, locking under `lock_dir`.
    #[must_use]
    pub fn new(
        model_name: impl Into<String>,
        lock_dir: impl Into<PathBuf>,
        deps: MonitorDeps,
        telemetry: MonitorTelemetry,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            lock_dir: lock_dir.into(),
            deps,
            telemetry,
        }
    }

    /// Logical model name.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        let _ = self.telemetry.log(level, message, metadata);
    }

    /// Runs one cycle as of `today`.
    ///
    /// Infrastructure failures are reported to the operator before being
    /// returned; the monitoring state is only written after a registration.
    pub fn run_cycle(&self, today: NaiveDate) -> MonitorResult<CycleReport> {
        self.run(today, Self::execute)
    }

    /// Trains and registers a model on every stored record against the
    /// current encoder, regardless of accuracy. Used after `fit-encoder`.
    pub fn retrain_now(&self, today: NaiveDate) -> MonitorResult<CycleReport> {
        self.run(today, |monitor, cycle, today| {
            cycle.state = monitor.deps.state.load()?;
            let previous = monitor.current_model()?.map(|model| model.version);
            let encoder = monitor.deps.encoders.load()?;
            monitor.refresh(cycle, &encoder, today, previous)
        })
    }

    fn run(
        &self,
        today: NaiveDate,
        body: impl FnOnce(&Self, &mut Cycle<'_>, NaiveDate) -> MonitorResult<CycleOutcome>,
    ) -> MonitorResult<CycleReport> {
        let guard = CycleGuard::acquire(&self.lock_dir, &self.model_name)?;
        let mut cycle = Cycle {
            monitor: self,
            id: Uuid::new_v4(),
            phases: vec![MonitorPhase::Idle],
            state: MonitoringState::default(),
        };
        let _ = self.telemetry.event(
            "monitoring.cycle.started",
            json!({ "cycle_id": cycle.id, "model": self.model_name }),
        );
        if let Some(stale) = guard.reclaimed() {
            cycle.log(
                LogLevel::Warn,
                "monitor.lock.reclaimed",
                json!({ "lock": guard.path(), "stale": stale }),
            );
        }

        match body(self, &mut cycle, today) {
            Ok(outcome) => {
                cycle.phases.push(MonitorPhase::Idle);
                cycle.log(
                    LogLevel::Info,
                    "monitor.cycle.completed",
                    json!({ "outcome": outcome.label(), "detail": outcome.to_string() }),
                );
                let _ = self.telemetry.event(
                    "monitoring.cycle.completed",
                    json!({ "cycle_id": cycle.id, "model": self.model_name, "result": outcome }),
                );
                Ok(CycleReport {
                    cycle_id: cycle.id,
                    outcome,
                    phases: cycle.phases,
                    state: cycle.state,
                })
            }
            Err(err) => {
                cycle.log(
                    LogLevel::Error,
                    "monitor.cycle.failed",
                    json!({ "error": err.to_string(), "infrastructure": err.is_infrastructure() }),
                );
                let _ = self.telemetry.event(
                    "monitoring.cycle.failed",
                    json!({ "cycle_id": cycle.id, "model": self.model_name, "error": err.to_string() }),
                );
                if err.is_infrastructure() {
                    let alert = match &err {
                        MonitorError::TrainingFailure { reason } => {
                            AlertMessage::training_failure(&self.model_name, reason)
                        }
                        other => AlertMessage::cycle_failure(&self.model_name, other),
                    };
                    self.dispatch(&cycle, &alert);
                }
                Err(err)
            }
        }
    }

    fn execute(&self, cycle: &mut Cycle<'_>, today: NaiveDate) -> MonitorResult<CycleOutcome> {
        cycle.enter(MonitorPhase::FetchingIncremental);
        cycle.state = self.deps.state.load()?;
        cycle.log(
            LogLevel::Info,
            "monitor.cycle.start",
            json!({
                "model": self.model_name,
                "threshold": cycle.state.mape_threshold,
                "last_training_date": cycle.state.last_training_date,
            }),
        );
        let since = cycle.state.last_training_date;
        let incremental = self.deps.records.fetch_records(since)?;
        if incremental.is_empty() {
            if since.is_none() {
                cycle.log(LogLevel::Info, "monitor.empty_store", json!({}));
                return Ok(CycleOutcome::EmptyStore);
            }
            cycle.log(LogLevel::Info, "monitor.no_new_data", json!({ "since": since }));
            return Ok(CycleOutcome::NoNewData);
        }

        let current = match self.deps.registry.latest(&self.model_name) {
            Ok(model) => model,
            Err(MonitorError::ModelNotFound { .. }) => {
                let all = if since.is_none() {
                    incremental
                } else {
                    self.deps.records.fetch_records(None)?
                };
                return self.bootstrap(cycle, &all, today);
            }
            Err(err) => return Err(err),
        };

        cycle.enter(MonitorPhase::Evaluating);
        let encoder = self.deps.encoders.load()?;
        match current.ensure_encoder(&encoder) {
            Ok(()) => {}
            Err(MonitorError::EncoderMismatch { expected, found, version }) => {
                cycle.log(
                    LogLevel::Warn,
                    "monitor.encoder_refit_detected",
                    json!({ "version": version, "model_encoder": expected, "current_encoder": found }),
                );
                return self.refresh(cycle, &encoder, today, Some(version));
            }
            Err(err) => return Err(err),
        }
        let (x, y) = encode(&incremental, &encoder)?;
        let old_mape = self.deps.scorer.evaluate_model(&current, &x, &y)?;
        cycle.log(
            LogLevel::Info,
            "monitor.evaluated",
            json!({ "version": current.version, "rows": incremental.len(), "mape": old_mape }),
        );
        if cycle.state.accepts(old_mape) {
            cycle.enter(MonitorPhase::Pass);
            return Ok(CycleOutcome::Passed { mape: old_mape });
        }

        cycle.enter(MonitorPhase::Retraining);
        cycle.log(
            LogLevel::Warn,
            "monitor.threshold_exceeded",
            json!({ "mape": old_mape, "threshold": cycle.state.mape_threshold }),
        );
        let run = self.retrain(cycle, &encoder, today)?;

        cycle.enter(MonitorPhase::ReEvaluating);
        let new_mape = self
            .deps
            .scorer
            .evaluate_model(&run.model, &run.holdout.x, &run.holdout.y)?;
        let version = run.model.version;
        cycle.log(
            LogLevel::Info,
            "monitor.re_evaluated",
            json!({ "version": version, "rows": run.holdout.y.len(), "mape": new_mape }),
        );
        if cycle.state.accepts(new_mape) {
            cycle.enter(MonitorPhase::Pass);
            return Ok(CycleOutcome::RetrainedPassed {
                old_mape,
                new_mape,
                version,
            });
        }

        cycle.enter(MonitorPhase::Alerting);
        cycle.log(
            LogLevel::Warn,
            "monitor.still_above_threshold",
            json!({ "old_mape": old_mape, "new_mape": new_mape, "threshold": cycle.state.mape_threshold }),
        );
        let alert = AlertMessage::accuracy(&self.model_name, new_mape, cycle.state.mape_threshold, old_mape);
        let alert_delivered = self.dispatch(cycle, &alert);
        Ok(CycleOutcome::RetrainedFailedAlerted {
            old_mape,
            new_mape,
            version,
            alert_delivered,
        })
    }

    fn bootstrap(&self, cycle: &mut Cycle<'_>, all: &[CarRecord], today: NaiveDate) -> MonitorResult<CycleOutcome> {
        cycle.enter(MonitorPhase::Bootstrapping);
        if all.is_empty() {
            cycle.log(LogLevel::Info, "monitor.empty_store", json!({}));
            return Ok(CycleOutcome::EmptyStore);
        }
        let encoder = self.deps.encoders.load()?;
        let run = self.fit_and_commit(cycle, all, &encoder, today)?;
        Ok(CycleOutcome::Bootstrapped {
            mape: run.model.mape(),
            version: run.model.version,
        })
    }

    fn refresh(
        &self,
        cycle: &mut Cycle<'_>,
        encoder: &EncoderState,
        today: NaiveDate,
        previous_version: Option<ModelVersion>,
    ) -> MonitorResult<CycleOutcome> {
        cycle.enter(MonitorPhase::Refreshing);
        let run = self.retrain(cycle, encoder, today)?;
        let mape = run.model.mape();
        if !cycle.state.accepts(mape) {
            cycle.log(
                LogLevel::Warn,
                "monitor.refresh.above_threshold",
                json!({ "mape": mape, "threshold": cycle.state.mape_threshold }),
            );
        }
        Ok(CycleOutcome::Refreshed {
            previous_version,
            mape,
            version: run.model.version,
        })
    }

    fn retrain(&self, cycle: &mut Cycle<'_>, encoder: &EncoderState, today: NaiveDate) -> MonitorResult<TrainingRun> {
        let all = self.deps.records.fetch_records(None)?;
        if all.is_empty() {
            return Err(MonitorError::training("record store returned no rows for retraining"));
        }
        self.fit_and_commit(cycle, &all, encoder, today)
    }

    fn fit_and_commit(
        &self,
        cycle: &mut Cycle<'_>,
        records: &[CarRecord],
        encoder: &EncoderState,
        today: NaiveDate,
    ) -> MonitorResult<TrainingRun> {
        let (x, y) = encode(records, encoder)?;
        let run = self.deps.trainer.train(&x, &y, encoder.fingerprint)?;
        cycle.log(
            LogLevel::Info,
            "monitor.registered",
            json!({
                "version": run.model.version,
                "rows": records.len(),
                "holdout_mape": run.model.mape(),
                "epochs": run.history.len(),
                "stopped_early": run.stopped_early,
            }),
        );
        let committed = cycle.state.trained_on(today);
        self.deps.state.save(&committed)?;
        cycle.state = committed;
        Ok(run)
    }

    fn dispatch(&self, cycle: &Cycle<'_>, alert: &AlertMessage) -> bool {
        match self.deps.notifier.notify(alert) {
            Ok(()) => {
                cycle.log(
                    LogLevel::Warn,
                    "monitor.alert.sent",
                    json!({ "kind": alert.kind, "subject": alert.subject }),
                );
                true
            }
            Err(err) => {
                cycle.log(
                    LogLevel::Error,
                    "monitor.alert.failed",
                    json!({ "kind": alert.kind, "error": err.to_string() }),
                );
                false
            }
        }
    }

    /// Latest registered model, if any.
    pub fn current_model(&self) -> MonitorResult<Option<ScoredModel>> {
        match self.deps.registry.latest(&self.model_name) {
            Ok(model) => Ok(Some(model)),
            Err(MonitorError::ModelNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn encode(records: &[CarRecord], encoder: &EncoderState) -> MonitorResult<(ndarray::Array2<f32>, ndarray::Array1<f32>)> {
    for record in records {
        record.validate()?;
    }
    Ok((FeatureEncoder::transform(records, encoder), targets(records)))
}
