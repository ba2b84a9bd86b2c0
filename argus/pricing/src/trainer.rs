use std::sync::Arc;

use chrono::Utc;
use ndarray::{Array1, Array2, Axis};
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{MonitorError, MonitorResult},
    evaluator::mape,
    network::{Adam, PriceNetwork},
    registry::{ModelMetadata, ModelRegistry, ScoredModel},
};

/// Minimum rows needed to carve out a holdout and still fit.
pub const MIN_TRAINING_ROWS: usize = 3;

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Fraction of rows held out for scoring.
    pub holdout_fraction: f64,
    /// Seed for the split, shuffling, and weight init.
    pub seed: u64,
    /// Fraction of the training part used for early-stopping validation.
    pub validation_fraction: f64,
    /// Maximum epochs.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Units per hidden layer.
    pub hidden_units: Vec<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.33,
            seed: 42,
            validation_fraction: 0.1,
            epochs: 150,
            batch_size: 100,
            patience: 3,
            learning_rate: 1e-3,
            hidden_units: vec![100, 50],
        }
    }
}

impl TrainingConfig {
    /// Rejects settings that cannot produce a model.
    pub fn validate(&self) -> MonitorResult<()> {
        if !(self.holdout_fraction > 0.0 && self.holdout_fraction < 1.0) {
            return Err(MonitorError::Config(format!(
                "holdout_fraction {} must be in (0, 1)",
                self.holdout_fraction
            )));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(MonitorError::Config(format!(
                "validation_fraction {} must be in [0, 1)",
                self.validation_fraction
            )));
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(MonitorError::Config("epochs and batch_size must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MonitorError::Config("learning_rate must be positive".into()));
        }
        if self.hidden_units.is_empty() || self.hidden_units.contains(&0) {
            return Err(MonitorError::Config("hidden_units must list positive widths".into()));
        }
        Ok(())
    }
}

/// Rows held out from fitting.
#[derive(Debug, Clone, PartialEq)]
pub struct Holdout {
    /// Encoded features.
    pub x: Array2<f32>,
    /// Prices.
    pub y: Array1<f32>,
    /// Source row indices.
    pub indices: Vec<usize>,
}

/// Seeded shuffle then split; returns `(train, holdout)`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn split_holdout(
    x: &Array2<f32>,
    y: &Array1<f32>,
    fraction: f64,
    seed: u64,
) -> MonitorResult<(Holdout, Holdout)> {
    let rows = x.nrows();
    if rows != y.len() {
        return Err(MonitorError::ShapeMismatch(format!(
            "{rows} feature rows but {} targets",
            y.len()
        )));
    }
    if rows < 2 {
        return Err(MonitorError::training(format!("{rows} rows cannot be split")));
    }
    let mut indices: Vec<usize> = (0..rows).collect();
    indices.shuffle(&mut SmallRng::seed_from_u64(seed));
    let test_rows = ((rows as f64 * fraction).ceil() as usize).clamp(1, rows - 1);
    let (test_idx, train_idx) = indices.split_at(test_rows);
    let take = |idx: &[usize]| Holdout {
        x: x.select(Axis(0), idx),
        y: y.select(Axis(0), idx),
        indices: idx.to_vec(),
    };
    Ok((take(train_idx), take(test_idx)))
}

/// Loss figures for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// Zero-based epoch.
    pub epoch: usize,
    /// Mean training MAPE over batches.
    pub loss: f64,
    /// Validation MAPE, when a validation slice exists.
    pub val_loss: Option<f64>,
}

/// Result of one training run.
#[derive(Debug, Clone)]
pub struct TrainingRun {
    /// Registered model.
    pub model: ScoredModel,
    /// Rows the model never saw.
    pub holdout: Holdout,
    /// Per-epoch losses.
    pub history: Vec<EpochStats>,
    /// Whether patience ran out before the epoch limit.
    pub stopped_early: bool,
}

/// Fits and registers price models.
pub trait ModelTrainer: Send + Sync {
    /// Fits on `(x, y)` and registers the result.
    fn train(&self, x: &Array2<f32>, y: &Array1<f32>, encoder_fingerprint: Uuid) -> MonitorResult<TrainingRun>;
}

/// Trainer responsible for fitting, scoring, and registering.
#[derive(Clone)]
pub struct Trainer {
    config: TrainingConfig,
    model_name: String,
    registry: Arc<dyn ModelRegistry>,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("model_name", &self.model_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Fit {
    network: PriceNetwork,
    history: Vec<EpochStats>,
    stopped_early: bool,
}

impl Trainer {
    /// Creates a trainer registering under `model_name`.
    #[must_use]
    pub fn new(config: TrainingConfig, model_name: impl Into<String>, registry: Arc<dyn ModelRegistry>) -> Self {
        Self {
            config,
            model_name: model_name.into(),
            registry,
        }
    }

    /// Active hyperparameters.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn check_inputs(x: &Array2<f32>, y: &Array1<f32>) -> MonitorResult<()> {
        if x.nrows() != y.len() {
            return Err(MonitorError::training(format!(
                "{} feature rows but {} targets",
                x.nrows(),
                y.len()
            )));
        }
        if x.nrows() < MIN_TRAINING_ROWS {
            return Err(MonitorError::training(format!(
                "need at least {MIN_TRAINING_ROWS} rows, got {}",
                x.nrows()
            )));
        }
        if let Some(bad) = x.iter().find(|v| !v.is_finite()) {
            return Err(MonitorError::training(format!("non-finite feature value {bad}")));
        }
        if let Some((row, value)) = y.iter().enumerate().find(|(_, v)| !(v.is_finite() && **v > 0.0)) {
            return Err(MonitorError::training(format!(
                "target at row {row} is {value}; prices must be positive"
            )));
        }
        Ok(())
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn fit(&self, train: &Holdout) -> MonitorResult<Fit> {
        let cfg = &self.config;
        let rows = train.x.nrows();
        let mut val_rows = (rows as f64 * cfg.validation_fraction).floor() as usize;
        if val_rows >= rows {
            val_rows = 0;
        }
        // Validation takes the tail of the training part.
        let fit_rows = rows - val_rows;
        let fit_x = train.x.slice(ndarray::s![..fit_rows, ..]).to_owned();
        let fit_y = train.y.slice(ndarray::s![..fit_rows]).to_owned();
        let val_x = train.x.slice(ndarray::s![fit_rows.., ..]).to_owned();
        let val_y = train.y.slice(ndarray::s![fit_rows..]).to_owned();

        let mut network = PriceNetwork::new(train.x.ncols(), &cfg.hidden_units, cfg.seed);
        network.fit_normalization(&fit_x, &fit_y);
        let xs = network.standardize(&fit_x);
        let ys = network.scale_targets(&fit_y);
        let mut optimizer = Adam::new(&network, cfg.learning_rate);
        let mut rng = SmallRng::seed_from_u64(cfg.seed.wrapping_add(1));
        let mut order: Vec<usize> = (0..fit_rows).collect();

        let mut history = Vec::with_capacity(cfg.epochs);
        let mut best: Option<(f64, PriceNetwork)> = None;
        let mut wait = 0;
        let mut stopped_early = false;

        for epoch in 0..cfg.epochs {
            order.shuffle(&mut rng);
            let mut weighted = 0.0_f64;
            for batch in order.chunks(cfg.batch_size) {
                let bx = xs.select(Axis(0), batch);
                let by = ys.select(Axis(0), batch);
                let loss = network.train_batch(&bx, &by, &mut optimizer);
                weighted += f64::from(loss) * batch.len() as f64;
            }
            let loss = weighted / fit_rows as f64;
            if !loss.is_finite() {
                return Err(MonitorError::training(format!("loss became non-finite at epoch {epoch}")));
            }
            let val_loss = if val_rows > 0 {
                let predicted = network.predict(&val_x)?;
                Some(mape(&val_y, &predicted).map_err(|err| MonitorError::training(err.to_string()))?)
            } else {
                None
            };
            history.push(EpochStats { epoch, loss, val_loss });

            let monitored = val_loss.unwrap_or(loss);
            if best.as_ref().map_or(true, |(best_loss, _)| monitored < *best_loss) {
                best = Some((monitored, network.clone()));
                wait = 0;
            } else {
                wait += 1;
                if wait >= cfg.patience {
                    stopped_early = true;
                    break;
                }
            }
        }

        Ok(Fit {
            network: best.map_or(network, |(_, snapshot)| snapshot),
            history,
            stopped_early,
        })
    }
}

impl ModelTrainer for Trainer {
    fn train(&self, x: &Array2<f32>, y: &Array1<f32>, encoder_fingerprint: Uuid) -> MonitorResult<TrainingRun> {
        self.config.validate()?;
        Self::check_inputs(x, y)?;
        let (train, holdout) = split_holdout(x, y, self.config.holdout_fraction, self.config.seed)?;
        let fit = self.fit(&train)?;

        let predicted = fit.network.predict(&holdout.x)?;
        let holdout_mape = mape(&holdout.y, &predicted).map_err(|err| match err {
            MonitorError::NonFiniteMetric { .. } => MonitorError::training("holdout MAPE is not finite"),
            other => other,
        })?;

        let metadata = ModelMetadata {
            mape: holdout_mape,
            encoder_fingerprint,
            input_width: x.ncols(),
            train_rows: train.x.nrows(),
            holdout_rows: holdout.x.nrows(),
            epochs_run: fit.history.len(),
            stopped_early: fit.stopped_early,
            registered_at: Utc::now(),
        };
        let version = self
            .registry
            .register(&self.model_name, fit.network.clone(), metadata.clone())?;
        Ok(TrainingRun {
            model: ScoredModel {
                name: self.model_name.clone(),
                version,
                metadata,
                network: fit.network,
            },
            holdout,
            history: fit.history,
            stopped_early: fit.stopped_early,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encoder::FeatureEncoder,
        records::{fixtures::{date, market}, targets},
        registry::MemoryModelRegistry,
    };
    use ndarray::array;

    fn quick_config() -> TrainingConfig {
        TrainingConfig {
            epochs: 60,
            batch_size: 16,
            learning_rate: 1e-2,
            hidden_units: vec![16, 8],
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let x = Array2::from_shape_fn((9, 2), |(r, c)| (r * 2 + c) as f32);
        let y = Array1::from_iter((1..=9).map(|v| v as f32));
        let (train_a, hold_a) = split_holdout(&x, &y, 0.33, 42).unwrap();
        let (train_b, hold_b) = split_holdout(&x, &y, 0.33, 42).unwrap();
        assert_eq!(hold_a, hold_b);
        assert_eq!(train_a, train_b);
        assert_eq!(hold_a.indices.len(), 3);
        assert_eq!(train_a.indices.len(), 6);
        assert!(hold_a.indices.iter().all(|idx| !train_a.indices.contains(idx)));
        for (pos, &idx) in hold_a.indices.iter().enumerate() {
            assert_eq!(hold_a.y[pos], y[idx]);
        }
    }

    #[test]
    fn trains_and_registers_a_version() {
        let records = market(120, date(2024, 1, 1));
        let encoder = FeatureEncoder::fit(&records).unwrap();
        let x = FeatureEncoder::transform(&records, &encoder);
        let y = targets(&records);

        let registry = Arc::new(MemoryModelRegistry::default());
        let trainer = Trainer::new(quick_config(), "iargus", registry.clone());
        let run = trainer.train(&x, &y, encoder.fingerprint).unwrap();

        assert_eq!(run.model.version, 1);
        assert_eq!(run.holdout.indices.len(), 40);
        assert!(run.model.mape().is_finite());
        assert!(run.model.mape() < 0.5);
        assert!(!run.history.is_empty());
        assert!(run.history.iter().all(|epoch| epoch.val_loss.is_some()));
        assert!(run.model.ensure_encoder(&encoder).is_ok());

        let stored = registry.latest("iargus").unwrap();
        assert_eq!(stored, run.model);
        let rescored = mape(&run.holdout.y, &stored.predict(&run.holdout.x).unwrap()).unwrap();
        assert!((rescored - run.model.mape()).abs() < 1e-12);
    }

    #[test]
    fn too_few_rows_is_a_training_failure() {
        let registry = Arc::new(MemoryModelRegistry::default());
        let trainer = Trainer::new(quick_config(), "iargus", registry.clone());
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let y = array![10.0, 20.0];
        assert!(matches!(
            trainer.train(&x, &y, Uuid::new_v4()),
            Err(MonitorError::TrainingFailure { .. })
        ));
        assert_eq!(registry.register_calls(), 0);
    }

    #[test]
    fn non_finite_input_is_a_training_failure() {
        let registry = Arc::new(MemoryModelRegistry::default());
        let trainer = Trainer::new(quick_config(), "iargus", registry);
        let x = array![[1.0, f32::NAN], [3.0, 4.0], [5.0, 6.0]];
        let y = array![10.0, 20.0, 30.0];
        assert!(matches!(
            trainer.train(&x, &y, Uuid::new_v4()),
            Err(MonitorError::TrainingFailure { .. })
        ));
    }

    #[test]
    fn config_validation_catches_bad_fractions() {
        let mut config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        config.holdout_fraction = 1.0;
        assert!(config.validate().is_err());
        config.holdout_fraction = 0.33;
        config.hidden_units = vec![];
        assert!(config.validate().is_err());
    }
}
