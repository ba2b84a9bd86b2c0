use std::sync::Arc;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::{
    error::{MonitorError, MonitorResult},
    registry::{ModelRegistry, ModelVersion, ScoredModel},
};

/// Mean absolute percentage error as a fraction.
///
/// Every actual value must be positive and finite; the result is finite and
/// non-negative.
pub fn mape(actual: &Array1<f32>, predicted: &Array1<f32>) -> MonitorResult<f64> {
    if actual.len() != predicted.len() {
        return Err(MonitorError::ShapeMismatch(format!(
            "{} targets but {} predictions",
            actual.len(),
            predicted.len()
        )));
    }
    if actual.is_empty() {
        return Err(MonitorError::empty("mape"));
    }
    let mut total = 0.0_f64;
    for (row, (&truth, &guess)) in actual.iter().zip(predicted.iter()).enumerate() {
        let truth = f64::from(truth);
        if !truth.is_finite() || truth <= 0.0 {
            return Err(MonitorError::InvalidTarget { row, value: truth });
        }
        total += ((truth - f64::from(guess)) / truth).abs();
    }
    #[allow(clippy::cast_precision_loss)]
    let value = total / actual.len() as f64;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MonitorError::NonFiniteMetric {
            metric: "mape".into(),
        })
    }
}

/// Score of one model version on one sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Scored version.
    pub version: ModelVersion,
    /// Resulting MAPE.
    pub mape: f64,
    /// Rows scored.
    pub rows: usize,
}

/// Scores registered models.
pub trait ModelScorer: Send + Sync {
    /// MAPE of `model` on `(x, y)`.
    fn evaluate_model(&self, model: &ScoredModel, x: &Array2<f32>, y: &Array1<f32>) -> MonitorResult<f64>;
}

/// Registry-backed evaluator.
#[derive(Clone)]
pub struct Evaluator {
    registry: Arc<dyn ModelRegistry>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator").finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Evaluator reading models from `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn ModelRegistry>) -> Self {
        Self { registry }
    }

    /// Scores the latest version registered under `name`.
    pub fn evaluate(&self, name: &str, x: &Array2<f32>, y: &Array1<f32>) -> MonitorResult<Evaluation> {
        let model = self.registry.latest(name)?;
        let mape = self.evaluate_model(&model, x, y)?;
        Ok(Evaluation {
            version: model.version,
            mape,
            rows: y.len(),
        })
    }
}

impl ModelScorer for Evaluator {
    fn evaluate_model(&self, model: &ScoredModel, x: &Array2<f32>, y: &Array1<f32>) -> MonitorResult<f64> {
        if x.nrows() != y.len() {
            return Err(MonitorError::ShapeMismatch(format!(
                "{} feature rows but {} targets",
                x.nrows(),
                y.len()
            )));
        }
        if y.is_empty() {
            return Err(MonitorError::empty("evaluation sample"));
        }
        let predicted = model.predict(x)?;
        mape(y, &predicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        network::PriceNetwork,
        registry::{fixtures::metadata, MemoryModelRegistry},
    };
    use ndarray::array;
    use uuid::Uuid;

    #[test]
    fn mape_matches_hand_computation() {
        let actual = array![100.0, 200.0, 50.0];
        let predicted = array![110.0, 180.0, 50.0];
        let value = mape(&actual, &predicted).unwrap();
        assert!((value - (0.1 + 0.1 + 0.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn mape_rejects_bad_inputs() {
        let empty = Array1::<f32>::zeros(0);
        assert!(matches!(mape(&empty, &empty), Err(MonitorError::EmptyDataset { .. })));
        assert!(matches!(
            mape(&array![10.0, 0.0], &array![1.0, 1.0]),
            Err(MonitorError::InvalidTarget { row: 1, .. })
        ));
        assert!(matches!(
            mape(&array![10.0], &array![f32::NAN]),
            Err(MonitorError::NonFiniteMetric { .. })
        ));
        assert!(matches!(
            mape(&array![10.0], &array![1.0, 2.0]),
            Err(MonitorError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn evaluate_uses_latest_and_is_deterministic() {
        let registry = Arc::new(MemoryModelRegistry::default());
        let evaluator = Evaluator::new(registry.clone());
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let y = array![10.0, 20.0];
        assert!(matches!(
            evaluator.evaluate("iargus", &x, &y),
            Err(MonitorError::ModelNotFound { .. })
        ));

        registry
            .register("iargus", PriceNetwork::new(2, &[4], 9), metadata(0.5, Uuid::new_v4(), 2))
            .unwrap();
        let first = evaluator.evaluate("iargus", &x, &y).unwrap();
        let second = evaluator.evaluate("iargus", &x, &y).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.version, 1);
        assert_eq!(first.rows, 2);
        assert!(first.mape >= 0.0);
    }
}
