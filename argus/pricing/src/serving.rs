use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    encoder::{EncoderStore, FeatureEncoder},
    error::{MonitorError, MonitorResult},
    records::CarFeatures,
    registry::{ModelRegistry, ModelVersion, ScoredModel},
};

/// Answer given while no model has been registered.
pub const NOT_YET_AVAILABLE: &str = "No model has been trained yet. Please try again later.";

/// Prediction answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PredictionResponse {
    /// One price per input row.
    Prices {
        /// Model version that produced the prices.
        version: ModelVersion,
        /// Predicted prices, in input order.
        prices: Vec<f32>,
    },
    /// No model is registered yet.
    NotYetAvailable {
        /// Human-readable explanation.
        message: String,
    },
}

/// Read-only prediction path sharing the encoder and registry with the loop.
#[derive(Clone)]
pub struct PredictionService {
    model_name: String,
    registry: Arc<dyn ModelRegistry>,
    encoders: Arc<dyn EncoderStore>,
}

impl std::fmt::Debug for PredictionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionService")
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

impl PredictionService {
    /// Service predicting with the latest version of `model_name`.
    #[must_use]
    pub fn new(
        model_name: impl Into<String>,
        registry: Arc<dyn ModelRegistry>,
        encoders: Arc<dyn EncoderStore>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            registry,
            encoders,
        }
    }

    /// Encodes requests with the persisted encoder.
    pub fn predict_features(&self, requests: &[CarFeatures]) -> MonitorResult<Array2<f32>> {
        for request in requests {
            request.validate()?;
        }
        let encoder = self.encoders.load()?;
        Ok(FeatureEncoder::transform(requests, &encoder))
    }

    /// Currently registered model, if any.
    pub fn current_model(&self) -> MonitorResult<Option<ScoredModel>> {
        match self.registry.latest(&self.model_name) {
            Ok(model) => Ok(Some(model)),
            Err(MonitorError::ModelNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Predicts prices, or explains that no model exists yet.
    pub fn predict(&self, requests: &[CarFeatures]) -> MonitorResult<PredictionResponse> {
        let Some(model) = self.current_model()? else {
            return Ok(PredictionResponse::NotYetAvailable {
                message: NOT_YET_AVAILABLE.into(),
            });
        };
        for request in requests {
            request.validate()?;
        }
        let encoder = self.encoders.load()?;
        model.ensure_encoder(&encoder)?;
        let x = FeatureEncoder::transform(requests, &encoder);
        let prices = model.predict(&x)?;
        Ok(PredictionResponse::Prices {
            version: model.version,
            prices: prices.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encoder::{fit_and_persist, MemoryEncoderStore},
        network::PriceNetwork,
        records::fixtures::{date, market},
        registry::{fixtures::metadata, MemoryModelRegistry},
    };

    fn request() -> CarFeatures {
        CarFeatures {
            state: "CA".into(),
            make: "Honda".into(),
            model: "Civic".into(),
            year: 2018,
            mileage: 30_000.0,
        }
    }

    #[test]
    fn answers_not_yet_available_without_a_model() {
        let service = PredictionService::new(
            "iargus",
            Arc::new(MemoryModelRegistry::default()),
            Arc::new(MemoryEncoderStore::default()),
        );
        let response = service.predict(&[request()]).unwrap();
        assert_eq!(
            response,
            PredictionResponse::NotYetAvailable {
                message: NOT_YET_AVAILABLE.into()
            }
        );
    }

    #[test]
    fn predicts_one_price_per_row() {
        let encoders = Arc::new(MemoryEncoderStore::default());
        let encoder = fit_and_persist(encoders.as_ref(), &market(12, date(2024, 1, 1))).unwrap();
        let registry = Arc::new(MemoryModelRegistry::default());
        registry
            .register(
                "iargus",
                PriceNetwork::new(encoder.width(), &[4], 3),
                metadata(0.1, encoder.fingerprint, encoder.width()),
            )
            .unwrap();
        let service = PredictionService::new("iargus", registry, encoders);

        let features = service.predict_features(&[request(), request()]).unwrap();
        assert_eq!(features.dim(), (2, encoder.width()));

        match service.predict(&[request(), request()]).unwrap() {
            PredictionResponse::Prices { version, prices } => {
                assert_eq!(version, 1);
                assert_eq!(prices.len(), 2);
                assert!((prices[0] - prices[1]).abs() < f32::EPSILON);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_requests() {
        let encoders = Arc::new(MemoryEncoderStore::default());
        fit_and_persist(encoders.as_ref(), &market(3, date(2024, 1, 1))).unwrap();
        let service = PredictionService::new("iargus", Arc::new(MemoryModelRegistry::default()), encoders);
        let mut bad = request();
        bad.mileage = -1.0;
        assert!(matches!(
            service.predict_features(&[bad]),
            Err(MonitorError::InvalidRecord(_))
        ));
    }
}
