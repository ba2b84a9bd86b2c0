use std::{
    fs,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ndarray::Array2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{MonitorError, MonitorResult},
    records::{CarFeatures, CarRecord},
    storage::write_atomic,
};

/// Categorical fields, in block order.
pub const CATEGORICAL_FIELDS: [&str; 3] = ["state", "make", "model"];

/// Numeric passthrough columns appended after the categorical blocks.
pub const NUMERIC_FIELDS: [&str; 2] = ["year", "mileage"];

/// Anything carrying the encoded fields.
pub trait Encodable {
    /// Value of a categorical field by name.
    fn categorical(&self, field: &str) -> &str;
    /// Model year.
    fn year(&self) -> i32;
    /// Odometer reading.
    fn mileage(&self) -> f64;
}

impl Encodable for CarRecord {
    fn categorical(&self, field: &str) -> &str {
        match field {
            "state" => &self.state,
            "make" => &self.make,
            _ => &self.model,
        }
    }

    fn year(&self) -> i32 {
        self.year
    }

    fn mileage(&self) -> f64 {
        self.mileage
    }
}

impl Encodable for CarFeatures {
    fn categorical(&self, field: &str) -> &str {
        match field {
            "state" => &self.state,
            "make" => &self.make,
            _ => &self.model,
        }
    }

    fn year(&self) -> i32 {
        self.year
    }

    fn mileage(&self) -> f64 {
        self.mileage
    }
}

/// Fitted one-hot vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderState {
    /// Identity of this fit; models record it to detect stale encoders.
    pub fingerprint: Uuid,
    /// When the fit ran.
    pub fitted_at: DateTime<Utc>,
    /// Sorted vocabulary per categorical field, in block order.
    pub vocabularies: IndexMap<String, Vec<String>>,
}

impl EncoderState {
    /// Total number of one-hot columns.
    #[must_use]
    pub fn categorical_width(&self) -> usize {
        self.vocabularies.values().map(Vec::len).sum()
    }

    /// Full feature width: one-hot columns plus the numeric passthrough.
    #[must_use]
    pub fn width(&self) -> usize {
        self.categorical_width() + NUMERIC_FIELDS.len()
    }

    /// Column range occupied by each categorical field.
    #[must_use]
    pub fn block_ranges(&self) -> Vec<(String, Range<usize>)> {
        let mut offset = 0;
        self.vocabularies
            .iter()
            .map(|(field, vocabulary)| {
                let range = offset..offset + vocabulary.len();
                offset = range.end;
                (field.clone(), range)
            })
            .collect()
    }

    /// Position of `value` inside the block of `field`, if it was seen during fit.
    #[must_use]
    pub fn position(&self, field: &str, value: &str) -> Option<usize> {
        self.vocabularies
            .get(field)
            .and_then(|vocabulary| vocabulary.binary_search_by(|entry| entry.as_str().cmp(value)).ok())
    }
}

/// Stateless one-hot encoder over [`CarRecord`] fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEncoder;

impl FeatureEncoder {
    /// Learns the sorted vocabulary of every categorical field.
    pub fn fit(records: &[CarRecord]) -> MonitorResult<EncoderState> {
        if records.is_empty() {
            return Err(MonitorError::empty("encoder fit"));
        }
        let mut vocabularies = IndexMap::new();
        for field in CATEGORICAL_FIELDS {
            let mut values: Vec<String> = records
                .iter()
                .map(|record| record.categorical(field).to_string())
                .collect();
            values.sort_unstable();
            values.dedup();
            vocabularies.insert(field.to_string(), values);
        }
        Ok(EncoderState {
            fingerprint: Uuid::new_v4(),
            fitted_at: Utc::now(),
            vocabularies,
        })
    }

    /// Encodes records row by row. Unseen categories leave their block at zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn transform<R: Encodable>(records: &[R], state: &EncoderState) -> Array2<f32> {
        let width = state.width();
        let numeric_offset = state.categorical_width();
        let blocks = state.block_ranges();
        let mut features = Array2::<f32>::zeros((records.len(), width));
        for (row, record) in records.iter().enumerate() {
            for (field, range) in &blocks {
                if let Some(idx) = state.position(field, record.categorical(field)) {
                    features[[row, range.start + idx]] = 1.0;
                }
            }
            features[[row, numeric_offset]] = record.year() as f32;
            features[[row, numeric_offset + 1]] = record.mileage() as f32;
        }
        features
    }
}

/// Persistence for the fitted encoder.
pub trait EncoderStore: Send + Sync {
    /// Loads the current fit; `EncoderNotFound` when nothing was persisted.
    fn load(&self) -> MonitorResult<EncoderState>;
    /// Replaces the current fit.
    fn save(&self, state: &EncoderState) -> MonitorResult<()>;
}

/// Fits a fresh encoder on `records` and persists it. Operator action only.
pub fn fit_and_persist(store: &dyn EncoderStore, records: &[CarRecord]) -> MonitorResult<EncoderState> {
    let state = FeatureEncoder::fit(records)?;
    store.save(&state)?;
    Ok(state)
}

/// Encoder persisted as one JSON document.
#[derive(Debug, Clone)]
pub struct FileEncoderStore {
    path: PathBuf,
}

impl FileEncoderStore {
    /// Store rooted at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Artifact path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EncoderStore for FileEncoderStore {
    fn load(&self) -> MonitorResult<EncoderState> {
        if !self.path.exists() {
            return Err(MonitorError::encoder_not_found(&self.path));
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, state: &EncoderState) -> MonitorResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes)
    }
}

/// In-process encoder store.
#[derive(Debug, Clone, Default)]
pub struct MemoryEncoderStore {
    state: Arc<RwLock<Option<EncoderState>>>,
}

impl EncoderStore for MemoryEncoderStore {
    fn load(&self) -> MonitorResult<EncoderState> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| MonitorError::encoder_not_found(Path::new("<memory>")))
    }

    fn save(&self, state: &EncoderState) -> MonitorResult<()> {
        *self.state.write() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::fixtures::record;
    use tempfile::tempdir;

    fn sample() -> Vec<CarRecord> {
        vec![
            record("TX", "Toyota", "Camry", 2018, 40_000.0, 18_000.0),
            record("CA", "Honda", "Civic", 2017, 55_000.0, 14_000.0),
            record("CA", "Toyota", "Corolla", 2019, 20_000.0, 17_500.0),
        ]
    }

    #[test]
    fn fit_sorts_vocabularies_in_block_order() {
        let state = FeatureEncoder::fit(&sample()).unwrap();
        let fields: Vec<_> = state.vocabularies.keys().cloned().collect();
        assert_eq!(fields, vec!["state", "make", "model"]);
        assert_eq!(state.vocabularies["state"], vec!["CA", "TX"]);
        assert_eq!(state.vocabularies["model"], vec!["Camry", "Civic", "Corolla"]);
        assert_eq!(state.categorical_width(), 7);
        assert_eq!(state.width(), 9);
    }

    #[test]
    fn transform_sets_one_hot_per_block_and_passes_numbers() {
        let records = sample();
        let state = FeatureEncoder::fit(&records).unwrap();
        let features = FeatureEncoder::transform(&records, &state);
        assert_eq!(features.nrows(), records.len());
        for (row, record) in records.iter().enumerate() {
            for (_, range) in state.block_ranges() {
                let block_sum: f32 = (range.start..range.end).map(|col| features[[row, col]]).sum();
                assert!((block_sum - 1.0).abs() < f32::EPSILON);
            }
            assert_eq!(features[[row, 7]], record.year as f32);
            assert_eq!(features[[row, 8]], record.mileage as f32);
        }
    }

    #[test]
    fn unseen_categories_encode_to_zero_block() {
        let state = FeatureEncoder::fit(&sample()).unwrap();
        let unseen = vec![record("NV", "Tesla", "Model 3", 2021, 5_000.0, 40_000.0)];
        let features = FeatureEncoder::transform(&unseen, &state);
        let categorical: f32 = (0..state.categorical_width()).map(|col| features[[0, col]]).sum();
        assert_eq!(categorical, 0.0);
        assert_eq!(features[[0, 7]], 2021.0);
    }

    #[test]
    fn fit_rejects_empty_input() {
        assert!(matches!(FeatureEncoder::fit(&[]), Err(MonitorError::EmptyDataset { .. })));
    }

    #[test]
    fn file_store_round_trips_and_reports_missing_fit() {
        let dir = tempdir().unwrap();
        let store = FileEncoderStore::new(dir.path().join("encoder.json"));
        assert!(matches!(store.load(), Err(MonitorError::EncoderNotFound { .. })));
        let state = fit_and_persist(&store, &sample()).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn memory_store_reports_missing_fit() {
        let store = MemoryEncoderStore::default();
        assert!(matches!(store.load(), Err(MonitorError::EncoderNotFound { .. })));
        let state = fit_and_persist(&store, &sample()).unwrap();
        assert_eq!(store.load().unwrap().fingerprint, state.fingerprint);
    }
}
