use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    encoder::EncoderState,
    error::{MonitorError, MonitorResult},
    network::PriceNetwork,
    storage::write_atomic,
};

/// Registry version number; versions start at 1 and only grow.
pub type ModelVersion = u32;

/// Training metadata stored alongside every registered network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Held-out MAPE achieved at registration time.
    pub mape: f64,
    /// Fingerprint of the encoder fit the network was trained against.
    pub encoder_fingerprint: Uuid,
    /// Feature width at training time.
    pub input_width: usize,
    /// Rows used for fitting.
    pub train_rows: usize,
    /// Rows held out for scoring.
    pub holdout_rows: usize,
    /// Epochs actually run.
    pub epochs_run: usize,
    /// Whether early stopping ended the run.
    pub stopped_early: bool,
    /// Registration timestamp.
    pub registered_at: DateTime<Utc>,
}

/// A registered, immutable model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredModel {
    /// Logical model name.
    pub name: String,
    /// Registry version.
    pub version: ModelVersion,
    /// Metrics and provenance.
    pub metadata: ModelMetadata,
    /// Fitted network.
    pub network: PriceNetwork,
}

impl ScoredModel {
    /// MAPE recorded at registration.
    #[must_use]
    pub const fn mape(&self) -> f64 {
        self.metadata.mape
    }

    /// Fails with `EncoderMismatch` unless `encoder` is the fit this model was trained on.
    pub fn ensure_encoder(&self, encoder: &EncoderState) -> MonitorResult<()> {
        if encoder.fingerprint == self.metadata.encoder_fingerprint
            && encoder.width() == self.metadata.input_width
        {
            Ok(())
        } else {
            Err(MonitorError::EncoderMismatch {
                expected: self.metadata.encoder_fingerprint,
                found: encoder.fingerprint,
                version: self.version,
            })
        }
    }

    /// Predicted prices for encoded rows.
    pub fn predict(&self, x: &Array2<f32>) -> MonitorResult<Array1<f32>> {
        self.network.predict(x)
    }

    /// Listing entry for this version.
    #[must_use]
    pub fn info(&self) -> ModelVersionInfo {
        ModelVersionInfo {
            name: self.name.clone(),
            version: self.version,
            metadata: self.metadata.clone(),
        }
    }
}

/// Summary of one registered version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersionInfo {
    /// Logical model name.
    pub name: String,
    /// Registry version.
    pub version: ModelVersion,
    /// Metrics and provenance.
    pub metadata: ModelMetadata,
}

/// Versioned model storage keyed by logical name.
pub trait ModelRegistry: Send + Sync {
    /// Highest registered version; `ModelNotFound` when none exists.
    fn latest(&self, name: &str) -> MonitorResult<ScoredModel>;
    /// Stores `network` as a new version and returns that version.
    fn register(&self, name: &str, network: PriceNetwork, metadata: ModelMetadata) -> MonitorResult<ModelVersion>;
    /// Every version, oldest first.
    fn versions(&self, name: &str) -> MonitorResult<Vec<ModelVersionInfo>>;
}

fn validate_name(name: &str) -> MonitorResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(MonitorError::registry("validate", format!("invalid model name `{name}`")))
    }
}

const MODEL_FILE: &str = "model.json";
const MAX_REGISTER_ATTEMPTS: u32 = 16;

/// Filesystem registry laid out as `<root>/<name>/v<N>/model.json`.
#[derive(Debug, Clone)]
pub struct FsModelRegistry {
    root: PathBuf,
}

impl FsModelRegistry {
    /// Registry rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Versions with a complete model file, ascending.
    fn complete_versions(&self, name: &str) -> MonitorResult<Vec<ModelVersion>> {
        let dir = self.model_dir(name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|err| MonitorError::registry("scan", err))?;
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| MonitorError::registry("scan", err))?;
            let file_name = entry.file_name();
            let Some(version) = file_name
                .to_str()
                .and_then(|name| name.strip_prefix('v'))
                .and_then(|digits| digits.parse::<ModelVersion>().ok())
            else {
                continue;
            };
            if entry.path().join(MODEL_FILE).is_file() {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Highest version directory present, complete or not.
    fn highest_reserved(&self, name: &str) -> MonitorResult<ModelVersion> {
        let dir = self.model_dir(name);
        if !dir.exists() {
            return Ok(0);
        }
        let entries = fs::read_dir(&dir).map_err(|err| MonitorError::registry("scan", err))?;
        let mut highest = 0;
        for entry in entries.flatten() {
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix('v'))
                .and_then(|digits| digits.parse::<ModelVersion>().ok())
            {
                highest = highest.max(version);
            }
        }
        Ok(highest)
    }

    fn read_version(&self, name: &str, version: ModelVersion) -> MonitorResult<ScoredModel> {
        let path = self.model_dir(name).join(format!("v{version}")).join(MODEL_FILE);
        let raw = fs::read_to_string(&path).map_err(|err| MonitorError::registry("read", err))?;
        let model: ScoredModel = serde_json::from_str(&raw).map_err(|err| MonitorError::registry("decode", err))?;
        model
            .network
            .validate()
            .map_err(|err| MonitorError::registry("decode", format!("{}: {err}", path.display())))?;
        Ok(model)
    }
}

impl ModelRegistry for FsModelRegistry {
    fn latest(&self, name: &str) -> MonitorResult<ScoredModel> {
        validate_name(name)?;
        let versions = self.complete_versions(name)?;
        match versions.last() {
            Some(&version) => self.read_version(name, version),
            None => Err(MonitorError::model_not_found(name)),
        }
    }

    fn register(&self, name: &str, network: PriceNetwork, metadata: ModelMetadata) -> MonitorResult<ModelVersion> {
        validate_name(name)?;
        let model_dir = self.model_dir(name);
        fs::create_dir_all(&model_dir).map_err(|err| MonitorError::registry("register", err))?;
        let mut candidate = self.highest_reserved(name)? + 1;
        let mut attempts = 0;
        let version_dir = loop {
            let dir = model_dir.join(format!("v{candidate}"));
            match fs::create_dir(&dir) {
                Ok(()) => break dir,
                Err(err) if err.kind() == ErrorKind::AlreadyExists && attempts < MAX_REGISTER_ATTEMPTS => {
                    attempts += 1;
                    candidate += 1;
                }
                Err(err) => return Err(MonitorError::registry("register", err)),
            }
        };
        let model = ScoredModel {
            name: name.to_string(),
            version: candidate,
            metadata,
            network,
        };
        let bytes = serde_json::to_vec(&model).map_err(|err| MonitorError::registry("encode", err))?;
        write_atomic(&version_dir.join(MODEL_FILE), &bytes)
            .map_err(|err| MonitorError::registry("register", err))?;
        Ok(candidate)
    }

    fn versions(&self, name: &str) -> MonitorResult<Vec<ModelVersionInfo>> {
        validate_name(name)?;
        self.complete_versions(name)?
            .into_iter()
            .map(|version| self.read_version(name, version).map(|model| model.info()))
            .collect()
    }
}

/// In-process registry that also counts calls.
#[derive(Debug, Clone, Default)]
pub struct MemoryModelRegistry {
    models: Arc<RwLock<HashMap<String, Vec<ScoredModel>>>>,
    lookups: Arc<AtomicUsize>,
    registrations: Arc<AtomicUsize>,
}

impl MemoryModelRegistry {
    /// Number of `latest` calls so far.
    #[must_use]
    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of `register` calls so far.
    #[must_use]
    pub fn register_calls(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl ModelRegistry for MemoryModelRegistry {
    fn latest(&self, name: &str) -> MonitorResult<ScoredModel> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.models
            .read()
            .get(name)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| MonitorError::model_not_found(name))
    }

    fn register(&self, name: &str, network: PriceNetwork, metadata: ModelMetadata) -> MonitorResult<ModelVersion> {
        validate_name(name)?;
        self.registrations.fetch_add(1, Ordering::SeqCst);
        let mut models = self.models.write();
        let versions = models.entry(name.to_string()).or_default();
        let version = versions.last().map_or(1, |model| model.version + 1);
        versions.push(ScoredModel {
            name: name.to_string(),
            version,
            metadata,
            network,
        });
        Ok(version)
    }

    fn versions(&self, name: &str) -> MonitorResult<Vec<ModelVersionInfo>> {
        Ok(self
            .models
            .read()
            .get(name)
            .map(|versions| versions.iter().map(ScoredModel::info).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn metadata(mape: f64, encoder_fingerprint: Uuid, input_width: usize) -> ModelMetadata {
        ModelMetadata {
            mape,
            encoder_fingerprint,
            input_width,
            train_rows: 10,
            holdout_rows: 5,
            epochs_run: 1,
            stopped_early: false,
            registered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::metadata;
    use super::*;
    use tempfile::tempdir;

    fn network() -> PriceNetwork {
        PriceNetwork::new(4, &[3], 42)
    }

    #[test]
    fn fs_registry_appends_versions() {
        let dir = tempdir().unwrap();
        let registry = FsModelRegistry::new(dir.path());
        assert!(matches!(registry.latest("iargus"), Err(MonitorError::ModelNotFound { .. })));

        let fp = Uuid::new_v4();
        assert_eq!(registry.register("iargus", network(), metadata(0.2, fp, 4)).unwrap(), 1);
        assert_eq!(registry.register("iargus", network(), metadata(0.1, fp, 4)).unwrap(), 2);

        let latest = registry.latest("iargus").unwrap();
        assert_eq!(latest.version, 2);
        assert!((latest.mape() - 0.1).abs() < f64::EPSILON);
        assert_eq!(latest.network, network());

        let versions: Vec<_> = registry.versions("iargus").unwrap().iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn incomplete_version_is_skipped_and_never_reused() {
        let dir = tempdir().unwrap();
        let registry = FsModelRegistry::new(dir.path());
        let fp = Uuid::new_v4();
        registry.register("iargus", network(), metadata(0.2, fp, 4)).unwrap();
        fs::create_dir_all(dir.path().join("iargus/v2")).unwrap();

        assert_eq!(registry.latest("iargus").unwrap().version, 1);
        assert_eq!(registry.register("iargus", network(), metadata(0.1, fp, 4)).unwrap(), 3);
        assert_eq!(registry.latest("iargus").unwrap().version, 3);
    }

    #[test]
    fn malformed_model_file_is_a_registry_error() {
        let dir = tempdir().unwrap();
        let registry = FsModelRegistry::new(dir.path());
        registry
            .register("iargus", network(), metadata(0.1, Uuid::new_v4(), 4))
            .unwrap();
        let path = dir.path().join("iargus/v1").join(MODEL_FILE);
        let mut doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc["network"]["layers"] = serde_json::json!([]);
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        match registry.latest("iargus") {
            Err(MonitorError::Registry { operation, message }) => {
                assert_eq!(operation, "decode");
                assert!(message.contains("no layers"));
            }
            other => panic!("expected a decode failure, got {other:?}"),
        }
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = tempdir().unwrap();
        let registry = FsModelRegistry::new(dir.path());
        let fp = Uuid::new_v4();
        assert!(matches!(
            registry.register("../escape", network(), metadata(0.1, fp, 4)),
            Err(MonitorError::Registry { .. })
        ));
    }

    #[test]
    fn encoder_fingerprint_must_match() {
        let registry = MemoryModelRegistry::default();
        let fp = Uuid::new_v4();
        registry.register("iargus", network(), metadata(0.1, fp, 4)).unwrap();
        let model = registry.latest("iargus").unwrap();

        let records = vec![crate::records::fixtures::record("CA", "Honda", "Civic", 2017, 1.0, 2.0)];
        let mut encoder = crate::encoder::FeatureEncoder::fit(&records).unwrap();
        assert!(matches!(model.ensure_encoder(&encoder), Err(MonitorError::EncoderMismatch { .. })));
        encoder.fingerprint = fp;
        assert_eq!(encoder.width(), 5);
        assert!(model.ensure_encoder(&encoder).is_err());

        registry.register("iargus", PriceNetwork::new(5, &[3], 1), metadata(0.1, fp, 5)).unwrap();
        assert!(registry.latest("iargus").unwrap().ensure_encoder(&encoder).is_ok());
        assert_eq!(registry.register_calls(), 2);
        assert_eq!(registry.lookup_calls(), 2);
    }
}
