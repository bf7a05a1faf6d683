//! Versioned training artifacts on the local filesystem.
//!
//! Layout under the configured root:
//!
//! ```text
//! models/
//!   CURRENT                      <- name of the active version
//!   20261017T101500.123456Z/
//!     model.json  scaler.json  features.json  metadata.json
//! ```
//!
//! A bundle is written into a hidden staging directory and renamed into place,
//! and `CURRENT` is replaced through a temp file plus rename. Readers therefore
//! see either the previous bundle or the new one, never a mix.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ArtifactConfig, CompoundRanks};
use crate::error::{OvertakeError, Result};
use crate::model::{ClassifierKind, FittedClassifier};
use crate::pairs::FEATURE_NAMES;
use crate::preprocess::StandardScaler;
use crate::selection::SelectionReport;

const CURRENT_FILE: &str = "CURRENT";
const MODEL_FILE: &str = "model.json";
const SCALER_FILE: &str = "scaler.json";
const FEATURES_FILE: &str = "features.json";
const METADATA_FILE: &str = "metadata.json";

/// Ordered feature names plus the compound ranking the features were built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub names: Vec<String>,
    pub compound_ranks: CompoundRanks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub pairs: usize,
    pub train: usize,
    pub train_after_oversampling: usize,
    pub test: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub version: String,
    pub trained_at: DateTime<Utc>,
    pub rows: RowCounts,
    pub report: SelectionReport,
}

impl ArtifactMetadata {
    /// Stamps a fresh version from the current UTC time.
    pub fn new(report: SelectionReport, rows: RowCounts) -> Self {
        let trained_at = Utc::now();
        Self {
            version: trained_at.format("%Y%m%dT%H%M%S%.6fZ").to_string(),
            trained_at,
            rows,
            report,
        }
    }
}

/// Everything scoring needs, checked for consistency at construction.
///
/// Fields are private so an artifact can only be built whole; there is no way
/// to swap the model without also re-checking the scaler and feature list.
#[derive(Debug, Clone)]
pub struct TrainingArtifact {
    model: FittedClassifier,
    scaler: StandardScaler,
    features: FeatureSpec,
    metadata: ArtifactMetadata,
}

pub type ArtifactHandle = Arc<TrainingArtifact>;

impl TrainingArtifact {
    pub fn new(
        model: FittedClassifier,
        scaler: StandardScaler,
        features: FeatureSpec,
        metadata: ArtifactMetadata,
    ) -> Result<Self> {
        let artifact = Self {
            model,
            scaler,
            features,
            metadata,
        };
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn model(&self) -> &FittedClassifier {
        &self.model
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    pub fn features(&self) -> &FeatureSpec {
        &self.features
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn model_kind(&self) -> ClassifierKind {
        self.model.kind()
    }

    fn validate(&self) -> Result<()> {
        let expected: Vec<&str> = FEATURE_NAMES.to_vec();
        if self.features.names != expected {
            return Err(mismatch(format!(
                "feature list {:?} does not match {:?}",
                self.features.names, expected
            )));
        }
        let width = self.features.names.len();
        if self.scaler.width() != width || self.scaler.scale.len() != width {
            return Err(mismatch(format!(
                "scaler covers {} columns, feature list has {width}",
                self.scaler.width()
            )));
        }
        if self
            .scaler
            .mean
            .iter()
            .chain(&self.scaler.scale)
            .any(|v| !v.is_finite())
            || self.scaler.scale.iter().any(|s| *s <= 0.0)
        {
            return Err(mismatch("scaler holds non-finite or non-positive values".into()));
        }
        self.model.check_width(width).map_err(|e| mismatch(e.to_string()))?;
        self.model.validate().map_err(|e| mismatch(e.to_string()))?;
        if self.metadata.report.chosen != self.model.kind() {
            return Err(mismatch(format!(
                "metadata names {} but the model is {}",
                self.metadata.report.chosen,
                self.model.kind()
            )));
        }
        Ok(())
    }
}

fn mismatch(msg: String) -> OvertakeError {
    OvertakeError::ArtifactMismatch(msg)
}

/// Filesystem store of versioned bundles with a `CURRENT` pointer.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(cfg: &ArtifactConfig) -> Self {
        Self::new(&cfg.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the bundle under its version and make it current.
    pub fn publish(&self, artifact: &TrainingArtifact) -> Result<PathBuf> {
        let version = artifact.version();
        check_version_name(version)?;
        fs::create_dir_all(&self.root)?;

        let target = self.root.join(version);
        if target.exists() {
            return Err(mismatch(format!("version {version} is already published")));
        }

        let staging = self.root.join(format!(".staging-{version}"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        if let Err(err) = write_bundle(&staging, artifact) {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "could not remove staging directory");
            }
            return Err(err);
        }
        fs::rename(&staging, &target)?;

        let pointer_tmp = self.root.join(format!("{CURRENT_FILE}.tmp"));
        fs::write(&pointer_tmp, version)?;
        fs::rename(&pointer_tmp, self.root.join(CURRENT_FILE))?;

        info!(version, path = %target.display(), model = %artifact.model_kind(), "published artifact");
        Ok(target)
    }

    pub fn current_version(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(raw) => {
                let version = raw.trim().to_string();
                Ok((!version.is_empty()).then_some(version))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load_current(&self) -> Result<TrainingArtifact> {
        let version = self
            .current_version()?
            .ok_or_else(|| OvertakeError::ArtifactNotFound(self.root.display().to_string()))?;
        self.load_version(&version)
    }

    pub fn load_version(&self, version: &str) -> Result<TrainingArtifact> {
        check_version_name(version)?;
        let dir = self.root.join(version);
        if !dir.is_dir() {
            return Err(OvertakeError::ArtifactNotFound(dir.display().to_string()));
        }

        let model: FittedClassifier = read_json(&dir.join(MODEL_FILE))?;
        let scaler: StandardScaler = read_json(&dir.join(SCALER_FILE))?;
        let features: FeatureSpec = read_json(&dir.join(FEATURES_FILE))?;
        let metadata: ArtifactMetadata = read_json(&dir.join(METADATA_FILE))?;
        if metadata.version != version {
            return Err(mismatch(format!(
                "directory {version} holds metadata for {}",
                metadata.version
            )));
        }

        let artifact = TrainingArtifact::new(model, scaler, features, metadata)?;
        info!(version, model = %artifact.model_kind(), "loaded artifact");
        Ok(artifact)
    }

    /// Published versions, oldest first.
    pub fn versions(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                versions.push(name);
            }
        }
        versions.sort();
        Ok(versions)
    }
}

fn check_version_name(version: &str) -> Result<()> {
    if version.is_empty() || version.starts_with('.') || version.contains(['/', '\\']) {
        return Err(OvertakeError::ArtifactNotFound(format!("invalid version name {version:?}")));
    }
    Ok(())
}

fn write_bundle(dir: &Path, artifact: &TrainingArtifact) -> Result<()> {
    write_json(&dir.join(MODEL_FILE), artifact.model())?;
    write_json(&dir.join(SCALER_FILE), artifact.scaler())?;
    write_json(&dir.join(FEATURES_FILE), artifact.features())?;
    write_json(&dir.join(METADATA_FILE), artifact.metadata())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => mismatch(format!("{} is missing", path.display())),
        _ => e.into(),
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Shared slot holding the artifact in use; scoring clones the handle and never
/// blocks a swap for longer than the clone.
#[derive(Debug, Default)]
pub struct ArtifactSlot {
    current: RwLock<Option<ArtifactHandle>>,
}

impl ArtifactSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(artifact: TrainingArtifact) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(artifact))),
        }
    }

    pub fn current(&self) -> Option<ArtifactHandle> {
        self.current.read().clone()
    }

    /// Install a new artifact, returning the one it displaced.
    pub fn replace(&self, artifact: TrainingArtifact) -> Option<ArtifactHandle> {
        let handle = Arc::new(artifact);
        self.current.write().replace(handle)
    }

    pub fn reload(&self, store: &ArtifactStore) -> Result<ArtifactHandle> {
        let artifact = store.load_current()?;
        let handle = Arc::new(artifact);
        *self.current.write() = Some(Arc::clone(&handle));
        Ok(handle)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::FittedLogistic;
    use crate::selection::{CandidateOutcome, CandidateReport};

    pub(crate) fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("overtake-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    /// Logistic model over the six pair features with hand-picked weights.
    pub(crate) fn logistic_artifact(coefficients: Vec<f64>, intercept: f64) -> TrainingArtifact {
        let width = FEATURE_NAMES.len();
        let model = FittedClassifier::LogisticRegression(FittedLogistic {
            coefficients,
            intercept,
            iterations: 1,
        });
        let scaler = StandardScaler {
            mean: vec![0.0; width],
            scale: vec![1.0; width],
        };
        let features = FeatureSpec {
            names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            compound_ranks: CompoundRanks::default(),
        };
        let report = SelectionReport {
            chosen: ClassifierKind::LogisticRegression,
            threshold: 0.5,
            candidates: vec![CandidateReport {
                model: ClassifierKind::LogisticRegression,
                outcome: CandidateOutcome::Failed {
                    reason: "not evaluated".into(),
                },
            }],
            degraded: vec![],
        };
        let rows = RowCounts {
            pairs: 0,
            train: 0,
            train_after_oversampling: 0,
            test: 0,
        };
        TrainingArtifact::new(model, scaler, features, ArtifactMetadata::new(report, rows)).unwrap()
    }

    fn sample() -> TrainingArtifact {
        logistic_artifact(vec![0.1, -2.0, -0.3, 0.8, 0.0, 0.0], 0.0)
    }

    #[test]
    fn publish_then_load_round_trips() {
        let root = temp_root("roundtrip");
        let store = ArtifactStore::new(&root);
        let artifact = sample();
        let dir = store.publish(&artifact).unwrap();

        for file in [MODEL_FILE, SCALER_FILE, FEATURES_FILE, METADATA_FILE] {
            assert!(dir.join(file).is_file(), "{file} missing");
        }
        assert_eq!(store.current_version().unwrap().as_deref(), Some(artifact.version()));

        let loaded = store.load_current().unwrap();
        assert_eq!(loaded.version(), artifact.version());
        assert_eq!(loaded.scaler(), artifact.scaler());
        assert_eq!(loaded.features(), artifact.features());
        assert_eq!(loaded.metadata(), artifact.metadata());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn empty_store_reports_not_found() {
        let store = ArtifactStore::new(temp_root("empty"));
        assert!(matches!(store.load_current(), Err(OvertakeError::ArtifactNotFound(_))));
        assert!(store.versions().unwrap().is_empty());
    }

    #[test]
    fn second_publish_moves_current_and_keeps_old_version() {
        let root = temp_root("swap");
        let store = ArtifactStore::new(&root);
        let first = sample();
        store.publish(&first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = logistic_artifact(vec![0.0, -1.0, 0.0, 0.0, 0.0, 0.0], 0.2);
        store.publish(&second).unwrap();

        assert_eq!(store.current_version().unwrap().as_deref(), Some(second.version()));
        assert_eq!(store.versions().unwrap(), vec![first.version().to_string(), second.version().to_string()]);
        assert_eq!(store.load_version(first.version()).unwrap().version(), first.version());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn scaler_width_disagreement_is_a_mismatch() {
        let root = temp_root("mismatch");
        let store = ArtifactStore::new(&root);
        let artifact = sample();
        let dir = store.publish(&artifact).unwrap();
        let narrow = StandardScaler {
            mean: vec![0.0; 5],
            scale: vec![1.0; 5],
        };
        fs::write(dir.join(SCALER_FILE), serde_json::to_vec(&narrow).unwrap()).unwrap();
        assert!(matches!(store.load_current(), Err(OvertakeError::ArtifactMismatch(_))));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_bundle_file_is_a_mismatch() {
        let root = temp_root("missing-file");
        let store = ArtifactStore::new(&root);
        let dir = store.publish(&sample()).unwrap();
        fs::remove_file(dir.join(FEATURES_FILE)).unwrap();
        assert!(matches!(store.load_current(), Err(OvertakeError::ArtifactMismatch(_))));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn slot_swaps_without_disturbing_held_handles() {
        let slot = ArtifactSlot::with_artifact(sample());
        let held = slot.current().unwrap();
        let replacement = logistic_artifact(vec![0.0; 6], 1.0);
        let displaced = slot.replace(replacement).unwrap();

        assert!(Arc::ptr_eq(&held, &displaced));
        assert_eq!(held.model_kind(), ClassifierKind::LogisticRegression);
        let now = slot.current().unwrap();
        assert!(!Arc::ptr_eq(&held, &now));
    }

    #[test]
    fn wrong_coefficient_count_is_rejected() {
        let model = FittedClassifier::LogisticRegression(FittedLogistic {
            coefficients: vec![0.0; 4],
            intercept: 0.0,
            iterations: 1,
        });
        let good = sample();
        let err = TrainingArtifact::new(
            model,
            good.scaler().clone(),
            good.features().clone(),
            good.metadata().clone(),
        )
        .unwrap_err();
        assert!(matches!(err, OvertakeError::ArtifactMismatch(_)));
    }
}
