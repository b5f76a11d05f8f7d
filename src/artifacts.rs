use crate::error::EstimatorError;
use crate::features::FEATURE_SCHEMA_VERSION;
use crate::models::{Platform, RegressionMetrics};
use crate::param_utils::Params;
use crate::regressor::RegressorModel;
use crate::scaler::StandardScaler;
use crate::weighting::WeightingConfig;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const REGRESSOR_FILE: &str = "regressor.json";
pub const REGRESSORS_FILE: &str = "regressors.json";
pub const SCALER_FILE: &str = "scaler.json";
pub const METADATA_FILE: &str = "metadata.json";

/// Sidecar written next to every persisted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub version: String,
    pub model_name: String,
    pub model_type: String,
    pub learner: String,
    pub feature_names: Vec<String>,
    pub feature_schema_version: u32,
    pub training_samples: usize,
    pub test_samples: usize,
    #[serde(default)]
    pub outliers_removed: usize,
    pub test_metrics: RegressionMetrics,
    pub train_metrics: RegressionMetrics,
    #[serde(default)]
    pub cv_mae: Option<f64>,
    #[serde(default)]
    pub hyperparameters: Params,
    #[serde(default)]
    pub feature_importance: BTreeMap<String, f64>,
    pub trained_at: DateTime<Utc>,
    pub weighting: WeightingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_platforms: Option<Vec<Platform>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_models: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual_std: Option<f64>,
}

pub fn model_version(trained_at: DateTime<Utc>) -> String {
    format!(
        "v{}-{}",
        FEATURE_SCHEMA_VERSION,
        trained_at.format("%Y%m%d%H%M%S")
    )
}

impl ModelMetadata {
    /// Feature importances sorted descending, at most `limit` entries.
    pub fn top_features(&self, limit: usize) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_importance
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        ranked
    }

    fn validate_schema(&self, expected: &[String]) -> Result<()> {
        if self.feature_names != expected || self.feature_schema_version != FEATURE_SCHEMA_VERSION
        {
            return Err(EstimatorError::FeatureSchemaMismatch {
                model: self.model_name.clone(),
                expected: expected.to_vec(),
                found: self.feature_names.clone(),
            }
            .into());
        }
        Ok(())
    }
}

/// A fitted regressor together with the scaler it was trained behind. The pair is only ever
/// replaced as a whole.
#[derive(Debug, Clone)]
pub struct PriceModel {
    pub metadata: ModelMetadata,
    pub regressor: RegressorModel,
    pub scaler: StandardScaler,
}

impl PriceModel {
    /// Price in currency units: scale, predict on the log scale, invert.
    pub fn predict_price(&self, features: &[f64]) -> Result<f64> {
        let scaled = self.scaler.transform_row(features)?;
        let log_price = self.regressor.predict_row(&scaled)?;
        let price = log_price.exp_m1();
        if price.is_finite() {
            Ok(price)
        } else {
            Err(anyhow!(
                "{} produced a non-finite price",
                self.metadata.model_name
            ))
        }
    }

    pub fn feature_count(&self) -> usize {
        self.metadata.feature_names.len()
    }

    fn validate(&self, expected: &[String]) -> Result<()> {
        self.metadata.validate_schema(expected)?;
        if self.regressor.n_features() != expected.len() || self.scaler.width() != expected.len() {
            return Err(EstimatorError::FeatureSchemaMismatch {
                model: self.metadata.model_name.clone(),
                expected: expected.to_vec(),
                found: self.metadata.feature_names.clone(),
            }
            .into());
        }
        Ok(())
    }
}

/// Bootstrap members sharing one scaler; persisted as a single artifact.
#[derive(Debug, Clone)]
pub struct EnsembleArtifact {
    pub metadata: ModelMetadata,
    pub regressors: Vec<RegressorModel>,
    pub scaler: StandardScaler,
}

/// Directory layout of persisted models under one root.
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn specialist_dir(&self, platform: Platform) -> PathBuf {
        self.root.join("specialists").join(platform.as_str())
    }

    pub fn unified_dir(&self) -> PathBuf {
        self.root.join("unified")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn bootstrap_dir(&self) -> PathBuf {
        self.root.join("bootstrap")
    }

    pub fn oof_dir(&self) -> PathBuf {
        self.root.join("oof")
    }

    pub fn save_model(&self, dir: &Path, model: &PriceModel) -> Result<()> {
        let files = vec![
            (REGRESSOR_FILE, to_json(&model.regressor)?),
            (SCALER_FILE, to_json(&model.scaler)?),
            (METADATA_FILE, to_json(&model.metadata)?),
        ];
        swap_into_place(dir, &files)?;
        info!(
            "Saved {} ({}) to {}",
            model.metadata.model_name,
            model.metadata.version,
            dir.display()
        );
        Ok(())
    }

    /// `Ok(None)` when nothing was ever deployed at `dir`. A schema mismatch is an error.
    pub fn load_model(&self, dir: &Path, expected_features: &[String]) -> Result<Option<PriceModel>> {
        let Some(dir) = resolve_artifact_dir(dir) else {
            return Ok(None);
        };
        let model = PriceModel {
            metadata: read_json(&dir.join(METADATA_FILE))?,
            regressor: read_json(&dir.join(REGRESSOR_FILE))?,
            scaler: read_json(&dir.join(SCALER_FILE))?,
        };
        model.validate(expected_features)?;
        Ok(Some(model))
    }

    pub fn save_ensemble(&self, dir: &Path, artifact: &EnsembleArtifact) -> Result<()> {
        let files = vec![
            (REGRESSORS_FILE, to_json(&artifact.regressors)?),
            (SCALER_FILE, to_json(&artifact.scaler)?),
            (METADATA_FILE, to_json(&artifact.metadata)?),
        ];
        swap_into_place(dir, &files)?;
        info!(
            "Saved {} with {} member(s) to {}",
            artifact.metadata.model_name,
            artifact.regressors.len(),
            dir.display()
        );
        Ok(())
    }

    pub fn load_ensemble(
        &self,
        dir: &Path,
        expected_features: &[String],
    ) -> Result<Option<EnsembleArtifact>> {
        let Some(dir) = resolve_artifact_dir(dir) else {
            return Ok(None);
        };
        let metadata: ModelMetadata = read_json(&dir.join(METADATA_FILE))?;
        metadata.validate_schema(expected_features)?;
        let regressors: Vec<RegressorModel> = read_json(&dir.join(REGRESSORS_FILE))?;
        let scaler: StandardScaler = read_json(&dir.join(SCALER_FILE))?;
        if regressors.is_empty() {
            return Err(anyhow!("{} has no ensemble members", dir.display()));
        }
        if scaler.width() != expected_features.len()
            || regressors
                .iter()
                .any(|r| r.n_features() != expected_features.len())
        {
            return Err(EstimatorError::FeatureSchemaMismatch {
                model: metadata.model_name.clone(),
                expected: expected_features.to_vec(),
                found: metadata.feature_names.clone(),
            }
            .into());
        }
        Ok(Some(EnsembleArtifact {
            metadata,
            regressors,
            scaler,
        }))
    }

    pub fn read_metadata(&self, dir: &Path) -> Result<Option<ModelMetadata>> {
        match resolve_artifact_dir(dir) {
            Some(dir) => Ok(Some(read_json(&dir.join(METADATA_FILE))?)),
            None => Ok(None),
        }
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).context("Failed to serialize model artifact")
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn prev_dir(dir: &Path) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".prev");
    dir.with_file_name(name)
}

/// The live directory, or the retained previous version when a swap was interrupted.
pub(crate) fn resolve_artifact_dir_with(dir: &Path, marker: &str) -> Option<PathBuf> {
    if dir.join(marker).is_file() {
        return Some(dir.to_path_buf());
    }
    let prev = prev_dir(dir);
    if prev.join(marker).is_file() {
        warn!(
            "{} is incomplete; loading previous version from {}",
            dir.display(),
            prev.display()
        );
        return Some(prev);
    }
    None
}

fn resolve_artifact_dir(dir: &Path) -> Option<PathBuf> {
    resolve_artifact_dir_with(dir, METADATA_FILE)
}

fn discard_staging(staging: &Path) {
    if let Err(err) = fs::remove_dir_all(staging) {
        warn!("Failed to remove staging directory {}: {err}", staging.display());
    }
}

/// Writes `files` into a staging directory next to `dir`, then swaps it in. The old version
/// is kept as `<name>.prev` until the new one is in place and restored if the swap fails.
pub(crate) fn swap_into_place(dir: &Path, files: &[(&str, Vec<u8>)]) -> Result<()> {
    let parent = dir
        .parent()
        .ok_or_else(|| anyhow!("Artifact directory {} has no parent", dir.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("Artifact directory {} has no name", dir.display()))?;
    let staging = parent.join(format!(".{name}.staging-{}", Uuid::new_v4()));
    fs::create_dir_all(&staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;
    for (file, contents) in files {
        let path = staging.join(file);
        if let Err(err) = fs::write(&path, contents) {
            discard_staging(&staging);
            return Err(err).with_context(|| format!("Failed to write {}", path.display()));
        }
    }

    let prev = prev_dir(dir);
    if prev.exists() {
        fs::remove_dir_all(&prev)
            .with_context(|| format!("Failed to clear {}", prev.display()))?;
    }
    let had_previous = dir.exists();
    if had_previous {
        fs::rename(dir, &prev).with_context(|| {
            format!("Failed to move {} aside to {}", dir.display(), prev.display())
        })?;
    }

    if let Err(err) = fs::rename(&staging, dir) {
        if had_previous {
            if let Err(restore_err) = fs::rename(&prev, dir) {
                warn!(
                    "Failed to restore {} from {}: {restore_err}",
                    dir.display(),
                    prev.display()
                );
            }
        }
        discard_staging(&staging);
        return Err(err).with_context(|| format!("Failed to install {}", dir.display()));
    }

    if had_previous {
        if let Err(err) = fs::remove_dir_all(&prev) {
            warn!("Failed to remove {}: {err}", prev.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regressor::LinearModel;

    fn linear_model(names: &[&str], intercept: f64) -> PriceModel {
        let feature_names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let trained_at = Utc::now();
        PriceModel {
            metadata: ModelMetadata {
                version: model_version(trained_at),
                model_name: "test".to_string(),
                model_type: "ridge".to_string(),
                learner: "ridge".to_string(),
                feature_names: feature_names.clone(),
                feature_schema_version: FEATURE_SCHEMA_VERSION,
                training_samples: 10,
                test_samples: 2,
                outliers_removed: 0,
                test_metrics: RegressionMetrics::default(),
                train_metrics: RegressionMetrics::default(),
                cv_mae: None,
                hyperparameters: Params::new(),
                feature_importance: BTreeMap::new(),
                trained_at,
                weighting: WeightingConfig::default(),
                base_platforms: None,
                n_models: None,
                seed: None,
                residual_std: None,
            },
            regressor: RegressorModel::Linear(LinearModel {
                coefficients: vec![0.0; feature_names.len()],
                intercept,
            }),
            scaler: StandardScaler {
                mean: vec![0.0; feature_names.len()],
                scale: vec![1.0; feature_names.len()],
            },
        }
    }

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn save_then_load_round_trips_and_replaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(dir.path());
        let target = store.unified_dir();

        store
            .save_model(&target, &linear_model(&["a", "b"], 1.0))
            .expect("first save");
        store
            .save_model(&target, &linear_model(&["a", "b"], 2.0))
            .expect("second save");

        let loaded = store
            .load_model(&target, &names(&["a", "b"]))
            .expect("load")
            .expect("present");
        let expected = 2f64.exp_m1();
        assert!((loaded.predict_price(&[0.0, 0.0]).expect("predict") - expected).abs() < 1e-12);
        assert!(!prev_dir(&target).exists());
    }

    #[test]
    fn missing_artifact_is_none_and_mismatch_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(dir.path());
        let target = store.meta_dir();
        assert!(store.load_model(&target, &names(&["a"])).expect("load").is_none());

        store
            .save_model(&target, &linear_model(&["a", "b"], 1.0))
            .expect("save");
        let err = store
            .load_model(&target, &names(&["b", "a"]))
            .expect_err("mismatch");
        assert!(EstimatorError::is_schema_mismatch(&err));
    }

    #[test]
    fn interrupted_swap_falls_back_to_previous_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(dir.path());
        let target = store.specialist_dir(Platform::Amazon);
        store
            .save_model(&target, &linear_model(&["a"], 1.0))
            .expect("save");
        fs::rename(&target, prev_dir(&target)).expect("simulate interrupted swap");

        let loaded = store
            .load_model(&target, &names(&["a"]))
            .expect("load")
            .expect("previous version");
        assert_eq!(loaded.metadata.model_name, "test");
    }

    #[test]
    fn failed_staging_write_leaves_no_staging_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("unified");
        let err = swap_into_place(&target, &[("missing/inner.json", b"{}".to_vec())])
            .expect_err("write into a missing subdirectory");
        assert!(err.to_string().contains("Failed to write"));
        assert!(!target.exists());
        let leftovers = fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(leftovers, 0);
    }
}
