use crate::artifacts::{read_json, resolve_artifact_dir_with, swap_into_place, to_json, ModelStore};
use crate::cv::{distinct_groups, log_target, select, GroupKFold};
use crate::features::FeatureExtractor;
use crate::metrics::{mean, population_std, regression_metrics};
use crate::models::{Platform, PriceType, TrainingRecord};
use crate::param_utils::Params;
use crate::regressor::Learner;
use crate::scaler::StandardScaler;
use crate::specialist::specialist_rows;
use crate::training::{LabeledRow, DEFAULT_MIN_SAMPLES};
use crate::weighting::{combined_weights, WeightingConfig};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

pub const OOF_PREDICTIONS_FILE: &str = "oof_predictions.bin";
pub const OOF_METADATA_FILE: &str = "oof_metadata.json";

/// Out-of-fold specialist predictions aligned with the canonical dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OofPredictions {
    pub isbns: Vec<String>,
    pub targets: Vec<f64>,
    pub price_types: Vec<PriceType>,
    pub timestamps: Vec<Option<DateTime<Utc>>>,
    /// `None` where the platform had nothing to say about the row.
    pub columns: BTreeMap<Platform, Vec<Option<f64>>>,
}

impl OofPredictions {
    pub fn len(&self) -> usize {
        self.isbns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.isbns.is_empty()
    }

    pub fn available_count(&self, platform: Platform) -> usize {
        self.columns
            .get(&platform)
            .map(|column| column.iter().filter(|p| p.is_some()).count())
            .unwrap_or(0)
    }

    /// Platforms with at least one available prediction, in canonical order.
    pub fn platforms_with_signal(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|platform| self.available_count(*platform) > 0)
            .collect()
    }

    pub fn row(&self, idx: usize) -> BTreeMap<Platform, Option<f64>> {
        self.columns
            .iter()
            .map(|(platform, column)| (*platform, column.get(idx).copied().flatten()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformOofMetadata {
    pub n_samples: usize,
    pub n_folds: usize,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub r2: Option<f64>,
    pub target_mean: Option<f64>,
    pub target_std: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PlatformOofMetadata {
    fn absent(n_folds: usize, reason: String) -> Self {
        Self {
            n_folds,
            reason: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OofMetadata {
    pub generated_at: DateTime<Utc>,
    pub n_rows: usize,
    pub n_folds: usize,
    pub platforms: BTreeMap<Platform, PlatformOofMetadata>,
}

#[derive(Debug, Clone)]
pub struct OofConfig {
    pub n_folds: usize,
    /// Same floor specialist training applies; smaller platforms get no column.
    pub min_samples: usize,
    pub weighting: WeightingConfig,
    pub seed: u64,
    /// Per-platform hyperparameters, typically copied from the deployed specialists.
    pub params: BTreeMap<Platform, Params>,
}

impl Default for OofConfig {
    fn default() -> Self {
        Self {
            n_folds: 5,
            min_samples: DEFAULT_MIN_SAMPLES,
            weighting: WeightingConfig::default(),
            seed: 42,
            params: BTreeMap::new(),
        }
    }
}

/// Predictions for every canonical row from models that never saw that row's ISBN.
pub fn generate_oof(
    records: &[TrainingRecord],
    platforms: &[Platform],
    learner: &dyn Learner,
    config: &OofConfig,
    extractor: &FeatureExtractor,
) -> Result<(OofPredictions, OofMetadata)> {
    let canonical: Vec<_> = records
        .iter()
        .filter_map(|record| record.sample_for(Platform::CANONICAL))
        .collect();
    if canonical.is_empty() {
        return Err(anyhow!(
            "No rows carry a {} price; cannot build out-of-fold predictions",
            Platform::CANONICAL
        ));
    }
    info!(
        "Generating out-of-fold predictions for {} canonical row(s) with {} folds",
        canonical.len(),
        config.n_folds
    );

    let canonical_records: Vec<TrainingRecord> = records
        .iter()
        .filter(|record| record.sample_for(Platform::CANONICAL).is_some())
        .cloned()
        .collect();

    let mut columns = BTreeMap::new();
    let mut platform_meta = BTreeMap::new();
    for &platform in platforms {
        let rows = specialist_rows(&canonical_records, platform, extractor);
        // `specialist_rows` keeps record order, so map each row back to its canonical index.
        let row_index: Vec<usize> = canonical_records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.sample_for(platform).is_some())
            .map(|(idx, _)| idx)
            .collect();

        let mut column = vec![None; canonical.len()];
        let meta = match platform_oof(platform, &rows, learner, config) {
            Ok((predictions, meta)) => {
                for (row_pos, prediction) in predictions.into_iter().enumerate() {
                    column[row_index[row_pos]] = Some(prediction);
                }
                meta
            }
            Err(reason) => {
                warn!("{}: out-of-fold predictions unavailable: {}", platform, reason);
                PlatformOofMetadata::absent(config.n_folds, reason)
            }
        };
        columns.insert(platform, column);
        platform_meta.insert(platform, meta);
    }

    let predictions = OofPredictions {
        isbns: canonical.iter().map(|s| s.isbn.clone()).collect(),
        targets: canonical.iter().map(|s| s.target_price).collect(),
        price_types: canonical.iter().map(|s| s.target_type).collect(),
        timestamps: canonical.iter().map(|s| s.timestamp).collect(),
        columns,
    };
    let metadata = OofMetadata {
        generated_at: Utc::now(),
        n_rows: predictions.len(),
        n_folds: config.n_folds,
        platforms: platform_meta,
    };
    Ok((predictions, metadata))
}

/// Out-of-fold price predictions for one platform's rows, or the reason there are none.
fn platform_oof(
    platform: Platform,
    rows: &[LabeledRow],
    learner: &dyn Learner,
    config: &OofConfig,
) -> std::result::Result<(Vec<f64>, PlatformOofMetadata), String> {
    if rows.is_empty() {
        return Err(format!(
            "no rows intersect the {} dataset",
            Platform::CANONICAL
        ));
    }
    if rows.len() < config.min_samples {
        return Err(format!(
            "{} row(s) is below the {} row training minimum",
            rows.len(),
            config.min_samples
        ));
    }
    let isbns: Vec<&str> = rows.iter().map(|row| row.isbn.as_str()).collect();
    let distinct = distinct_groups(&isbns);
    if distinct < config.n_folds {
        return Err(format!(
            "{} distinct ISBN(s) is fewer than {} folds",
            distinct, config.n_folds
        ));
    }
    let splits = GroupKFold::new(config.n_folds)
        .and_then(|kfold| kfold.split(&isbns))
        .map_err(|err| err.to_string())?;

    let params = config
        .params
        .get(&platform)
        .cloned()
        .unwrap_or_else(|| learner.default_params());

    let fold_results: Vec<Result<Vec<(usize, f64)>>> = splits
        .par_iter()
        .map(|split| {
            let train = select(rows, &split.train);
            let raw_train: Vec<Vec<f64>> = train.iter().map(|row| row.features.clone()).collect();
            let scaler = StandardScaler::fit(&raw_train)?;
            let prices: Vec<f64> = train.iter().map(|row| row.price).collect();
            let regressor = learner.fit(
                &scaler.transform(&raw_train)?,
                &log_target(&prices),
                &combined_weights(&train, &config.weighting),
                &params,
                config.seed,
            )?;
            split
                .test
                .iter()
                .map(|&idx| -> Result<(usize, f64)> {
                    let scaled = scaler.transform_row(&rows[idx].features)?;
                    Ok((idx, regressor.predict_row(&scaled)?.exp_m1()))
                })
                .collect()
        })
        .collect();

    let mut predictions = vec![f64::NAN; rows.len()];
    for result in fold_results {
        for (idx, prediction) in result.map_err(|err| format!("fold training failed: {err}"))? {
            predictions[idx] = prediction;
        }
    }
    if predictions.iter().any(|p| !p.is_finite()) {
        return Err("a fold produced non-finite predictions".to_string());
    }

    let targets: Vec<f64> = rows.iter().map(|row| row.price).collect();
    let metrics = regression_metrics(&targets, &predictions);
    info!(
        "{}: out-of-fold MAE ${:.2}, R2 {:.3} over {} row(s)",
        platform,
        metrics.mae,
        metrics.r2,
        rows.len()
    );
    Ok((
        predictions,
        PlatformOofMetadata {
            n_samples: rows.len(),
            n_folds: config.n_folds,
            mae: Some(metrics.mae),
            rmse: Some(metrics.rmse),
            r2: Some(metrics.r2),
            target_mean: Some(mean(&targets)),
            target_std: Some(population_std(&targets)),
            reason: None,
        },
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailabilityRow {
    pub platform: Platform,
    pub available: usize,
    pub total: usize,
    pub coverage: f64,
}

/// Per-platform coverage of the canonical dataset.
pub fn availability_report(predictions: &OofPredictions) -> Vec<AvailabilityRow> {
    let total = predictions.len();
    predictions
        .columns
        .keys()
        .map(|&platform| {
            let available = predictions.available_count(platform);
            AvailabilityRow {
                platform,
                available,
                total,
                coverage: if total > 0 {
                    available as f64 / total as f64
                } else {
                    0.0
                },
            }
        })
        .collect()
}

pub fn save_oof(store: &ModelStore, predictions: &OofPredictions, metadata: &OofMetadata) -> Result<()> {
    let encoded = bincode::serialize(predictions).context("Failed to encode OOF predictions")?;
    let dir = store.oof_dir();
    swap_into_place(
        &dir,
        &[
            (OOF_PREDICTIONS_FILE, encoded),
            (OOF_METADATA_FILE, to_json(metadata)?),
        ],
    )?;
    info!(
        "Saved out-of-fold predictions for {} row(s) to {}",
        predictions.len(),
        dir.display()
    );
    Ok(())
}

pub fn load_oof(store: &ModelStore) -> Result<Option<(OofPredictions, OofMetadata)>> {
    let Some(dir) = resolve_artifact_dir_with(&store.oof_dir(), OOF_METADATA_FILE) else {
        return Ok(None);
    };
    let path = dir.join(OOF_PREDICTIONS_FILE);
    let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let predictions: OofPredictions = bincode::deserialize(&bytes)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    let metadata: OofMetadata = read_json(&dir.join(OOF_METADATA_FILE))?;
    Ok(Some((predictions, metadata)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regressor::RidgeLearner;

    fn predictions() -> OofPredictions {
        let mut columns = BTreeMap::new();
        columns.insert(Platform::Abebooks, vec![Some(10.0), None, Some(14.0), None]);
        columns.insert(Platform::Biblio, vec![None; 4]);
        OofPredictions {
            isbns: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            targets: vec![11.0, 12.0, 13.0, 14.0],
            price_types: vec![PriceType::Sold; 4],
            timestamps: vec![None; 4],
            columns,
        }
    }

    #[test]
    fn platforms_below_training_minimum_get_no_column() {
        let rows = crate::training::tests::linear_rows(30, 4);
        let config = OofConfig {
            n_folds: 3,
            min_samples: 50,
            ..OofConfig::default()
        };
        let reason = platform_oof(Platform::Amazon, &rows, &RidgeLearner::new(), &config)
            .expect_err("below minimum");
        assert!(reason.contains("minimum"), "{reason}");

        let relaxed = OofConfig {
            min_samples: 20,
            ..config
        };
        let (column, meta) = platform_oof(Platform::Amazon, &rows, &RidgeLearner::new(), &relaxed)
            .expect("enough rows");
        assert_eq!(column.len(), rows.len());
        assert_eq!(meta.n_samples, rows.len());
    }

    #[test]
    fn availability_counts_present_predictions() {
        let report = availability_report(&predictions());
        assert_eq!(report[0].platform, Platform::Abebooks);
        assert_eq!(report[0].available, 2);
        assert!((report[0].coverage - 0.5).abs() < 1e-12);
        assert_eq!(report[1].available, 0);
        assert_eq!(predictions().platforms_with_signal(), vec![Platform::Abebooks]);
    }

    #[test]
    fn snapshot_round_trips_through_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(dir.path());
        assert!(load_oof(&store).expect("load").is_none());

        let metadata = OofMetadata {
            generated_at: Utc::now(),
            n_rows: 4,
            n_folds: 5,
            platforms: BTreeMap::new(),
        };
        save_oof(&store, &predictions(), &metadata).expect("save");
        let (loaded, loaded_meta) = load_oof(&store).expect("load").expect("present");
        assert_eq!(loaded, predictions());
        assert_eq!(loaded_meta, metadata);
    }
}
