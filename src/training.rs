use crate::artifacts::{model_version, ModelMetadata, PriceModel};
use crate::cv::{distinct_groups, log_target, outlier_mask, select, GroupKFold};
use crate::error::EstimatorError;
use crate::features::FEATURE_SCHEMA_VERSION;
use crate::metrics::regression_metrics;
use crate::models::{PriceType, RegressionMetrics};
use crate::param_utils::{describe_params, Params};
use crate::regressor::Learner;
use crate::scaler::StandardScaler;
use crate::search::{randomized_search, SearchConfig};
use crate::weighting::{combined_weights, Observation, WeightingConfig};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::BTreeMap;

pub const DEFAULT_MIN_SAMPLES: usize = 50;
pub const DEFAULT_CV_FOLDS: usize = 5;
pub const DEFAULT_OUTLIER_Z: f64 = 3.0;
pub const TOP_IMPORTANCES_LOGGED: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct TrainingConfig {
    pub min_samples: usize,
    pub cv_folds: usize,
    pub outlier_z: f64,
    pub weighting: WeightingConfig,
    pub search: SearchConfig,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            cv_folds: DEFAULT_CV_FOLDS,
            outlier_z: DEFAULT_OUTLIER_Z,
            weighting: WeightingConfig::default(),
            search: SearchConfig::default(),
            seed: 42,
        }
    }
}

/// One extracted training row: model inputs plus the observed price and its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRow {
    pub isbn: String,
    pub features: Vec<f64>,
    pub price: f64,
    pub price_type: PriceType,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Observation for LabeledRow {
    fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    fn price_type(&self) -> PriceType {
        self.price_type
    }
}

/// Identity of the model being trained.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub model_type: String,
    pub feature_names: Vec<String>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, model_type: impl Into<String>, feature_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            model_type: model_type.into(),
            feature_names,
        }
    }
}

/// Drops rows that cannot be trained on and the target outliers. Fails with `DataInsufficient`
/// when fewer than `min_samples` rows survive either filter.
pub fn filter_rows(
    spec: &ModelSpec,
    rows: Vec<LabeledRow>,
    config: &TrainingConfig,
) -> Result<(Vec<LabeledRow>, usize)> {
    let width = spec.feature_names.len();
    let valid: Vec<LabeledRow> = rows
        .into_iter()
        .filter(|row| {
            row.price.is_finite()
                && row.price > 0.0
                && row.features.len() == width
                && row.features.iter().all(|v| v.is_finite())
        })
        .collect();
    ensure_enough(spec, valid.len(), config.min_samples)?;

    let prices: Vec<f64> = valid.iter().map(|row| row.price).collect();
    let mask = outlier_mask(&prices, config.outlier_z);
    let before = valid.len();
    let kept: Vec<LabeledRow> = valid
        .into_iter()
        .zip(mask)
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect();
    let removed = before - kept.len();
    if removed > 0 {
        info!(
            "{}: removed {} outlier(s) beyond z={}",
            spec.name, removed, config.outlier_z
        );
    }
    ensure_enough(spec, kept.len(), config.min_samples)?;
    Ok((kept, removed))
}

fn ensure_enough(spec: &ModelSpec, found: usize, required: usize) -> Result<()> {
    if found < required {
        return Err(EstimatorError::DataInsufficient {
            model: spec.name.clone(),
            found,
            required,
        }
        .into());
    }
    Ok(())
}

/// Grouped holdout, train-only scaler, log target, weighted randomized search, final fit and
/// holdout metrics in price units.
pub fn train_price_model(
    spec: &ModelSpec,
    rows: Vec<LabeledRow>,
    learner: &dyn Learner,
    config: &TrainingConfig,
) -> Result<PriceModel> {
    let (rows, outliers_removed) = filter_rows(spec, rows, config)?;

    let isbns: Vec<&str> = rows.iter().map(|row| row.isbn.as_str()).collect();
    let distinct = distinct_groups(&isbns);
    if distinct < config.cv_folds {
        return Err(EstimatorError::InvalidDataset(format!(
            "{}: {} distinct ISBNs cannot form {} grouped folds",
            spec.name, distinct, config.cv_folds
        ))
        .into());
    }
    let split = GroupKFold::new(config.cv_folds)?.holdout(&isbns)?;
    let train_rows = select(&rows, &split.train);
    let test_rows = select(&rows, &split.test);
    info!(
        "{}: {} train / {} test rows ({} ISBNs)",
        spec.name,
        train_rows.len(),
        test_rows.len(),
        distinct
    );

    let raw_train: Vec<Vec<f64>> = train_rows.iter().map(|row| row.features.clone()).collect();
    let scaler = StandardScaler::fit(&raw_train)?;
    let x_train = scaler.transform(&raw_train)?;
    let train_prices: Vec<f64> = train_rows.iter().map(|row| row.price).collect();
    let y_train = log_target(&train_prices);
    let weights = combined_weights(&train_rows, &config.weighting);
    let groups: Vec<String> = train_rows.iter().map(|row| row.isbn.clone()).collect();

    let (params, cv_mae) = choose_params(spec, learner, &x_train, &y_train, &weights, &groups, config);
    let regressor = learner.fit(&x_train, &y_train, &weights, &params, config.seed)?;

    let feature_importance: BTreeMap<String, f64> = spec
        .feature_names
        .iter()
        .cloned()
        .zip(regressor.feature_importance())
        .collect();

    let trained_at = Utc::now();
    let mut model = PriceModel {
        metadata: ModelMetadata {
            version: model_version(trained_at),
            model_name: spec.name.clone(),
            model_type: spec.model_type.clone(),
            learner: learner.name().to_string(),
            feature_names: spec.feature_names.clone(),
            feature_schema_version: FEATURE_SCHEMA_VERSION,
            training_samples: train_rows.len(),
            test_samples: test_rows.len(),
            outliers_removed,
            test_metrics: Default::default(),
            train_metrics: Default::default(),
            cv_mae,
            hyperparameters: params,
            feature_importance,
            trained_at,
            weighting: config.weighting,
            base_platforms: None,
            n_models: None,
            seed: Some(config.seed),
            residual_std: None,
        },
        regressor,
        scaler,
    };
    model.metadata.test_metrics = evaluate_rows(&model, &test_rows)?;
    model.metadata.train_metrics = evaluate_rows(&model, &train_rows)?;

    let metrics = model.metadata.test_metrics;
    info!(
        "{}: test MAE ${:.2}, RMSE ${:.2}, R2 {:.3}, MAPE {:.1}%",
        spec.name, metrics.mae, metrics.rmse, metrics.r2, metrics.mape
    );
    for (rank, (name, value)) in model
        .metadata
        .top_features(TOP_IMPORTANCES_LOGGED)
        .iter()
        .enumerate()
    {
        info!("{}:   {:>2}. {} {:.4}", spec.name, rank + 1, name, value);
    }
    Ok(model)
}

fn choose_params(
    spec: &ModelSpec,
    learner: &dyn Learner,
    x: &[Vec<f64>],
    y: &[f64],
    weights: &[f64],
    groups: &[String],
    config: &TrainingConfig,
) -> (Params, Option<f64>) {
    if config.search.n_iter == 0 {
        return (learner.default_params(), None);
    }
    let search = SearchConfig {
        seed: config.seed,
        ..config.search
    };
    match randomized_search(&spec.name, learner, x, y, weights, groups, &search) {
        Ok(outcome) => {
            let cv_mae = outcome.cv_mae();
            (outcome.best_params, Some(cv_mae))
        }
        Err(err) => {
            let defaults = learner.default_params();
            warn!(
                "{}: hyperparameter search failed ({err}); using defaults {}",
                spec.name,
                describe_params(&defaults)
            );
            (defaults, None)
        }
    }
}

/// Metrics in price units for rows scored by a finished model.
pub fn evaluate_rows(model: &PriceModel, rows: &[LabeledRow]) -> Result<RegressionMetrics> {
    let actual: Vec<f64> = rows.iter().map(|row| row.price).collect();
    let predicted = rows
        .iter()
        .map(|row| model.predict_price(&row.features))
        .collect::<Result<Vec<f64>>>()?;
    Ok(regression_metrics(&actual, &predicted))
}
