use crate::artifacts::{model_version, EnsembleArtifact, ModelMetadata, ModelStore};
use crate::cv::{distinct_groups, log_target, select, GroupKFold};
use crate::error::EstimatorError;
use crate::features::FEATURE_SCHEMA_VERSION;
use crate::metrics::{mae, mean, median, population_std, regression_metrics, rmse};
use crate::param_utils::Params;
use crate::progress::training_progress;
use crate::regressor::{Learner, RegressorModel};
use crate::scaler::StandardScaler;
use crate::training::{filter_rows, LabeledRow, ModelSpec, TrainingConfig};
use crate::weighting::{combined_weights, WeightingConfig};
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

pub const BOOTSTRAP_MODEL_NAME: &str = "bootstrap";
pub const DEFAULT_BOOTSTRAP_MODELS: usize = 10;
pub const Z_90: f64 = 1.645;
pub const Z_95: f64 = 1.96;
/// Largest coverage shortfall, in fraction points, still treated as calibrated.
pub const CALIBRATION_TOLERANCE: f64 = 0.10;

#[derive(Debug, Clone, Copy)]
pub struct BootstrapConfig {
    pub n_models: usize,
    pub seed: u64,
    pub weighting: WeightingConfig,
    pub show_progress: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            n_models: DEFAULT_BOOTSTRAP_MODELS,
            seed: 42,
            weighting: WeightingConfig::default(),
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootstrapPrediction {
    pub mean: f64,
    /// Predictive spread: member disagreement combined with out-of-bag residual noise.
    pub std: f64,
    pub member_std: f64,
    pub ci_90: (f64, f64),
    pub ci_95: (f64, f64),
    pub member_predictions: Vec<f64>,
}

impl BootstrapPrediction {
    pub fn ci_90_half_width(&self) -> f64 {
        (self.ci_90.1 - self.ci_90.0) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BootstrapEvaluation {
    pub n_samples: usize,
    pub mae: f64,
    pub rmse: f64,
    pub mean_std: f64,
    pub median_std: f64,
    pub ci_90_coverage: f64,
    pub ci_95_coverage: f64,
    pub calibration: IntervalCalibration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalCalibration {
    pub expected_ci_90_coverage: f64,
    pub expected_ci_95_coverage: f64,
    pub ci_90_shortfall: f64,
    pub ci_95_shortfall: f64,
    pub calibrated: bool,
}

impl IntervalCalibration {
    pub fn from_coverage(ci_90_coverage: f64, ci_95_coverage: f64) -> Self {
        let ci_90_shortfall = (0.90 - ci_90_coverage).max(0.0);
        let ci_95_shortfall = (0.95 - ci_95_coverage).max(0.0);
        Self {
            expected_ci_90_coverage: 0.90,
            expected_ci_95_coverage: 0.95,
            ci_90_shortfall,
            ci_95_shortfall,
            calibrated: ci_90_shortfall <= CALIBRATION_TOLERANCE
                && ci_95_shortfall <= CALIBRATION_TOLERANCE,
        }
    }
}

fn member_seed(seed: u64, member: usize) -> u64 {
    seed.wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(member as u64 + 1)
}

/// Members trained on bootstrap resamples of one dataset, sharing a single scaler.
#[derive(Debug, Clone)]
pub struct BootstrapEnsemble {
    artifact: EnsembleArtifact,
}

impl BootstrapEnsemble {
    pub fn from_artifact(artifact: EnsembleArtifact) -> Self {
        Self { artifact }
    }

    pub fn artifact(&self) -> &EnsembleArtifact {
        &self.artifact
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.artifact.metadata
    }

    pub fn n_models(&self) -> usize {
        self.artifact.regressors.len()
    }

    /// Out-of-bag residual spread in log-price space; zero for artifacts that predate it.
    pub fn residual_std(&self) -> f64 {
        self.artifact.metadata.residual_std.unwrap_or(0.0)
    }

    /// Fits `n_models` members on rows resampled with replacement. Sample weights travel with
    /// their rows. Rows a member never drew score its residuals, pooled into `residual_std`.
    pub fn fit(
        feature_names: &[String],
        rows: &[LabeledRow],
        learner: &dyn Learner,
        params: &Params,
        config: &BootstrapConfig,
    ) -> Result<Self> {
        if rows.is_empty() {
            return Err(anyhow!("Cannot fit a bootstrap ensemble on an empty dataset"));
        }
        if config.n_models == 0 {
            return Err(anyhow!("Bootstrap ensemble needs at least one member"));
        }
        let raw: Vec<Vec<f64>> = rows.iter().map(|row| row.features.clone()).collect();
        let scaler = StandardScaler::fit(&raw)?;
        let x = scaler.transform(&raw)?;
        let prices: Vec<f64> = rows.iter().map(|row| row.price).collect();
        let y = log_target(&prices);
        let weights = combined_weights(rows, &config.weighting);

        info!(
            "Fitting {} bootstrap member(s) on {} row(s) with {}",
            config.n_models,
            rows.len(),
            learner.name()
        );
        let pb = training_progress(config.n_models, config.show_progress);
        pb.set_message("bootstrap");
        let members = (0..config.n_models)
            .into_par_iter()
            .map(|member| -> Result<(RegressorModel, f64, usize)> {
                let seed = member_seed(config.seed, member);
                let mut rng = StdRng::seed_from_u64(seed);
                let sample: Vec<usize> = (0..rows.len())
                    .map(|_| rng.gen_range(0..rows.len()))
                    .collect();
                let fitted = learner.fit(
                    &select(&x, &sample),
                    &select(&y, &sample),
                    &select(&weights, &sample),
                    params,
                    seed,
                )?;
                let mut in_bag = vec![false; rows.len()];
                for &index in &sample {
                    in_bag[index] = true;
                }
                let mut squared = 0.0;
                let mut out_of_bag = 0usize;
                for (index, drawn) in in_bag.iter().enumerate() {
                    if !drawn {
                        let residual = y[index] - fitted.predict_row(&x[index])?;
                        squared += residual * residual;
                        out_of_bag += 1;
                    }
                }
                pb.inc(1);
                Ok((fitted, squared, out_of_bag))
            })
            .collect::<Result<Vec<_>>>()?;
        pb.finish_and_clear();

        let squared: f64 = members.iter().map(|(_, sum, _)| sum).sum();
        let out_of_bag: usize = members.iter().map(|(_, _, count)| count).sum();
        let residual_std = if out_of_bag > 0 {
            (squared / out_of_bag as f64).sqrt()
        } else {
            0.0
        };
        info!(
            "Out-of-bag log residual std {:.4} over {} prediction(s)",
            residual_std, out_of_bag
        );
        let regressors: Vec<RegressorModel> =
            members.into_iter().map(|(regressor, _, _)| regressor).collect();

        let trained_at = Utc::now();
        let metadata = ModelMetadata {
            version: model_version(trained_at),
            model_name: BOOTSTRAP_MODEL_NAME.to_string(),
            model_type: "bootstrap".to_string(),
            learner: learner.name().to_string(),
            feature_names: feature_names.to_vec(),
            feature_schema_version: FEATURE_SCHEMA_VERSION,
            training_samples: rows.len(),
            test_samples: 0,
            outliers_removed: 0,
            test_metrics: Default::default(),
            train_metrics: Default::default(),
            cv_mae: None,
            hyperparameters: params.clone(),
            feature_importance: BTreeMap::new(),
            trained_at,
            weighting: config.weighting,
            base_platforms: None,
            n_models: Some(config.n_models),
            seed: Some(config.seed),
            residual_std: Some(residual_std),
        };
        let mut ensemble = Self {
            artifact: EnsembleArtifact {
                metadata,
                regressors,
                scaler,
            },
        };
        ensemble.artifact.metadata.feature_importance = ensemble.mean_importance();
        Ok(ensemble)
    }

    fn mean_importance(&self) -> BTreeMap<String, f64> {
        let names = &self.artifact.metadata.feature_names;
        let mut totals = vec![0.0; names.len()];
        for regressor in &self.artifact.regressors {
            for (total, value) in totals.iter_mut().zip(regressor.feature_importance()) {
                *total += value;
            }
        }
        let members = self.n_models().max(1) as f64;
        names
            .iter()
            .cloned()
            .zip(totals.into_iter().map(|total| total / members))
            .collect()
    }

    /// Per-member prices plus their spread and normal-approximation intervals. The log-space
    /// residual spread is carried to price space at the ensemble mean.
    pub fn predict(&self, features: &[f64]) -> Result<BootstrapPrediction> {
        let scaled = self.artifact.scaler.transform_row(features)?;
        let member_predictions = self
            .artifact
            .regressors
            .iter()
            .map(|regressor| -> Result<f64> { Ok(regressor.predict_row(&scaled)?.exp_m1()) })
            .collect::<Result<Vec<f64>>>()?;
        let center = mean(&member_predictions);
        let member_std = population_std(&member_predictions).max(0.0);
        let noise_std = self.residual_std() * (center.max(0.0) + 1.0);
        let std = member_std.hypot(noise_std);
        Ok(BootstrapPrediction {
            mean: center,
            std,
            member_std,
            ci_90: (center - Z_90 * std, center + Z_90 * std),
            ci_95: (center - Z_95 * std, center + Z_95 * std),
            member_predictions,
        })
    }

    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Result<Vec<BootstrapPrediction>> {
        rows.iter().map(|row| self.predict(row)).collect()
    }

    /// Point accuracy, spread and empirical interval coverage on labelled rows.
    pub fn evaluate(&self, rows: &[Vec<f64>], actual: &[f64]) -> Result<BootstrapEvaluation> {
        if rows.len() != actual.len() || rows.is_empty() {
            return Err(anyhow!(
                "Bootstrap evaluation needs matching, non-empty inputs ({} rows, {} targets)",
                rows.len(),
                actual.len()
            ));
        }
        let predictions = self.predict_batch(rows)?;
        let means: Vec<f64> = predictions.iter().map(|p| p.mean).collect();
        let stds: Vec<f64> = predictions.iter().map(|p| p.std).collect();
        let mut inside_90 = 0usize;
        let mut inside_95 = 0usize;
        for (prediction, y) in predictions.iter().zip(actual) {
            if *y >= prediction.ci_90.0 && *y <= prediction.ci_90.1 {
                inside_90 += 1;
            }
            if *y >= prediction.ci_95.0 && *y <= prediction.ci_95.1 {
                inside_95 += 1;
            }
        }
        let n = actual.len() as f64;
        let ci_90_coverage = inside_90 as f64 / n;
        let ci_95_coverage = inside_95 as f64 / n;
        Ok(BootstrapEvaluation {
            n_samples: actual.len(),
            mae: mae(actual, &means),
            rmse: rmse(actual, &means),
            mean_std: mean(&stds),
            median_std: median(&stds),
            ci_90_coverage,
            ci_95_coverage,
            calibration: IntervalCalibration::from_coverage(ci_90_coverage, ci_95_coverage),
        })
    }

    pub fn save(&self, store: &ModelStore) -> Result<()> {
        store.save_ensemble(&store.bootstrap_dir(), &self.artifact)
    }

    pub fn load(store: &ModelStore, expected_features: &[String]) -> Result<Option<Self>> {
        Ok(store
            .load_ensemble(&store.bootstrap_dir(), expected_features)?
            .map(Self::from_artifact))
    }
}

/// Filters like any other model, fits on the grouped training partition and reports
/// coverage on the held-out ISBNs.
pub fn train_bootstrap(
    spec: &ModelSpec,
    rows: Vec<LabeledRow>,
    learner: &dyn Learner,
    params: &Params,
    training: &TrainingConfig,
    config: &BootstrapConfig,
) -> Result<(BootstrapEnsemble, BootstrapEvaluation)> {
    let (rows, outliers_removed) = filter_rows(spec, rows, training)?;
    let isbns: Vec<&str> = rows.iter().map(|row| row.isbn.as_str()).collect();
    let distinct = distinct_groups(&isbns);
    if distinct < training.cv_folds {
        return Err(EstimatorError::InvalidDataset(format!(
            "{}: {} distinct ISBNs cannot form {} grouped folds",
            spec.name, distinct, training.cv_folds
        ))
        .into());
    }
    let split = GroupKFold::new(training.cv_folds)?.holdout(&isbns)?;
    let train_rows = select(&rows, &split.train);
    let test_rows = select(&rows, &split.test);

    let mut ensemble =
        BootstrapEnsemble::fit(&spec.feature_names, &train_rows, learner, params, config)?;

    let test_x: Vec<Vec<f64>> = test_rows.iter().map(|row| row.features.clone()).collect();
    let test_y: Vec<f64> = test_rows.iter().map(|row| row.price).collect();
    let evaluation = ensemble.evaluate(&test_x, &test_y)?;
    let train_x: Vec<Vec<f64>> = train_rows.iter().map(|row| row.features.clone()).collect();
    let train_y: Vec<f64> = train_rows.iter().map(|row| row.price).collect();
    let train_means: Vec<f64> = ensemble
        .predict_batch(&train_x)?
        .iter()
        .map(|p| p.mean)
        .collect();
    let test_means: Vec<f64> = ensemble
        .predict_batch(&test_x)?
        .iter()
        .map(|p| p.mean)
        .collect();

    let metadata = &mut ensemble.artifact.metadata;
    metadata.test_samples = test_rows.len();
    metadata.outliers_removed = outliers_removed;
    metadata.test_metrics = regression_metrics(&test_y, &test_means);
    metadata.train_metrics = regression_metrics(&train_y, &train_means);
    info!(
        "{}: held-out MAE ${:.2}, 90% coverage {:.1}%, 95% coverage {:.1}%",
        spec.name,
        evaluation.mae,
        evaluation.ci_90_coverage * 100.0,
        evaluation.ci_95_coverage * 100.0
    );
    if !evaluation.calibration.calibrated {
        warn!(
            "{}: intervals under-cover held-out prices (90% short by {:.1} points, 95% short by {:.1} points)",
            spec.name,
            evaluation.calibration.ci_90_shortfall * 100.0,
            evaluation.calibration.ci_95_shortfall * 100.0
        );
    }
    Ok((ensemble, evaluation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param_utils::params_from_pairs;
    use crate::regressor::GradientBoostingLearner;
    use crate::training::tests::linear_rows;
    use crate::models::PriceType;

    fn small_params() -> Params {
        params_from_pairs(&[("n_estimators", 30.0), ("max_depth", 3.0), ("learning_rate", 0.2)])
    }

    fn names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn predictions_are_deterministic_with_nested_intervals() {
        let rows = linear_rows(120, 5);
        let config = BootstrapConfig {
            n_models: 4,
            ..BootstrapConfig::default()
        };
        let learner = GradientBoostingLearner::new();
        let first = BootstrapEnsemble::fit(&names(), &rows, &learner, &small_params(), &config)
            .expect("fit");
        let second = BootstrapEnsemble::fit(&names(), &rows, &learner, &small_params(), &config)
            .expect("fit again");

        let query = [1.5, 0.5];
        let a = first.predict(&query).expect("predict");
        let b = first.predict(&query).expect("predict twice");
        assert_eq!(a, b);
        assert_eq!(a, second.predict(&query).expect("predict refit"));
        assert_eq!(a.member_predictions.len(), 4);
        assert!(a.std >= 0.0);
        assert!(a.ci_95.0 <= a.ci_90.0 && a.ci_90.1 <= a.ci_95.1);
    }

    #[test]
    fn evaluation_reports_coverage_fractions() {
        let rows = linear_rows(150, 6);
        let spec = ModelSpec::new("bootstrap_test", "bootstrap", names());
        let config = BootstrapConfig {
            n_models: 5,
            ..BootstrapConfig::default()
        };
        let (ensemble, evaluation) = train_bootstrap(
            &spec,
            rows,
            &GradientBoostingLearner::new(),
            &small_params(),
            &TrainingConfig::default(),
            &config,
        )
        .expect("train");
        assert_eq!(ensemble.n_models(), 5);
        assert!(evaluation.n_samples > 0);
        assert!((0.0..=1.0).contains(&evaluation.ci_90_coverage));
        assert!(evaluation.ci_95_coverage >= evaluation.ci_90_coverage);
        assert!(evaluation.mean_std >= 0.0);
    }

    /// Prices with +/-30% multiplicative noise, one row per ISBN.
    fn noisy_rows(n: usize, seed: u64) -> Vec<LabeledRow> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let a: f64 = rng.gen_range(0.0..1.0);
                let b: f64 = rng.gen_range(0.0..1.0);
                let noise: f64 = rng.gen_range(0.7..1.3);
                LabeledRow {
                    isbn: format!("978{i:07}"),
                    features: vec![a, b],
                    price: (5.0 + 40.0 * a + 10.0 * b) * noise,
                    price_type: PriceType::Listing,
                    timestamp: None,
                }
            })
            .collect()
    }

    #[test]
    fn ninety_percent_interval_covers_noisy_held_out_prices() {
        let learner = GradientBoostingLearner::new();
        let spec = ModelSpec::new("bootstrap_calibration", "bootstrap", names());
        let config = BootstrapConfig {
            n_models: 10,
            seed: 42,
            ..BootstrapConfig::default()
        };
        let (ensemble, evaluation) = train_bootstrap(
            &spec,
            noisy_rows(1_000, 42),
            &learner,
            &learner.default_params(),
            &TrainingConfig::default(),
            &config,
        )
        .expect("train");
        assert!(ensemble.residual_std() > 0.0);
        assert!(evaluation.n_samples >= 150);
        assert!(
            (0.80..=1.0).contains(&evaluation.ci_90_coverage),
            "90% coverage {:.3}",
            evaluation.ci_90_coverage
        );
        assert!(evaluation.calibration.calibrated);
    }

    #[test]
    fn shortfall_beyond_tolerance_is_uncalibrated() {
        let narrow = IntervalCalibration::from_coverage(0.36, 0.41);
        assert!(!narrow.calibrated);
        assert!((narrow.ci_90_shortfall - 0.54).abs() < 1e-9);
        let wide = IntervalCalibration::from_coverage(1.0, 1.0);
        assert!(wide.calibrated);
        assert_eq!(wide.ci_90_shortfall, 0.0);
    }

    #[test]
    fn residual_noise_widens_intervals_beyond_member_spread() {
        let rows = noisy_rows(200, 8);
        let config = BootstrapConfig {
            n_models: 3,
            ..BootstrapConfig::default()
        };
        let ensemble = BootstrapEnsemble::fit(
            &names(),
            &rows,
            &GradientBoostingLearner::new(),
            &small_params(),
            &config,
        )
        .expect("fit");
        let prediction = ensemble.predict(&[0.5, 0.5]).expect("predict");
        assert!(prediction.std >= prediction.member_std);
        assert!(prediction.std > 0.0);
    }
}
