pub mod estimate;
pub mod evaluate_bootstrap;
pub mod evaluate_models;
pub mod export_lightgbm;
pub mod generate_oof;
pub mod model_info;
pub mod monitor_report;
pub mod record_truth;
pub mod save_baseline;
pub mod train_all;
pub mod train_bootstrap;
pub mod train_meta;
pub mod train_specialists;
pub mod train_unified;

use crate::artifacts::ModelMetadata;
use crate::bootstrap::BootstrapEvaluation;
use crate::models::RegressionMetrics;
use crate::param_utils::Params;
use crate::training::TOP_IMPORTANCES_LOGGED;
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSummary {
    pub model: String,
    pub version: String,
    pub learner: String,
    pub trained_at: DateTime<Utc>,
    pub training_samples: usize,
    pub test_samples: usize,
    pub outliers_removed: usize,
    pub test_metrics: RegressionMetrics,
    pub train_metrics: RegressionMetrics,
    pub cv_mae: Option<f64>,
    pub hyperparameters: Params,
    pub top_features: Vec<(String, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapEvaluation>,
}

impl TrainingSummary {
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            model: metadata.model_name.clone(),
            version: metadata.version.clone(),
            learner: metadata.learner.clone(),
            trained_at: metadata.trained_at,
            training_samples: metadata.training_samples,
            test_samples: metadata.test_samples,
            outliers_removed: metadata.outliers_removed,
            test_metrics: metadata.test_metrics,
            train_metrics: metadata.train_metrics,
            cv_mae: metadata.cv_mae,
            hyperparameters: metadata.hyperparameters.clone(),
            top_features: metadata.top_features(TOP_IMPORTANCES_LOGGED),
            bootstrap: None,
        }
    }

    pub fn with_bootstrap(mut self, evaluation: BootstrapEvaluation) -> Self {
        self.bootstrap = Some(evaluation);
        self
    }
}

/// One machine-readable line per trained model, picked up by whatever drives the CLI.
pub fn print_training_summary(summary: &TrainingSummary) {
    match serde_json::to_string(summary) {
        Ok(payload) => println!("PRICE_ENGINE_TRAIN_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize {} training summary: {err}", summary.model),
    }
}
