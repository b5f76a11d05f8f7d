use crate::bootstrap::BootstrapConfig;
use crate::drift::DEFAULT_DRIFT_THRESHOLD_PCT;
use crate::models::Platform;
use crate::oof::OofConfig;
use crate::param_utils::Params;
use crate::regressor::TrainerBackend;
use crate::router::RouterConfig;
use crate::search::SearchConfig;
use crate::training::TrainingConfig;
use crate::weighting::WeightingConfig;
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model_dir: PathBuf,
    pub training_data_file: Option<PathBuf>,
    pub min_training_samples: usize,
    pub cv_folds: usize,
    pub search_cv_folds: usize,
    pub search_iterations: usize,
    pub outlier_z_threshold: f64,
    pub temporal_half_life_days: f64,
    pub sold_weight_multiplier: f64,
    pub bootstrap_models: usize,
    pub random_seed: u64,
    pub trainer_backend: TrainerBackend,
    pub specialist_priority: Vec<Platform>,
    pub min_price: f64,
    pub min_unified_completeness: f64,
    pub prediction_log_file: Option<PathBuf>,
    pub monitoring_dir: PathBuf,
    pub drift_threshold_pct: f64,
    pub training_threads: usize,
}

impl EngineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let model_dir = PathBuf::from(require_setting(settings, "MODEL_DIR")?);
        let training_data_file = optional_setting(settings, "TRAINING_DATA_FILE").map(PathBuf::from);
        let min_training_samples = optional_setting_usize(settings, "MIN_TRAINING_SAMPLES", 50, 1)?;
        let cv_folds = optional_setting_usize(settings, "CV_FOLDS", 5, 2)?;
        let search_cv_folds = optional_setting_usize(settings, "SEARCH_CV_FOLDS", 3, 2)?;
        let search_iterations = optional_setting_usize(settings, "SEARCH_ITERATIONS", 50, 0)?;
        let outlier_z_threshold =
            optional_setting_f64(settings, "OUTLIER_Z_THRESHOLD", 3.0, Some(0.0), None)?;
        let temporal_half_life_days =
            optional_setting_f64(settings, "TEMPORAL_HALF_LIFE_DAYS", 365.0, Some(1.0), None)?;
        let sold_weight_multiplier =
            optional_setting_f64(settings, "SOLD_WEIGHT_MULTIPLIER", 3.0, Some(1.0), None)?;
        let bootstrap_models = optional_setting_usize(settings, "BOOTSTRAP_MODELS", 10, 2)?;
        let random_seed = optional_setting_usize(settings, "RANDOM_SEED", 42, 0)? as u64;
        let trainer_backend = TrainerBackend::parse(
            optional_setting(settings, "TRAINER_BACKEND").unwrap_or("native"),
            optional_setting(settings, "LIGHTGBM_PATH").map(PathBuf::from),
        )?;
        let specialist_priority = Platform::parse_list(
            optional_setting(settings, "ROUTER_SPECIALIST_PRIORITY").unwrap_or("abebooks"),
        )
        .map_err(|err| anyhow!("Setting ROUTER_SPECIALIST_PRIORITY is invalid: {}", err))?;
        let min_price = optional_setting_f64(settings, "MIN_PRICE", 0.01, Some(0.0), None)?;
        let min_unified_completeness = optional_setting_f64(
            settings,
            "MIN_UNIFIED_COMPLETENESS",
            0.3,
            Some(0.0),
            Some(1.0),
        )?;
        let prediction_log_file =
            optional_setting(settings, "PREDICTION_LOG_FILE").map(PathBuf::from);
        let monitoring_dir = optional_setting(settings, "MONITORING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| model_dir.join("monitoring"));
        let drift_threshold_pct = optional_setting_f64(
            settings,
            "DRIFT_THRESHOLD_PCT",
            DEFAULT_DRIFT_THRESHOLD_PCT,
            Some(0.0),
            None,
        )?;
        let training_threads =
            optional_setting_usize(settings, "TRAINING_THREADS", num_cpus::get().max(1), 1)?;

        Ok(Self {
            model_dir,
            training_data_file,
            min_training_samples,
            cv_folds,
            search_cv_folds,
            search_iterations,
            outlier_z_threshold,
            temporal_half_life_days,
            sold_weight_multiplier,
            bootstrap_models,
            random_seed,
            trainer_backend,
            specialist_priority,
            min_price,
            min_unified_completeness,
            prediction_log_file,
            monitoring_dir,
            drift_threshold_pct,
            training_threads,
        })
    }

    pub fn weighting(&self) -> WeightingConfig {
        WeightingConfig {
            half_life_days: self.temporal_half_life_days,
            sold_multiplier: self.sold_weight_multiplier,
        }
    }

    pub fn training_config(&self, show_progress: bool) -> TrainingConfig {
        TrainingConfig {
            min_samples: self.min_training_samples,
            cv_folds: self.cv_folds,
            outlier_z: self.outlier_z_threshold,
            weighting: self.weighting(),
            search: SearchConfig {
                n_iter: self.search_iterations,
                cv_folds: self.search_cv_folds,
                seed: self.random_seed,
                show_progress,
            },
            seed: self.random_seed,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            priority: self.specialist_priority.clone(),
            min_price: self.min_price,
            min_unified_completeness: self.min_unified_completeness,
        }
    }

    /// An explicit member count below two is rejected rather than raised.
    pub fn bootstrap_config(
        &self,
        n_models: Option<usize>,
        show_progress: bool,
    ) -> Result<BootstrapConfig> {
        let n_models = n_models.unwrap_or(self.bootstrap_models);
        if n_models < 2 {
            return Err(anyhow!(
                "Bootstrap ensemble needs at least 2 members, got {}",
                n_models
            ));
        }
        Ok(BootstrapConfig {
            n_models,
            seed: self.random_seed,
            weighting: self.weighting(),
            show_progress,
        })
    }

    pub fn oof_config(&self, params: BTreeMap<Platform, Params>) -> OofConfig {
        OofConfig {
            n_folds: self.cv_folds,
            min_samples: self.min_training_samples,
            weighting: self.weighting(),
            seed: self.random_seed,
            params,
        }
    }
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    match optional_setting(settings, key) {
        Some(_) => require_setting_f64(settings, key, min, max),
        None => Ok(default),
    }
}

fn require_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<usize> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    match optional_setting(settings, key) {
        Some(_) => require_setting_usize(settings, key, min),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_only_model_dir_is_set() {
        let parsed = EngineSettings::from_settings_map(&settings(&[("MODEL_DIR", "/tmp/models")]))
            .expect("settings");
        assert_eq!(parsed.model_dir, PathBuf::from("/tmp/models"));
        assert_eq!(parsed.min_training_samples, 50);
        assert_eq!(parsed.cv_folds, 5);
        assert_eq!(parsed.bootstrap_models, 10);
        assert_eq!(parsed.specialist_priority, vec![Platform::Abebooks]);
        assert_eq!(parsed.trainer_backend, TrainerBackend::Native);
        assert!((parsed.min_unified_completeness - 0.3).abs() < 1e-12);
        assert!(parsed.training_data_file.is_none());
        assert!(parsed.training_threads >= 1);
        assert_eq!(parsed.monitoring_dir, PathBuf::from("/tmp/models/monitoring"));
        assert!((parsed.drift_threshold_pct - 20.0).abs() < 1e-12);
    }

    #[test]
    fn missing_model_dir_is_rejected() {
        let err = EngineSettings::from_settings_map(&settings(&[("MODEL_DIR", "  ")]))
            .expect_err("blank model dir");
        assert!(err.to_string().contains("MODEL_DIR"));
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        for (key, value) in [
            ("CV_FOLDS", "1"),
            ("MIN_UNIFIED_COMPLETENESS", "1.5"),
            ("SEARCH_ITERATIONS", "2.5"),
            ("TRAINER_BACKEND", "xgboost"),
            ("ROUTER_SPECIALIST_PRIORITY", "abebooks,powells"),
            ("OUTLIER_Z_THRESHOLD", "abc"),
            ("DRIFT_THRESHOLD_PCT", "-5"),
        ] {
            let result =
                EngineSettings::from_settings_map(&settings(&[("MODEL_DIR", "m"), (key, value)]));
            assert!(result.is_err(), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn single_member_bootstrap_is_rejected() {
        let parsed = EngineSettings::from_settings_map(&settings(&[("MODEL_DIR", "m")]))
            .expect("settings");
        let err = parsed
            .bootstrap_config(Some(1), false)
            .expect_err("one member");
        assert!(err.to_string().contains("at least 2"));
    }

    #[test]
    fn derived_configs_carry_settings() {
        let parsed = EngineSettings::from_settings_map(&settings(&[
            ("MODEL_DIR", "m"),
            ("SEARCH_ITERATIONS", "0"),
            ("RANDOM_SEED", "7"),
            ("SOLD_WEIGHT_MULTIPLIER", "2"),
            ("ROUTER_SPECIALIST_PRIORITY", "abebooks, ebay"),
        ]))
        .expect("settings");
        let training = parsed.training_config(false);
        assert_eq!(training.search.n_iter, 0);
        assert_eq!(training.seed, 7);
        assert!((training.weighting.sold_multiplier - 2.0).abs() < 1e-12);
        assert_eq!(
            parsed.router_config().priority,
            vec![Platform::Abebooks, Platform::Ebay]
        );
        assert_eq!(
            parsed.bootstrap_config(Some(3), false).expect("bootstrap").n_models,
            3
        );
        assert_eq!(
            parsed.bootstrap_config(None, false).expect("bootstrap").n_models,
            10
        );
        assert_eq!(parsed.oof_config(BTreeMap::new()).n_folds, 5);
    }
}
