use crate::artifacts::{ModelStore, PriceModel};
use crate::error::EstimatorError;
use crate::models::Platform;
use crate::oof::OofPredictions;
use crate::regressor::RidgeLearner;
use crate::training::{train_price_model, LabeledRow, ModelSpec, TrainingConfig};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::collections::BTreeMap;

pub const META_MODEL_NAME: &str = "meta";

/// Two inputs per base platform: its log-scale prediction and whether it was available.
pub fn meta_feature_names(base_platforms: &[Platform]) -> Vec<String> {
    base_platforms
        .iter()
        .flat_map(|platform| {
            [
                format!("{}_pred", platform.as_str()),
                format!("{}_available", platform.as_str()),
            ]
        })
        .collect()
}

/// The only place an absent specialist output becomes numbers: `0.0` with availability `0`.
/// Training and inference both go through here.
pub fn encode_meta_features(
    base_platforms: &[Platform],
    predictions: &BTreeMap<Platform, Option<f64>>,
) -> Vec<f64> {
    let mut encoded = Vec::with_capacity(base_platforms.len() * 2);
    for platform in base_platforms {
        match predictions.get(platform).copied().flatten() {
            Some(price) if price.is_finite() => {
                encoded.push(price.max(0.0).ln_1p());
                encoded.push(1.0);
            }
            _ => {
                encoded.push(0.0);
                encoded.push(0.0);
            }
        }
    }
    encoded
}

/// Stacking model over specialist outputs, tied to the platforms it was trained on.
#[derive(Debug, Clone)]
pub struct MetaModel {
    pub model: PriceModel,
    pub base_platforms: Vec<Platform>,
}

impl MetaModel {
    pub fn from_model(model: PriceModel) -> Result<Self> {
        let base_platforms = model
            .metadata
            .base_platforms
            .clone()
            .ok_or_else(|| anyhow!("Meta model metadata lists no base platforms"))?;
        Ok(Self {
            model,
            base_platforms,
        })
    }

    pub fn predict_price(&self, predictions: &BTreeMap<Platform, Option<f64>>) -> Result<f64> {
        self.model
            .predict_price(&encode_meta_features(&self.base_platforms, predictions))
    }

    /// Loads the deployed meta model, validating it against its own declared base platforms.
    pub fn load(store: &ModelStore) -> Result<Option<Self>> {
        let dir = store.meta_dir();
        let Some(metadata) = store.read_metadata(&dir)? else {
            return Ok(None);
        };
        let base_platforms = metadata
            .base_platforms
            .ok_or_else(|| anyhow!("{} lists no base platforms", dir.display()))?;
        let expected = meta_feature_names(&base_platforms);
        match store.load_model(&dir, &expected)? {
            Some(model) => Ok(Some(Self::from_model(model)?)),
            None => Ok(None),
        }
    }
}

/// Trains the stacking model on out-of-fold predictions against the canonical price.
/// Only platforms with out-of-fold signal and a deployed specialist become inputs, so every
/// input the model sees in training can also be produced at inference.
pub fn train_meta(
    oof: &OofPredictions,
    deployed: &[Platform],
    config: &TrainingConfig,
) -> Result<MetaModel> {
    let with_signal = oof.platforms_with_signal();
    let base_platforms: Vec<Platform> = with_signal
        .iter()
        .copied()
        .filter(|platform| deployed.contains(platform))
        .collect();
    let no_signal: Vec<&str> = oof
        .columns
        .keys()
        .filter(|platform| !with_signal.contains(platform))
        .map(|platform| platform.as_str())
        .collect();
    if !no_signal.is_empty() {
        info!(
            "Meta model excludes platform(s) without out-of-fold signal: {}",
            no_signal.join(", ")
        );
    }
    let undeployed: Vec<&str> = with_signal
        .iter()
        .filter(|platform| !deployed.contains(platform))
        .map(|platform| platform.as_str())
        .collect();
    if !undeployed.is_empty() {
        warn!(
            "Meta model excludes platform(s) with no deployed specialist: {}",
            undeployed.join(", ")
        );
    }
    if base_platforms.is_empty() {
        return Err(EstimatorError::InvalidDataset(
            "no deployed specialist produced out-of-fold predictions".to_string(),
        )
        .into());
    }

    let rows: Vec<LabeledRow> = (0..oof.len())
        .map(|idx| LabeledRow {
            isbn: oof.isbns[idx].clone(),
            features: encode_meta_features(&base_platforms, &oof.row(idx)),
            price: oof.targets[idx],
            price_type: oof.price_types[idx],
            timestamp: oof.timestamps[idx],
        })
        .collect();

    let spec = ModelSpec::new(META_MODEL_NAME, "meta", meta_feature_names(&base_platforms));
    let mut model = train_price_model(&spec, rows, &RidgeLearner::new(), config)?;
    model.metadata.base_platforms = Some(base_platforms.clone());
    Ok(MetaModel {
        model,
        base_platforms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceType;
    use crate::search::SearchConfig;

    #[test]
    fn absent_predictions_encode_as_zero_with_flag() {
        let base = [Platform::Abebooks, Platform::Amazon];
        let mut predictions = BTreeMap::new();
        predictions.insert(Platform::Abebooks, Some(9.0));
        predictions.insert(Platform::Amazon, None);
        let encoded = encode_meta_features(&base, &predictions);
        assert_eq!(encoded.len(), meta_feature_names(&base).len());
        assert!((encoded[0] - 10f64.ln()).abs() < 1e-12);
        assert_eq!(&encoded[1..], &[1.0, 0.0, 0.0]);
    }

    fn stacked_predictions(n: usize) -> OofPredictions {
        let targets: Vec<f64> = (0..n).map(|i| 5.0 + (i % 17) as f64 * 2.5).collect();
        let mut columns = BTreeMap::new();
        columns.insert(
            Platform::Abebooks,
            targets.iter().map(|t| Some(t * 1.2)).collect(),
        );
        columns.insert(
            Platform::Amazon,
            (0..n).map(|i| (i < 10).then_some(targets[i] * 0.9)).collect(),
        );
        OofPredictions {
            isbns: (0..n).map(|i| format!("978{i:07}")).collect(),
            targets: targets.clone(),
            price_types: vec![PriceType::Listing; n],
            timestamps: vec![None; n],
            columns,
        }
    }

    fn quick_config() -> TrainingConfig {
        TrainingConfig {
            min_samples: 20,
            cv_folds: 3,
            search: SearchConfig {
                n_iter: 0,
                ..SearchConfig::default()
            },
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn undeployed_platforms_are_not_meta_inputs() {
        let oof = stacked_predictions(80);
        assert!(oof.platforms_with_signal().contains(&Platform::Amazon));
        let meta = train_meta(&oof, &[Platform::Abebooks], &quick_config()).expect("train");
        assert_eq!(meta.base_platforms, vec![Platform::Abebooks]);
        assert_eq!(
            meta.model.metadata.feature_names,
            meta_feature_names(&[Platform::Abebooks])
        );
    }

    #[test]
    fn no_deployed_signal_is_invalid_dataset() {
        let err = train_meta(&stacked_predictions(40), &[Platform::Biblio], &quick_config())
            .expect_err("nothing to stack");
        assert!(err.to_string().contains("deployed specialist"));
    }

    #[test]
    fn feature_names_pair_prediction_with_flag() {
        assert_eq!(
            meta_feature_names(&[Platform::Biblio]),
            vec!["biblio_pred".to_string(), "biblio_available".to_string()]
        );
    }
}
