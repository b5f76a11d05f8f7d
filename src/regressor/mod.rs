pub mod gbdt;
pub mod lightgbm_cli;
pub mod ridge;
pub mod tree;

use crate::param_utils::{Params, SearchSpace};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use gbdt::GradientBoostingLearner;
pub use lightgbm_cli::LightgbmCliLearner;
pub use ridge::{LinearModel, RidgeLearner};
pub use tree::{RegressionTree, TreeEnsemble};

/// A fitted regressor. Serialized as `regressor.json` inside a model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegressorModel {
    Trees(TreeEnsemble),
    Linear(LinearModel),
}

impl RegressorModel {
    pub fn n_features(&self) -> usize {
        match self {
            RegressorModel::Trees(model) => model.n_features,
            RegressorModel::Linear(model) => model.coefficients.len(),
        }
    }

    pub fn predict_row(&self, features: &[f64]) -> Result<f64> {
        if features.len() != self.n_features() {
            return Err(anyhow!(
                "Regressor expects {} features, received {}",
                self.n_features(),
                features.len()
            ));
        }
        let value = match self {
            RegressorModel::Trees(model) => model.predict_row(features),
            RegressorModel::Linear(model) => model.predict_row(features),
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(anyhow!("Regressor produced a non-finite prediction"))
        }
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        rows.iter().map(|row| self.predict_row(row)).collect()
    }

    /// Normalised importance per input column.
    pub fn feature_importance(&self) -> Vec<f64> {
        match self {
            RegressorModel::Trees(model) => model.feature_importance(),
            RegressorModel::Linear(model) => model.feature_importance(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegressorModel::Trees(_) => "gradient_boosted_trees",
            RegressorModel::Linear(_) => "ridge",
        }
    }
}

/// Training capability: fit a regressor on a weighted dataset.
pub trait Learner: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_params(&self) -> Params;

    fn search_space(&self) -> SearchSpace;

    fn fit(
        &self,
        x: &[Vec<f64>],
        y: &[f64],
        weights: &[f64],
        params: &Params,
        seed: u64,
    ) -> Result<RegressorModel>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerBackend {
    Native,
    Lightgbm { executable: Option<PathBuf> },
}

impl TrainerBackend {
    pub fn parse(raw: &str, executable: Option<PathBuf>) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "native" => Ok(Self::Native),
            "lightgbm" => Ok(Self::Lightgbm { executable }),
            other => Err(anyhow!(
                "TRAINER_BACKEND must be native or lightgbm (value: {})",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Lightgbm { .. } => "lightgbm",
        }
    }

    /// Tree learner used for specialists, the unified model and the bootstrap ensemble.
    pub fn tree_learner(&self) -> Result<Arc<dyn Learner>> {
        match self {
            Self::Native => Ok(Arc::new(GradientBoostingLearner::new())),
            Self::Lightgbm { executable } => {
                Ok(Arc::new(LightgbmCliLearner::resolve(executable.clone())?))
            }
        }
    }
}

pub(crate) fn validate_training_inputs(x: &[Vec<f64>], y: &[f64], weights: &[f64]) -> Result<usize> {
    let first = x
        .first()
        .ok_or_else(|| anyhow!("Cannot fit a regressor on an empty dataset"))?;
    let width = first.len();
    if y.len() != x.len() || weights.len() != x.len() {
        return Err(anyhow!(
            "Training inputs disagree in length (rows={}, targets={}, weights={})",
            x.len(),
            y.len(),
            weights.len()
        ));
    }
    if x.iter().any(|row| row.len() != width) {
        return Err(anyhow!("Training rows have inconsistent widths"));
    }
    if y.iter().chain(weights).any(|v| !v.is_finite()) {
        return Err(anyhow!("Training targets and weights must be finite"));
    }
    Ok(width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regressor_json_is_tagged() {
        let model = RegressorModel::Linear(LinearModel {
            coefficients: vec![2.0],
            intercept: 1.0,
        });
        let json = serde_json::to_string(&model).expect("serialize");
        assert!(json.contains("\"kind\":\"linear\""));
        let restored: RegressorModel = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.predict_row(&[3.0]).expect("predict"), 7.0);
        assert!(restored.predict_row(&[3.0, 1.0]).is_err());
    }

    #[test]
    fn backend_parsing() {
        assert_eq!(
            TrainerBackend::parse("Native", None).expect("native"),
            TrainerBackend::Native
        );
        assert!(TrainerBackend::parse("xgboost", None).is_err());
    }
}
