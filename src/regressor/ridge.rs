use super::{validate_training_inputs, Learner, RegressorModel};
use crate::param_utils::{get_param_f64_clamped, params_from_pairs, space_from_pairs, Params, SearchSpace};
use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LinearModel {
    pub fn predict_row(&self, features: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }

    pub fn feature_importance(&self) -> Vec<f64> {
        let total: f64 = self.coefficients.iter().map(|c| c.abs()).sum();
        self.coefficients
            .iter()
            .map(|c| if total > 0.0 { c.abs() / total } else { 0.0 })
            .collect()
    }
}

/// Weighted L2-regularised least squares with an unpenalised intercept.
#[derive(Debug, Clone, Copy, Default)]
pub struct RidgeLearner;

impl RidgeLearner {
    pub fn new() -> Self {
        Self
    }
}

impl Learner for RidgeLearner {
    fn name(&self) -> &'static str {
        "ridge"
    }

    fn default_params(&self) -> Params {
        params_from_pairs(&[("alpha", 1.0)])
    }

    fn search_space(&self) -> SearchSpace {
        space_from_pairs(&[(
            "alpha",
            &[0.001, 0.01, 0.1, 1.0, 10.0, 100.0, 1000.0],
        )])
    }

    fn fit(
        &self,
        x: &[Vec<f64>],
        y: &[f64],
        weights: &[f64],
        params: &Params,
        _seed: u64,
    ) -> Result<RegressorModel> {
        let width = validate_training_inputs(x, y, weights)?;
        let alpha = get_param_f64_clamped(params, "alpha", 1.0, 1e-8, 1e8);

        let weight_sum: f64 = weights.iter().sum();
        if weight_sum <= 0.0 {
            return Err(anyhow!("Ridge regression needs a positive total sample weight"));
        }
        let x_mean: Vec<f64> = (0..width)
            .map(|col| {
                x.iter()
                    .zip(weights)
                    .map(|(row, w)| row[col] * w)
                    .sum::<f64>()
                    / weight_sum
            })
            .collect();
        let y_mean = y.iter().zip(weights).map(|(t, w)| t * w).sum::<f64>() / weight_sum;

        if width == 0 {
            return Ok(RegressorModel::Linear(LinearModel {
                coefficients: Vec::new(),
                intercept: y_mean,
            }));
        }

        // Rows scaled by sqrt(w) turn the weighted problem into ordinary ridge.
        let design = DMatrix::from_fn(x.len(), width, |r, c| {
            (x[r][c] - x_mean[c]) * weights[r].sqrt()
        });
        let target = DVector::from_fn(y.len(), |r, _| (y[r] - y_mean) * weights[r].sqrt());

        let gram = design.transpose() * &design + DMatrix::identity(width, width) * alpha;
        let rhs = design.transpose() * target;
        let cholesky = gram
            .cholesky()
            .ok_or_else(|| anyhow!("Ridge normal equations are not positive definite"))?;
        let beta = cholesky.solve(&rhs);

        let coefficients: Vec<f64> = beta.iter().copied().collect();
        let intercept = y_mean
            - coefficients
                .iter()
                .zip(&x_mean)
                .map(|(c, m)| c * m)
                .sum::<f64>();

        Ok(RegressorModel::Linear(LinearModel {
            coefficients,
            intercept,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_a_linear_relation_with_small_alpha() {
        let x: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64, (i % 7) as f64]).collect();
        let y: Vec<f64> = x.iter().map(|row| 3.0 + 2.0 * row[0] - row[1]).collect();
        let weights = vec![1.0; x.len()];
        let params = params_from_pairs(&[("alpha", 1e-6)]);
        let model = RidgeLearner::new()
            .fit(&x, &y, &weights, &params, 0)
            .expect("fit");
        let RegressorModel::Linear(linear) = &model else {
            panic!("expected linear model");
        };
        assert!((linear.coefficients[0] - 2.0).abs() < 1e-4);
        assert!((linear.coefficients[1] + 1.0).abs() < 1e-4);
        assert!((linear.intercept - 3.0).abs() < 1e-3);
    }

    #[test]
    fn large_alpha_shrinks_towards_weighted_mean() {
        let x: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let weights = vec![1.0; 10];
        let params = params_from_pairs(&[("alpha", 1e8)]);
        let model = RidgeLearner::new()
            .fit(&x, &y, &weights, &params, 0)
            .expect("fit");
        assert!((model.predict_row(&[0.0]).expect("predict") - 4.5).abs() < 1e-3);
    }
}
