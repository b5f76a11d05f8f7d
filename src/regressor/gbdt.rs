use super::tree::{RegressionTree, TreeEnsemble};
use super::{validate_training_inputs, Learner, RegressorModel};
use crate::param_utils::{
    get_param_f64_clamped, get_param_usize_rounded_clamped, params_from_pairs, space_from_pairs,
    Params, SearchSpace,
};
use anyhow::Result;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;

pub const MAX_BINS: usize = 64;

/// Boosting configuration decoded from a parameter map, with the usual gradient-boosting names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoostingConfig {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub subsample: f64,
    pub colsample_bytree: f64,
    pub min_child_weight: f64,
    pub gamma: f64,
    pub reg_alpha: f64,
    pub reg_lambda: f64,
}

impl BoostingConfig {
    pub fn from_params(params: &Params) -> Self {
        Self {
            n_estimators: get_param_usize_rounded_clamped(params, "n_estimators", 200, 1, 5_000),
            max_depth: get_param_usize_rounded_clamped(params, "max_depth", 4, 1, 12),
            learning_rate: get_param_f64_clamped(params, "learning_rate", 0.05, 1e-4, 1.0),
            subsample: get_param_f64_clamped(params, "subsample", 0.8, 0.05, 1.0),
            colsample_bytree: get_param_f64_clamped(params, "colsample_bytree", 0.8, 0.05, 1.0),
            min_child_weight: get_param_f64_clamped(params, "min_child_weight", 3.0, 0.0, 1e6),
            gamma: get_param_f64_clamped(params, "gamma", 0.0, 0.0, 1e6),
            reg_alpha: get_param_f64_clamped(params, "reg_alpha", 0.0, 0.0, 1e6),
            reg_lambda: get_param_f64_clamped(params, "reg_lambda", 1.0, 0.0, 1e6),
        }
    }
}

/// In-process gradient-boosted regression trees on a weighted squared-error objective.
#[derive(Debug, Clone, Copy)]
pub struct GradientBoostingLearner {
    max_bins: usize,
}

impl Default for GradientBoostingLearner {
    fn default() -> Self {
        Self { max_bins: MAX_BINS }
    }
}

impl GradientBoostingLearner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_bins(max_bins: usize) -> Self {
        Self {
            max_bins: max_bins.clamp(2, MAX_BINS),
        }
    }
}

impl Learner for GradientBoostingLearner {
    fn name(&self) -> &'static str {
        "native_gbdt"
    }

    fn default_params(&self) -> Params {
        params_from_pairs(&[
            ("n_estimators", 200.0),
            ("max_depth", 4.0),
            ("learning_rate", 0.05),
            ("subsample", 0.8),
            ("colsample_bytree", 0.8),
            ("min_child_weight", 3.0),
            ("gamma", 0.0),
            ("reg_alpha", 0.0),
            ("reg_lambda", 1.0),
        ])
    }

    fn search_space(&self) -> SearchSpace {
        space_from_pairs(&[
            ("n_estimators", &[100.0, 200.0, 300.0, 400.0, 500.0]),
            ("max_depth", &[3.0, 4.0, 5.0, 6.0, 7.0]),
            ("learning_rate", &[0.01, 0.05, 0.1, 0.15, 0.2]),
            ("subsample", &[0.6, 0.7, 0.8, 0.9, 1.0]),
            ("colsample_bytree", &[0.6, 0.7, 0.8, 0.9, 1.0]),
            ("min_child_weight", &[1.0, 2.0, 3.0, 4.0, 5.0]),
            ("gamma", &[0.0, 0.1, 0.2, 0.3, 0.4]),
            ("reg_alpha", &[0.0, 0.01, 0.1, 1.0]),
            ("reg_lambda", &[1.0, 10.0, 100.0]),
        ])
    }

    fn fit(
        &self,
        x: &[Vec<f64>],
        y: &[f64],
        weights: &[f64],
        params: &Params,
        seed: u64,
    ) -> Result<RegressorModel> {
        let n_features = validate_training_inputs(x, y, weights)?;
        let config = BoostingConfig::from_params(params);
        let binned = BinnedMatrix::build(x, n_features, self.max_bins);

        let weight_sum: f64 = weights.iter().sum();
        let base_score = if weight_sum > 0.0 {
            y.iter().zip(weights).map(|(t, w)| t * w).sum::<f64>() / weight_sum
        } else {
            y.iter().sum::<f64>() / y.len() as f64
        };

        let n_rows = x.len();
        let row_take = ((n_rows as f64 * config.subsample).round() as usize).clamp(1, n_rows);
        let col_take =
            ((n_features as f64 * config.colsample_bytree).round() as usize).clamp(1, n_features.max(1));

        let mut rng = StdRng::seed_from_u64(seed);
        let mut predictions = vec![base_score; n_rows];
        let mut trees = Vec::with_capacity(config.n_estimators);
        let mut grad = vec![0.0; n_rows];
        let mut hess = vec![0.0; n_rows];

        for _ in 0..config.n_estimators {
            for row in 0..n_rows {
                grad[row] = weights[row] * (predictions[row] - y[row]);
                hess[row] = weights[row];
            }

            let mut rows: Vec<usize> = if row_take < n_rows {
                sample(&mut rng, n_rows, row_take).into_vec()
            } else {
                (0..n_rows).collect()
            };
            rows.sort_unstable();
            let mut features: Vec<usize> = if col_take < n_features {
                sample(&mut rng, n_features, col_take).into_vec()
            } else {
                (0..n_features).collect()
            };
            features.sort_unstable();

            let tree = TreeBuilder::new(&binned, &grad, &hess, &features, &config).build(rows);
            for (row, prediction) in predictions.iter_mut().enumerate() {
                *prediction += tree.predict(&x[row]);
            }
            trees.push(tree);
        }

        debug!(
            "Fitted {} trees on {} rows x {} features (base score {:.4})",
            trees.len(),
            n_rows,
            n_features,
            base_score
        );

        Ok(RegressorModel::Trees(TreeEnsemble {
            base_score,
            n_features,
            trees,
        }))
    }
}

/// Column-major quantised copy of the training matrix.
struct BinnedMatrix {
    cuts: Vec<Vec<f64>>,
    bins: Vec<Vec<u8>>,
}

impl BinnedMatrix {
    fn build(x: &[Vec<f64>], n_features: usize, max_bins: usize) -> Self {
        let (cuts, bins): (Vec<Vec<f64>>, Vec<Vec<u8>>) = (0..n_features)
            .into_par_iter()
            .map(|feature| {
                let column: Vec<f64> = x.iter().map(|row| row[feature]).collect();
                let cuts = feature_cuts(&column, max_bins);
                let bins: Vec<u8> = column
                    .iter()
                    .map(|value| cuts.partition_point(|cut| cut < value) as u8)
                    .collect();
                (cuts, bins)
            })
            .unzip();
        Self { cuts, bins }
    }
}

/// Ascending split candidates; bin `i` holds values `<= cuts[i]`, the last bin everything above.
fn feature_cuts(column: &[f64], max_bins: usize) -> Vec<f64> {
    let mut distinct: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
    distinct.sort_by(|a, b| a.total_cmp(b));
    distinct.dedup();
    if distinct.len() < 2 {
        return Vec::new();
    }

    let mut cuts: Vec<f64> = if distinct.len() <= max_bins {
        distinct.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
    } else {
        (1..max_bins)
            .map(|k| {
                let idx = (k * distinct.len() / max_bins).clamp(1, distinct.len() - 1);
                (distinct[idx - 1] + distinct[idx]) / 2.0
            })
            .collect()
    };
    cuts.dedup();
    cuts
}

fn soft_threshold(g: f64, alpha: f64) -> f64 {
    if g > alpha {
        g - alpha
    } else if g < -alpha {
        g + alpha
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

struct TreeBuilder<'a> {
    binned: &'a BinnedMatrix,
    grad: &'a [f64],
    hess: &'a [f64],
    features: &'a [usize],
    config: &'a BoostingConfig,
    tree: RegressionTree,
}

impl<'a> TreeBuilder<'a> {
    fn new(
        binned: &'a BinnedMatrix,
        grad: &'a [f64],
        hess: &'a [f64],
        features: &'a [usize],
        config: &'a BoostingConfig,
    ) -> Self {
        Self {
            binned,
            grad,
            hess,
            features,
            config,
            tree: RegressionTree {
                split_feature: Vec::new(),
                split_gain: Vec::new(),
                threshold: Vec::new(),
                left_child: Vec::new(),
                right_child: Vec::new(),
                leaf_value: Vec::new(),
                leaf_count: Vec::new(),
                internal_count: Vec::new(),
            },
        }
    }

    fn build(mut self, rows: Vec<usize>) -> RegressionTree {
        self.grow(rows, 0);
        self.tree
    }

    fn objective(&self, g: f64, h: f64) -> f64 {
        let t = soft_threshold(g, self.config.reg_alpha);
        t * t / (h + self.config.reg_lambda).max(1e-12)
    }

    /// Returns the child reference for the subtree rooted at `rows`.
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> i32 {
        let g: f64 = rows.iter().map(|&r| self.grad[r]).sum();
        let h: f64 = rows.iter().map(|&r| self.hess[r]).sum();

        if depth < self.config.max_depth && rows.len() >= 2 {
            if let Some(split) = self.best_split(&rows, g, h) {
                let node = self.tree.split_feature.len();
                self.tree.split_feature.push(split.feature);
                self.tree.split_gain.push(split.gain);
                self.tree
                    .threshold
                    .push(self.binned.cuts[split.feature][split.bin]);
                self.tree.left_child.push(0);
                self.tree.right_child.push(0);
                self.tree.internal_count.push(rows.len());

                let column = &self.binned.bins[split.feature];
                let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                    .into_iter()
                    .partition(|&r| (column[r] as usize) <= split.bin);
                let left = self.grow(left_rows, depth + 1);
                let right = self.grow(right_rows, depth + 1);
                self.tree.left_child[node] = left;
                self.tree.right_child[node] = right;
                return node as i32;
            }
        }

        let leaf = self.tree.leaf_value.len();
        let value = -soft_threshold(g, self.config.reg_alpha)
            / (h + self.config.reg_lambda).max(1e-12)
            * self.config.learning_rate;
        self.tree.leaf_value.push(value);
        self.tree.leaf_count.push(rows.len());
        -(leaf as i32) - 1
    }

    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let parent = self.objective(g, h);
        let min_child = self.config.min_child_weight;
        let gamma = self.config.gamma;

        let candidates: Vec<Option<SplitCandidate>> = self
            .features
            .par_iter()
            .map(|&feature| {
                let cuts = &self.binned.cuts[feature];
                if cuts.is_empty() {
                    return None;
                }
                let column = &self.binned.bins[feature];
                let mut grad_hist = vec![0.0; cuts.len() + 1];
                let mut hess_hist = vec![0.0; cuts.len() + 1];
                for &r in rows {
                    let bin = column[r] as usize;
                    grad_hist[bin] += self.grad[r];
                    hess_hist[bin] += self.hess[r];
                }

                let mut best: Option<SplitCandidate> = None;
                let (mut gl, mut hl) = (0.0, 0.0);
                for bin in 0..cuts.len() {
                    gl += grad_hist[bin];
                    hl += hess_hist[bin];
                    let (gr, hr) = (g - gl, h - hl);
                    if hl < min_child || hr < min_child || hl <= 0.0 || hr <= 0.0 {
                        continue;
                    }
                    let gain =
                        0.5 * (self.objective(gl, hl) + self.objective(gr, hr) - parent) - gamma;
                    if gain > 1e-12 && best.map_or(true, |b| gain > b.gain) {
                        best = Some(SplitCandidate { feature, bin, gain });
                    }
                }
                best
            })
            .collect();

        candidates
            .into_iter()
            .flatten()
            .fold(None, |acc: Option<SplitCandidate>, candidate| match acc {
                Some(current) if current.gain >= candidate.gain => Some(current),
                _ => Some(candidate),
            })
    }
}
