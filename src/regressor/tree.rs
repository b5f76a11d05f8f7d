use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use std::str::FromStr;

/// Regression tree in LightGBM's array layout.
///
/// Internal node `i` sends `value <= threshold[i]` left. Child entries `>= 0` are internal
/// node indices, negative entries encode leaf `-(child + 1)`. A tree without internal nodes
/// is a single constant leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub split_feature: Vec<usize>,
    pub split_gain: Vec<f64>,
    pub threshold: Vec<f64>,
    pub left_child: Vec<i32>,
    pub right_child: Vec<i32>,
    pub leaf_value: Vec<f64>,
    #[serde(default)]
    pub leaf_count: Vec<usize>,
    #[serde(default)]
    pub internal_count: Vec<usize>,
}

impl RegressionTree {
    pub fn constant(value: f64, count: usize) -> Self {
        Self {
            split_feature: Vec::new(),
            split_gain: Vec::new(),
            threshold: Vec::new(),
            left_child: Vec::new(),
            right_child: Vec::new(),
            leaf_value: vec![value],
            leaf_count: vec![count],
            internal_count: Vec::new(),
        }
    }

    pub fn num_leaves(&self) -> usize {
        self.leaf_value.len()
    }

    fn from_lines(lines: &mut std::iter::Peekable<std::str::Lines<'_>>) -> Result<Self> {
        let mut num_leaves: Option<usize> = None;
        let mut split_feature = Vec::new();
        let mut split_gain = Vec::new();
        let mut threshold = Vec::new();
        let mut left_child = Vec::new();
        let mut right_child = Vec::new();
        let mut leaf_value = Vec::new();
        let mut leaf_count = Vec::new();
        let mut internal_count = Vec::new();

        while let Some(peeked) = lines.peek() {
            let line = peeked.trim();
            if line.starts_with("Tree=") || line == "end of trees" {
                break;
            }
            lines.next();

            if line.starts_with("num_leaves=") {
                num_leaves = Some(parse_value(line, "num_leaves=")?);
            } else if line.starts_with("split_feature=") {
                split_feature = parse_array(line, "split_feature=")?;
            } else if line.starts_with("split_gain=") {
                split_gain = parse_array(line, "split_gain=")?;
            } else if line.starts_with("threshold=") {
                threshold = parse_array(line, "threshold=")?;
            } else if line.starts_with("left_child=") {
                left_child = parse_array(line, "left_child=")?;
            } else if line.starts_with("right_child=") {
                right_child = parse_array(line, "right_child=")?;
            } else if line.starts_with("leaf_value=") {
                leaf_value = parse_array(line, "leaf_value=")?;
            } else if line.starts_with("leaf_count=") {
                leaf_count = parse_array(line, "leaf_count=")?;
            } else if line.starts_with("internal_count=") {
                internal_count = parse_array(line, "internal_count=")?;
            }
        }

        let internal_nodes = split_feature.len();
        if threshold.len() != internal_nodes
            || left_child.len() != internal_nodes
            || right_child.len() != internal_nodes
        {
            return Err(anyhow!(
                "LightGBM tree definition invalid: split/child/threshold length mismatch"
            ));
        }
        if split_gain.len() != internal_nodes {
            split_gain = vec![0.0; internal_nodes];
        }

        let declared_leaves = num_leaves.unwrap_or(leaf_value.len());
        if declared_leaves != leaf_value.len() || leaf_value.is_empty() {
            return Err(anyhow!(
                "LightGBM tree leaf count mismatch: expected {declared_leaves}, found {}",
                leaf_value.len()
            ));
        }
        if internal_nodes + 1 != leaf_value.len() {
            return Err(anyhow!(
                "LightGBM tree has {internal_nodes} internal nodes but {} leaves",
                leaf_value.len()
            ));
        }

        Ok(Self {
            split_feature,
            split_gain,
            threshold,
            left_child,
            right_child,
            leaf_value,
            leaf_count,
            internal_count,
        })
    }

    pub fn predict(&self, features: &[f64]) -> f64 {
        if self.split_feature.is_empty() {
            return self.leaf_value.first().copied().unwrap_or_default();
        }
        let mut node_idx = 0usize;
        // A well-formed tree terminates in at most `internal nodes` steps.
        for _ in 0..=self.split_feature.len() {
            let feature_idx = self.split_feature.get(node_idx).copied().unwrap_or_default();
            let threshold = self.threshold.get(node_idx).copied().unwrap_or(0.0);
            let feature_value = features.get(feature_idx).copied().unwrap_or(0.0);
            let child = if feature_value <= threshold {
                self.left_child.get(node_idx).copied().unwrap_or(-1)
            } else {
                self.right_child.get(node_idx).copied().unwrap_or(-1)
            };

            if child < 0 {
                let leaf_idx = (-child - 1) as usize;
                return self.leaf_value.get(leaf_idx).copied().unwrap_or_default();
            }
            node_idx = child as usize;
        }
        0.0
    }

    fn write_lightgbm(&self, out: &mut String, index: usize) -> std::fmt::Result {
        writeln!(out, "Tree={index}")?;
        writeln!(out, "num_leaves={}", self.num_leaves())?;
        writeln!(out, "num_cat=0")?;
        if !self.split_feature.is_empty() {
            writeln!(out, "split_feature={}", join(&self.split_feature))?;
            writeln!(out, "split_gain={}", join(&self.split_gain))?;
            writeln!(out, "threshold={}", join(&self.threshold))?;
            writeln!(
                out,
                "decision_type={}",
                join(&vec![2; self.split_feature.len()])
            )?;
            writeln!(out, "left_child={}", join(&self.left_child))?;
            writeln!(out, "right_child={}", join(&self.right_child))?;
        }
        writeln!(out, "leaf_value={}", join(&self.leaf_value))?;
        if self.leaf_count.len() == self.leaf_value.len() {
            writeln!(out, "leaf_count={}", join(&self.leaf_count))?;
        }
        if !self.split_feature.is_empty() && self.internal_count.len() == self.split_feature.len() {
            writeln!(out, "internal_count={}", join(&self.internal_count))?;
        }
        writeln!(out, "is_linear=0")?;
        writeln!(out, "shrinkage=1")?;
        writeln!(out)?;
        writeln!(out)
    }
}

/// Additive tree ensemble: `base_score + Σ tree(x)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub base_score: f64,
    pub n_features: usize,
    pub trees: Vec<RegressionTree>,
}

impl TreeEnsemble {
    pub fn predict_row(&self, features: &[f64]) -> f64 {
        self.base_score
            + self
                .trees
                .iter()
                .map(|tree| tree.predict(features))
                .sum::<f64>()
    }

    /// Total split gain per feature, normalised to sum to one.
    pub fn feature_importance(&self) -> Vec<f64> {
        let mut gains = vec![0.0; self.n_features];
        for tree in &self.trees {
            for (feature, gain) in tree.split_feature.iter().zip(&tree.split_gain) {
                if let Some(slot) = gains.get_mut(*feature) {
                    *slot += gain.max(0.0);
                }
            }
        }
        let total: f64 = gains.iter().sum();
        if total > 0.0 {
            gains.iter_mut().for_each(|g| *g /= total);
        }
        gains
    }

    /// Parses a LightGBM regression model. Leaf values in the file are already scaled by
    /// each tree's shrinkage, and LightGBM folds the initial score into the first tree.
    pub fn from_lightgbm_text(text: &str) -> Result<Self> {
        let mut lines = text.lines().peekable();
        let mut trees = Vec::new();
        let mut max_feature_idx: Option<usize> = None;
        let mut num_tree_per_iteration: usize = 1;

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with("objective=") {
                let objective = trimmed.trim_start_matches("objective=");
                let is_regression = ["regression", "huber", "fair"]
                    .iter()
                    .any(|prefix| objective.starts_with(prefix));
                if !is_regression {
                    return Err(anyhow!(
                        "LightGBM model objective '{objective}' is not a regression objective"
                    ));
                }
            } else if trimmed.starts_with("num_tree_per_iteration=") {
                num_tree_per_iteration = parse_value(trimmed, "num_tree_per_iteration=")?;
            } else if trimmed.starts_with("max_feature_idx=") {
                max_feature_idx = Some(parse_value(trimmed, "max_feature_idx=")?);
            } else if trimmed.starts_with("Tree=") {
                trees.push(RegressionTree::from_lines(&mut lines)?);
            } else if trimmed == "end of trees" {
                break;
            }
        }

        if trees.is_empty() {
            return Err(anyhow!("LightGBM model contained no trees"));
        }
        if num_tree_per_iteration != 1 {
            return Err(anyhow!(
                "LightGBM model has {num_tree_per_iteration} trees per iteration; expected a single-output regressor"
            ));
        }

        let inferred_max_feature = trees
            .iter()
            .flat_map(|tree| tree.split_feature.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let n_features = max_feature_idx
            .map(|idx| idx + 1)
            .unwrap_or(inferred_max_feature + 1);

        Ok(Self {
            base_score: 0.0,
            n_features,
            trees,
        })
    }

    /// Renders the ensemble in LightGBM's text model format, folding `base_score` into the
    /// first tree's leaves the way LightGBM stores its boost-from-average score.
    pub fn to_lightgbm_text(&self, feature_names: &[String]) -> Result<String> {
        if !feature_names.is_empty() && feature_names.len() != self.n_features {
            return Err(anyhow!(
                "Expected {} feature names, received {}",
                self.n_features,
                feature_names.len()
            ));
        }
        let mut trees = self.trees.clone();
        match trees.first_mut() {
            Some(first) => first.leaf_value.iter_mut().for_each(|v| *v += self.base_score),
            None => trees.push(RegressionTree::constant(self.base_score, 0)),
        }

        let names = if feature_names.is_empty() {
            (0..self.n_features)
                .map(|idx| format!("Column_{idx}"))
                .collect::<Vec<_>>()
        } else {
            feature_names.to_vec()
        };

        let mut out = String::new();
        let render = |out: &mut String| -> std::fmt::Result {
            writeln!(out, "tree")?;
            writeln!(out, "version=v3")?;
            writeln!(out, "num_class=1")?;
            writeln!(out, "num_tree_per_iteration=1")?;
            writeln!(out, "label_index=0")?;
            writeln!(out, "max_feature_idx={}", self.n_features.saturating_sub(1))?;
            writeln!(out, "objective=regression")?;
            writeln!(out, "feature_names={}", names.join(" "))?;
            writeln!(
                out,
                "feature_infos={}",
                vec!["none"; self.n_features].join(" ")
            )?;
            writeln!(out)?;
            for (index, tree) in trees.iter().enumerate() {
                tree.write_lightgbm(out, index)?;
            }
            writeln!(out, "end of trees")?;
            writeln!(out)?;
            writeln!(out, "feature_importances:")?;
            let mut ranked: Vec<(usize, f64)> =
                self.feature_importance().into_iter().enumerate().collect();
            ranked.retain(|(_, gain)| *gain > 0.0);
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (idx, gain) in ranked {
                writeln!(out, "{}={}", names[idx], gain)?;
            }
            Ok(())
        };
        render(&mut out).map_err(|err| anyhow!("Failed to render LightGBM model text: {err}"))?;
        Ok(out)
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_value<T>(line: &str, prefix: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Expected prefix {prefix}"))?;
    raw.trim().parse::<T>().map_err(|err| {
        anyhow!(
            "Failed to parse value for {prefix} from \"{line}\" while loading LightGBM model: {err}"
        )
    })
}

fn parse_array<T>(line: &str, prefix: &str) -> Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Expected prefix {prefix}"))?;
    raw.split_whitespace()
        .map(|token| {
            token
                .parse::<T>()
                .map_err(|err| anyhow!("Failed to parse value {token} for {prefix}: {err}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stump() -> RegressionTree {
        RegressionTree {
            split_feature: vec![1],
            split_gain: vec![4.0],
            threshold: vec![0.5],
            left_child: vec![-1],
            right_child: vec![-2],
            leaf_value: vec![-1.0, 2.0],
            leaf_count: vec![3, 5],
            internal_count: vec![8],
        }
    }

    #[test]
    fn predicts_through_lightgbm_layout() {
        let tree = stump();
        assert_eq!(tree.predict(&[0.0, 0.5]), -1.0);
        assert_eq!(tree.predict(&[0.0, 0.6]), 2.0);
        assert_eq!(RegressionTree::constant(3.0, 1).predict(&[]), 3.0);
    }

    #[test]
    fn parses_model_text_without_rescaling_leaves() {
        let text = "tree\nobjective=regression\nmax_feature_idx=1\n\nTree=0\nnum_leaves=2\nsplit_feature=1\nsplit_gain=4\nthreshold=0.5\nleft_child=-1\nright_child=-2\nleaf_value=1.5 2.5\nshrinkage=0.1\n\nend of trees\n";
        let model = TreeEnsemble::from_lightgbm_text(text).expect("parse");
        assert_eq!(model.n_features, 2);
        assert_eq!(model.predict_row(&[0.0, 0.0]), 1.5);
        assert_eq!(model.predict_row(&[0.0, 1.0]), 2.5);
    }

    #[test]
    fn rejects_classification_models() {
        let text = "objective=binary sigmoid:1\nTree=0\nnum_leaves=1\nleaf_value=0.1\n";
        assert!(TreeEnsemble::from_lightgbm_text(text).is_err());
    }

    #[test]
    fn importance_is_normalised_split_gain() {
        let mut second = stump();
        second.split_feature = vec![0];
        second.split_gain = vec![12.0];
        let model = TreeEnsemble {
            base_score: 0.0,
            n_features: 3,
            trees: vec![stump(), second],
        };
        assert_eq!(model.feature_importance(), vec![0.75, 0.25, 0.0]);
    }
}
