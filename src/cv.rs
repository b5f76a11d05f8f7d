use crate::metrics::{mean, population_std};
use anyhow::{anyhow, Result};
use std::collections::HashMap;

pub fn log_target(prices: &[f64]) -> Vec<f64> {
    prices.iter().map(|p| p.max(0.0).ln_1p()).collect()
}

pub fn inverse_log_target(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| v.exp_m1()).collect()
}

/// Indices of rows whose target z-score is within `threshold`. A constant target keeps every row.
pub fn outlier_mask(targets: &[f64], threshold: f64) -> Vec<bool> {
    let target_mean = mean(targets);
    let std = population_std(targets);
    if !std.is_finite() || std <= f64::EPSILON || !threshold.is_finite() {
        return vec![true; targets.len()];
    }
    targets
        .iter()
        .map(|t| ((t - target_mean) / std).abs() <= threshold)
        .collect()
}

/// One train/test partition of row indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// K-fold split where every row sharing a group key lands in the same fold.
///
/// Groups are placed largest first onto the currently lightest fold, so fold sizes stay
/// balanced and the assignment depends only on the group sizes and keys.
#[derive(Debug, Clone, Copy)]
pub struct GroupKFold {
    n_splits: usize,
}

impl GroupKFold {
    pub fn new(n_splits: usize) -> Result<Self> {
        if n_splits < 2 {
            return Err(anyhow!(
                "Grouped cross-validation needs at least 2 splits (got {n_splits})"
            ));
        }
        Ok(Self { n_splits })
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    /// Fold index for every row.
    pub fn assign<S: AsRef<str>>(&self, groups: &[S]) -> Result<Vec<usize>> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for group in groups {
            *counts.entry(group.as_ref()).or_default() += 1;
        }
        if counts.len() < self.n_splits {
            return Err(anyhow!(
                "Cannot split {} distinct groups into {} folds",
                counts.len(),
                self.n_splits
            ));
        }

        let mut ordered: Vec<(&str, usize)> = counts.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut fold_sizes = vec![0usize; self.n_splits];
        let mut group_fold: HashMap<&str, usize> = HashMap::with_capacity(ordered.len());
        for (group, count) in ordered {
            let lightest = fold_sizes
                .iter()
                .enumerate()
                .min_by_key(|(idx, size)| (**size, *idx))
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            fold_sizes[lightest] += count;
            group_fold.insert(group, lightest);
        }

        Ok(groups
            .iter()
            .map(|group| group_fold.get(group.as_ref()).copied().unwrap_or(0))
            .collect())
    }

    pub fn split<S: AsRef<str>>(&self, groups: &[S]) -> Result<Vec<FoldSplit>> {
        let assignment = self.assign(groups)?;
        Ok((0..self.n_splits)
            .map(|fold| {
                let (test, train): (Vec<usize>, Vec<usize>) =
                    (0..assignment.len()).partition(|&row| assignment[row] == fold);
                FoldSplit { train, test }
            })
            .collect())
    }

    /// The last fold of the grouped split, used as the held-out test set.
    pub fn holdout<S: AsRef<str>>(&self, groups: &[S]) -> Result<FoldSplit> {
        self.split(groups)?
            .pop()
            .ok_or_else(|| anyhow!("Grouped split produced no folds"))
    }
}

pub fn distinct_groups<S: AsRef<str>>(groups: &[S]) -> usize {
    groups
        .iter()
        .map(|g| g.as_ref())
        .collect::<std::collections::HashSet<_>>()
        .len()
}

pub fn select<T: Clone>(items: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&idx| items[idx].clone()).collect()
}
