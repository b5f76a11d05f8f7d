use crate::cv::{select, GroupKFold};
use crate::metrics::mae;
use crate::param_utils::{describe_params, Params, SearchSpace};
use crate::progress::training_progress;
use crate::regressor::Learner;
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    pub n_iter: usize,
    pub cv_folds: usize,
    pub seed: u64,
    pub show_progress: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            n_iter: 50,
            cv_folds: 3,
            seed: 42,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best_params: Params,
    /// Negative mean absolute error of the best candidate, averaged over folds.
    pub best_score: f64,
    pub evaluated: usize,
}

impl SearchOutcome {
    pub fn cv_mae(&self) -> f64 {
        -self.best_score
    }
}

fn grid_size(space: &SearchSpace) -> usize {
    space
        .values()
        .map(|values| values.len().max(1))
        .fold(1usize, |acc, len| acc.saturating_mul(len))
}

fn full_grid(space: &SearchSpace) -> Vec<Params> {
    let mut grid = vec![Params::new()];
    for (key, values) in space {
        grid = grid
            .into_iter()
            .flat_map(|partial| {
                values.iter().map(move |value| {
                    let mut params = partial.clone();
                    params.insert(key.clone(), *value);
                    params
                })
            })
            .collect();
    }
    grid
}

fn candidate_key(params: &Params) -> Vec<u64> {
    params.values().map(|value| value.to_bits()).collect()
}

/// Distinct parameter combinations: the whole grid when it is small enough, otherwise
/// `n_iter` seeded draws without repetition.
pub fn sample_candidates(space: &SearchSpace, n_iter: usize, seed: u64) -> Vec<Params> {
    let n_iter = n_iter.max(1);
    if grid_size(space) <= n_iter {
        return full_grid(space);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut seen = HashSet::new();
    let mut candidates = Vec::with_capacity(n_iter);
    let mut attempts = 0usize;
    while candidates.len() < n_iter && attempts < n_iter.saturating_mul(50) {
        attempts += 1;
        let params: Params = space
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(key, values)| (key.clone(), values[rng.gen_range(0..values.len())]))
            .collect();
        if seen.insert(candidate_key(&params)) {
            candidates.push(params);
        }
    }
    candidates
}

/// Grouped-CV score (negative MAE on the given target scale) of one parameter set.
pub fn cross_val_score(
    learner: &dyn Learner,
    x: &[Vec<f64>],
    y: &[f64],
    weights: &[f64],
    groups: &[String],
    params: &Params,
    cv_folds: usize,
    seed: u64,
) -> Result<f64> {
    let splits = GroupKFold::new(cv_folds)?.split(groups)?;
    let mut fold_errors = Vec::with_capacity(splits.len());
    for split in &splits {
        let model = learner.fit(
            &select(x, &split.train),
            &select(y, &split.train),
            &select(weights, &split.train),
            params,
            seed,
        )?;
        let predictions = model.predict(&select(x, &split.test))?;
        fold_errors.push(mae(&select(y, &split.test), &predictions));
    }
    Ok(-(fold_errors.iter().sum::<f64>() / fold_errors.len() as f64))
}

/// Randomized hyperparameter search maximising negative MAE under grouped cross-validation.
pub fn randomized_search(
    label: &str,
    learner: &dyn Learner,
    x: &[Vec<f64>],
    y: &[f64],
    weights: &[f64],
    groups: &[String],
    config: &SearchConfig,
) -> Result<SearchOutcome> {
    let space = learner.search_space();
    let candidates = sample_candidates(&space, config.n_iter, config.seed);
    info!(
        "{}: searching {} candidate(s) with {}-fold grouped CV",
        label,
        candidates.len(),
        config.cv_folds
    );

    let pb = training_progress(candidates.len(), config.show_progress);
    pb.set_message(label.to_string());
    let scores: Vec<Option<f64>> = candidates
        .par_iter()
        .map(|params| {
            let score =
                cross_val_score(learner, x, y, weights, groups, params, config.cv_folds, config.seed);
            pb.inc(1);
            match score {
                Ok(value) if value.is_finite() => Some(value),
                Ok(_) => None,
                Err(err) => {
                    debug!("{}: candidate {} failed: {err}", label, describe_params(params));
                    None
                }
            }
        })
        .collect();
    pb.finish_and_clear();

    let failed = scores.iter().filter(|score| score.is_none()).count();
    if failed > 0 {
        warn!("{}: {} of {} candidate(s) failed", label, failed, candidates.len());
    }

    let (best_idx, best_score) = scores
        .iter()
        .enumerate()
        .filter_map(|(idx, score)| score.map(|value| (idx, value)))
        .fold(None, |acc: Option<(usize, f64)>, (idx, value)| match acc {
            Some((_, best)) if best >= value => acc,
            _ => Some((idx, value)),
        })
        .ok_or_else(|| anyhow!("{label}: every hyperparameter candidate failed"))?;

    let best_params = candidates[best_idx].clone();
    info!(
        "{}: best CV MAE {:.4} with {}",
        label,
        -best_score,
        describe_params(&best_params)
    );
    Ok(SearchOutcome {
        best_params,
        best_score,
        evaluated: candidates.len() - failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param_utils::space_from_pairs;
    use crate::regressor::RidgeLearner;

    #[test]
    fn small_grids_are_enumerated() {
        let space = space_from_pairs(&[("a", &[1.0, 2.0]), ("b", &[3.0, 4.0, 5.0])]);
        let candidates = sample_candidates(&space, 50, 1);
        assert_eq!(candidates.len(), 6);
    }

    #[test]
    fn sampling_is_seeded_and_distinct() {
        let values: Vec<f64> = (0..10).map(f64::from).collect();
        let space = space_from_pairs(&[("a", &values), ("b", &values)]);
        let first = sample_candidates(&space, 20, 7);
        let second = sample_candidates(&space, 20, 7);
        assert_eq!(first, second);
        assert_eq!(first.len(), 20);
        let keys: HashSet<_> = first.iter().map(candidate_key).collect();
        assert_eq!(keys.len(), 20);
    }

    #[test]
    fn ridge_search_prefers_small_alpha_on_clean_linear_data() {
        let x: Vec<Vec<f64>> = (0..60).map(|i| vec![i as f64 / 10.0]).collect();
        let y: Vec<f64> = x.iter().map(|row| 1.0 + 4.0 * row[0]).collect();
        let weights = vec![1.0; x.len()];
        let groups: Vec<String> = (0..60).map(|i| format!("isbn-{}", i / 2)).collect();
        let outcome = randomized_search(
            "ridge",
            &RidgeLearner::new(),
            &x,
            &y,
            &weights,
            &groups,
            &SearchConfig::default(),
        )
        .expect("search");
        assert_eq!(outcome.evaluated, 7);
        assert!(outcome.best_params["alpha"] <= 0.1);
        assert!(outcome.cv_mae() < 0.05);
    }
}
