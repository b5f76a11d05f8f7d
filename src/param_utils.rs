use std::collections::BTreeMap;

/// Hyperparameters of one learner, keyed by name.
pub type Params = BTreeMap<String, f64>;

/// Candidate values per hyperparameter for randomized search.
pub type SearchSpace = BTreeMap<String, Vec<f64>>;

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &Params, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Extract a parameter as f64, clamped to a range with finite checks
pub fn get_param_f64_clamped(params: &Params, key: &str, default: f64, min: f64, max: f64) -> f64 {
    let raw = params.get(key).copied().unwrap_or(default);
    if !raw.is_finite() {
        return default;
    }
    raw.clamp(min, max)
}

/// Extract a parameter as usize, rounded and clamped to a range with finite checks
pub fn get_param_usize_rounded_clamped(
    params: &Params,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> usize {
    let raw = params.get(key).copied().unwrap_or(default as f64);
    if !raw.is_finite() {
        return default;
    }
    raw.round().clamp(min as f64, max as f64) as usize
}

pub fn params_from_pairs(pairs: &[(&str, f64)]) -> Params {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), *value))
        .collect()
}

pub fn space_from_pairs(pairs: &[(&str, &[f64])]) -> SearchSpace {
    pairs
        .iter()
        .map(|(key, values)| (key.to_string(), values.to_vec()))
        .collect()
}

/// Compact `key=value` rendering used in logs.
pub fn describe_params(params: &Params) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}
