use crate::models::RegressionMetrics;
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::cmp::Ordering;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().mean()
}

/// Population standard deviation (ddof = 0).
pub fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().population_std_dev()
}

pub fn median(values: &[f64]) -> f64 {
    let mut filtered: Vec<f64> = values
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .collect();
    if filtered.is_empty() {
        return 0.0;
    }
    filtered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = filtered.len() / 2;
    if filtered.len() % 2 == 0 {
        (filtered[mid - 1] + filtered[mid]) / 2.0
    } else {
        filtered[mid]
    }
}

/// Percentile `p` (0..=100) over the finite values; 0.0 when there are none.
pub fn percentile(values: &[f64], p: usize) -> f64 {
    let finite: Vec<f64> = values
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .collect();
    if finite.is_empty() {
        return 0.0;
    }
    let mut data = Data::new(finite);
    data.percentile(p.min(100))
}

pub fn mae(actual: &[f64], predicted: &[f64]) -> f64 {
    let errors: Vec<f64> = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .collect();
    mean(&errors)
}

pub fn rmse(actual: &[f64], predicted: &[f64]) -> f64 {
    let squared: Vec<f64> = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .collect();
    mean(&squared).sqrt()
}

/// Coefficient of determination. A constant target yields 0.0 rather than -inf.
pub fn r2(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let target_mean = mean(actual);
    let ss_tot: f64 = actual.iter().map(|a| (a - target_mean).powi(2)).sum();
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    if ss_tot <= f64::EPSILON {
        return 0.0;
    }
    1.0 - ss_res / ss_tot
}

/// Mean absolute percentage error in percent; rows with a zero target are skipped.
pub fn mape(actual: &[f64], predicted: &[f64]) -> f64 {
    let ratios: Vec<f64> = actual
        .iter()
        .zip(predicted)
        .filter(|(a, _)| a.abs() > f64::EPSILON)
        .map(|(a, p)| ((a - p) / a).abs())
        .collect();
    mean(&ratios) * 100.0
}

pub fn regression_metrics(actual: &[f64], predicted: &[f64]) -> RegressionMetrics {
    RegressionMetrics {
        mae: mae(actual, predicted),
        rmse: rmse(actual, predicted),
        r2: r2(actual, predicted),
        mape: mape(actual, predicted),
    }
}
