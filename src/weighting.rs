use crate::models::{PriceType, TrainingSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HALF_LIFE_DAYS: f64 = 365.0;
pub const DEFAULT_SOLD_MULTIPLIER: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightingConfig {
    pub half_life_days: f64,
    pub sold_multiplier: f64,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
            sold_multiplier: DEFAULT_SOLD_MULTIPLIER,
        }
    }
}

/// Exponential recency decay: a sample `half_life_days` older than the newest one weighs half.
pub fn temporal_weight(
    timestamp: Option<DateTime<Utc>>,
    most_recent: Option<DateTime<Utc>>,
    half_life_days: f64,
) -> f64 {
    let (Some(ts), Some(latest)) = (timestamp, most_recent) else {
        return 1.0;
    };
    if !half_life_days.is_finite() || half_life_days <= 0.0 {
        return 1.0;
    }
    let age_days = ((latest - ts).num_seconds() as f64 / 86_400.0).max(0.0);
    2f64.powf(-age_days / half_life_days)
}

/// Anything carrying the provenance needed for sample weights.
pub trait Observation {
    fn observed_at(&self) -> Option<DateTime<Utc>>;
    fn price_type(&self) -> PriceType;
}

impl Observation for TrainingSample {
    fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    fn price_type(&self) -> PriceType {
        self.target_type
    }
}

pub fn price_type_weight(price_type: PriceType, sold_multiplier: f64) -> f64 {
    match price_type {
        PriceType::Sold => sold_multiplier,
        PriceType::Listing => 1.0,
    }
}

/// Rescales in place so the mean weight is 1.0. Degenerate inputs become uniform.
pub fn normalize_mean_one(weights: &mut [f64]) {
    if weights.is_empty() {
        return;
    }
    let sum: f64 = weights.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        weights.iter_mut().for_each(|w| *w = 1.0);
        return;
    }
    let scale = weights.len() as f64 / sum;
    weights.iter_mut().for_each(|w| *w *= scale);
}

pub fn temporal_weights<T: Observation>(samples: &[T], half_life_days: f64) -> Vec<f64> {
    let most_recent = samples.iter().filter_map(|s| s.observed_at()).max();
    let mut weights: Vec<f64> = samples
        .iter()
        .map(|s| temporal_weight(s.observed_at(), most_recent, half_life_days))
        .collect();
    normalize_mean_one(&mut weights);
    weights
}

pub fn price_type_weights<T: Observation>(samples: &[T], sold_multiplier: f64) -> Vec<f64> {
    let mut weights: Vec<f64> = samples
        .iter()
        .map(|s| price_type_weight(s.price_type(), sold_multiplier))
        .collect();
    normalize_mean_one(&mut weights);
    weights
}

/// Product of the two normalized weight vectors; this is the regressor's sample weight.
pub fn combined_weights<T: Observation>(samples: &[T], config: &WeightingConfig) -> Vec<f64> {
    let temporal = temporal_weights(samples, config.half_life_days);
    let provenance = price_type_weights(samples, config.sold_multiplier);
    temporal
        .iter()
        .zip(provenance.iter())
        .map(|(t, p)| t * p)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookSignal;
    use chrono::{Duration, TimeZone};

    fn sample(days_ago: Option<i64>, price_type: PriceType) -> TrainingSample {
        let anchor = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("anchor");
        TrainingSample {
            isbn: "isbn".to_string(),
            target_price: 10.0,
            target_type: price_type,
            timestamp: days_ago.map(|days| anchor - Duration::days(days)),
            signal: BookSignal::default(),
        }
    }

    fn mean(values: &[f64]) -> f64 {
        values.iter().sum::<f64>() / values.len() as f64
    }

    #[test]
    fn half_life_halves_the_weight() {
        let latest = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single();
        let year_ago = latest.map(|ts| ts - Duration::days(365));
        let weight = temporal_weight(year_ago, latest, 365.0);
        assert!((weight - 0.5).abs() < 1e-12);
        assert_eq!(temporal_weight(None, latest, 365.0), 1.0);
    }

    #[test]
    fn temporal_weights_have_unit_mean_and_prefer_recent() {
        let samples = vec![
            sample(Some(0), PriceType::Listing),
            sample(Some(200), PriceType::Listing),
            sample(Some(700), PriceType::Listing),
            sample(None, PriceType::Listing),
        ];
        let weights = temporal_weights(&samples, 365.0);
        assert!((mean(&weights) - 1.0).abs() < 1e-9);
        assert!(weights[0] > weights[1]);
        assert!(weights[1] > weights[2]);
    }

    #[test]
    fn sold_rows_weigh_three_times_listing_rows() {
        let samples = vec![
            sample(None, PriceType::Sold),
            sample(None, PriceType::Listing),
            sample(None, PriceType::Listing),
        ];
        let weights = price_type_weights(&samples, 3.0);
        assert!((mean(&weights) - 1.0).abs() < 1e-9);
        assert!((weights[0] / weights[1] - 3.0).abs() < 1e-9);

        let combined = combined_weights(&samples, &WeightingConfig::default());
        assert_eq!(combined, weights);
    }

    #[test]
    fn degenerate_weights_become_uniform() {
        let mut weights = vec![0.0, 0.0];
        normalize_mean_one(&mut weights);
        assert_eq!(weights, vec![1.0, 1.0]);
    }
}
