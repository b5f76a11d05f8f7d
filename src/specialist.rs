use crate::artifacts::PriceModel;
use crate::features::{feature_names, owned_names, platform_feature_names, FeatureExtractor};
use crate::models::{Platform, TrainingRecord};
use crate::regressor::Learner;
use crate::training::{train_price_model, LabeledRow, ModelSpec, TrainingConfig};
use log::info;

pub const UNIFIED_MODEL_NAME: &str = "unified";

pub fn specialist_name(platform: Platform) -> String {
    format!("specialist_{}", platform.as_str())
}

pub fn specialist_spec(platform: Platform) -> ModelSpec {
    ModelSpec::new(
        specialist_name(platform),
        "specialist",
        owned_names(&platform_feature_names(platform)),
    )
}

pub fn unified_spec() -> ModelSpec {
    ModelSpec::new(UNIFIED_MODEL_NAME, "unified", owned_names(&feature_names()))
}

/// Rows where `platform` has an observed price, with that platform's feature list.
pub fn specialist_rows(
    records: &[TrainingRecord],
    platform: Platform,
    extractor: &FeatureExtractor,
) -> Vec<LabeledRow> {
    records
        .iter()
        .filter_map(|record| record.sample_for(platform))
        .map(|sample| LabeledRow {
            features: extractor
                .extract_for_platform(platform, &sample.signal)
                .values()
                .to_vec(),
            isbn: sample.isbn,
            price: sample.target_price,
            price_type: sample.target_type,
            timestamp: sample.timestamp,
        })
        .collect()
}

/// Rows with a canonical price, with the unified feature list.
pub fn unified_rows(records: &[TrainingRecord], extractor: &FeatureExtractor) -> Vec<LabeledRow> {
    records
        .iter()
        .filter_map(|record| record.sample_for(Platform::CANONICAL))
        .map(|sample| LabeledRow {
            features: extractor.extract(&sample.signal).values().to_vec(),
            isbn: sample.isbn,
            price: sample.target_price,
            price_type: sample.target_type,
            timestamp: sample.timestamp,
        })
        .collect()
}

pub fn train_specialist(
    platform: Platform,
    records: &[TrainingRecord],
    learner: &dyn Learner,
    config: &TrainingConfig,
    extractor: &FeatureExtractor,
) -> anyhow::Result<PriceModel> {
    let rows = specialist_rows(records, platform, extractor);
    info!(
        "Training {} specialist on {} observed row(s) with {}",
        platform,
        rows.len(),
        learner.name()
    );
    train_price_model(&specialist_spec(platform), rows, learner, config)
}

pub fn train_unified(
    records: &[TrainingRecord],
    learner: &dyn Learner,
    config: &TrainingConfig,
    extractor: &FeatureExtractor,
) -> anyhow::Result<PriceModel> {
    let rows = unified_rows(records, extractor);
    info!(
        "Training unified model on {} canonical row(s) with {}",
        rows.len(),
        learner.name()
    );
    train_price_model(&unified_spec(), rows, learner, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AmazonPricing, BookSignal, PlatformTarget, PriceType};
    use std::collections::BTreeMap;

    fn record(isbn: &str, amazon_price: Option<f64>) -> TrainingRecord {
        let mut signal = BookSignal::default();
        signal.vendors.amazon = Some(AmazonPricing {
            sales_rank: Some(50_000),
            offer_count: Some(4),
            lowest_price: Some(9.0),
        });
        let mut targets = BTreeMap::new();
        if let Some(price) = amazon_price {
            targets.insert(
                Platform::Amazon,
                PlatformTarget {
                    price,
                    price_type: PriceType::Listing,
                    observed_at: None,
                },
            );
        }
        TrainingRecord {
            isbn: isbn.to_string(),
            signal,
            targets,
        }
    }

    #[test]
    fn specialist_rows_only_use_observed_targets() {
        let records = vec![record("a", Some(12.0)), record("b", None), record("c", Some(0.0))];
        let rows = specialist_rows(&records, Platform::Amazon, &FeatureExtractor::new());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].isbn, "a");
        assert_eq!(
            rows[0].features.len(),
            platform_feature_names(Platform::Amazon).len()
        );
        assert!(unified_rows(&records, &FeatureExtractor::new()).is_empty());
    }

    #[test]
    fn model_names_follow_platform() {
        assert_eq!(specialist_name(Platform::Zvab), "specialist_zvab");
        assert_eq!(unified_spec().feature_names.len(), feature_names().len());
    }
}
