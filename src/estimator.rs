use crate::artifacts::ModelMetadata;
use crate::bootstrap::BOOTSTRAP_MODEL_NAME;
use crate::meta::META_MODEL_NAME;
use crate::models::BookSignal;
use crate::router::{
    ModelSet, PredictionRouter, RouteOutcome, RoutedPrediction, RoutingDecision, RoutingTier,
};
use crate::specialist::{specialist_name, UNIFIED_MODEL_NAME};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Confidence lost per missing critical feature.
pub const CRITICAL_FEATURE_PENALTY: f64 = 0.2;
/// Half-width of the fallback interval at confidence 1.0.
pub const HEURISTIC_MARGIN: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceInterval {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureImportance {
    pub name: String,
    pub importance: f64,
}

/// The only thing inference callers ever see. `price == None` means "no confident estimate".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceEstimate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction_id: Option<Uuid>,
    pub price: Option<f64>,
    pub confidence: f64,
    pub interval: Option<PriceInterval>,
    pub reason: String,
    pub top_features: Vec<FeatureImportance>,
    pub model_version: Option<String>,
    pub tier: Option<RoutingTier>,
    pub routing: RoutingDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub version: String,
    pub model_type: String,
    pub learner: String,
    pub train_date: DateTime<Utc>,
    pub train_samples: usize,
    pub test_mae: f64,
    pub test_rmse: f64,
    pub feature_count: usize,
}

impl From<&ModelMetadata> for ModelSummary {
    fn from(metadata: &ModelMetadata) -> Self {
        Self {
            version: metadata.version.clone(),
            model_type: metadata.model_type.clone(),
            learner: metadata.learner.clone(),
            train_date: metadata.trained_at,
            train_samples: metadata.training_samples,
            test_mae: metadata.test_metrics.mae,
            test_rmse: metadata.test_metrics.rmse,
            feature_count: metadata.feature_names.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub status: &'static str,
    pub models: BTreeMap<String, ModelSummary>,
}

impl ModelInfo {
    pub fn from_models(models: &ModelSet) -> Self {
        let mut summaries = BTreeMap::new();
        for (platform, model) in &models.specialists {
            summaries.insert(
                specialist_name(*platform),
                ModelSummary::from(&model.metadata),
            );
        }
        if let Some(meta) = &models.meta {
            summaries.insert(
                META_MODEL_NAME.to_string(),
                ModelSummary::from(&meta.model.metadata),
            );
        }
        if let Some(unified) = &models.unified {
            summaries.insert(
                UNIFIED_MODEL_NAME.to_string(),
                ModelSummary::from(&unified.metadata),
            );
        }
        if let Some(bootstrap) = &models.bootstrap {
            summaries.insert(
                BOOTSTRAP_MODEL_NAME.to_string(),
                ModelSummary::from(bootstrap.metadata()),
            );
        }
        let status = if models.unified.is_some() {
            "ready"
        } else if models.is_empty() {
            "not_trained"
        } else {
            "partial"
        };
        Self {
            status,
            models: summaries,
        }
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn tier_factor(tier: RoutingTier) -> f64 {
    match tier {
        RoutingTier::Specialist(_) => 1.0,
        RoutingTier::Meta => 0.9,
        RoutingTier::Unified => 0.75,
    }
}

/// Completeness, discounted per missing critical feature and by the answering tier.
pub fn confidence_score(completeness: f64, missing_critical: usize, tier: RoutingTier) -> f64 {
    let penalty = (1.0 - CRITICAL_FEATURE_PENALTY * missing_critical as f64).max(0.0);
    (completeness * penalty * tier_factor(tier)).clamp(0.0, 1.0)
}

/// Extraction, routing, confidence and intervals behind one call that never fails.
pub struct MlPriceEstimator {
    router: Arc<PredictionRouter>,
}

impl MlPriceEstimator {
    pub fn new(router: Arc<PredictionRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<PredictionRouter> {
        &self.router
    }

    pub fn is_ready(&self) -> bool {
        self.router.models().unified.is_some()
    }

    pub fn estimate(&self, signal: &BookSignal) -> PriceEstimate {
        match self.router.predict(signal) {
            RouteOutcome::Priced(routed) => self.priced(signal, routed),
            RouteOutcome::InsufficientData {
                completeness,
                decision,
            } => PriceEstimate {
                prediction_id: None,
                price: None,
                confidence: 0.0,
                interval: None,
                reason: format!(
                    "Insufficient data: {:.0}% of features known, {:.0}% required",
                    completeness * 100.0,
                    self.router.config().min_unified_completeness * 100.0
                ),
                top_features: Vec::new(),
                model_version: None,
                tier: None,
                routing: decision,
            },
            RouteOutcome::NotReady { reason, decision } => PriceEstimate {
                prediction_id: None,
                price: None,
                confidence: 0.0,
                interval: None,
                reason: format!("Model not ready: {reason}"),
                top_features: Vec::new(),
                model_version: None,
                tier: None,
                routing: decision,
            },
        }
    }

    pub fn estimate_batch(&self, signals: &[BookSignal]) -> Vec<PriceEstimate> {
        signals.iter().map(|signal| self.estimate(signal)).collect()
    }

    fn priced(&self, signal: &BookSignal, routed: RoutedPrediction) -> PriceEstimate {
        let extractor = self.router.extractor();
        let unified = extractor.extract(signal);
        let confidence = confidence_score(
            routed.features.completeness(),
            unified.missing_critical_count(),
            routed.tier,
        );
        let min_price = self.router.config().min_price;
        let price = routed.price;

        let bootstrap_half_width = self.router.models().bootstrap.as_ref().and_then(|ensemble| {
            match ensemble.predict(unified.values()) {
                Ok(prediction) => Some(prediction.ci_90_half_width()),
                Err(err) => {
                    debug!("Bootstrap interval unavailable: {err:#}");
                    None
                }
            }
        });
        let half_width = bootstrap_half_width
            .filter(|width| width.is_finite())
            .unwrap_or_else(|| HEURISTIC_MARGIN / confidence.max(0.1));

        PriceEstimate {
            prediction_id: Some(routed.prediction_id),
            price: Some(round_cents(price)),
            confidence,
            interval: Some(PriceInterval {
                lower: round_cents((price - half_width).max(min_price)),
                upper: round_cents(price + half_width),
            }),
            reason: format!(
                "ML prediction from {} based on {:.0}% of features",
                routed
                    .decision
                    .chosen_model_id
                    .as_deref()
                    .unwrap_or("model"),
                routed.features.completeness() * 100.0
            ),
            top_features: routed
                .top_features
                .into_iter()
                .map(|(name, importance)| FeatureImportance { name, importance })
                .collect(),
            model_version: Some(routed.model_version),
            tier: Some(routed.tier),
            routing: routed.decision,
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo::from_models(&self.router.models())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    #[test]
    fn confidence_prefers_specialists_and_penalises_missing_criticals() {
        let specialist = confidence_score(0.8, 0, RoutingTier::Specialist(Platform::Ebay));
        let meta = confidence_score(0.8, 0, RoutingTier::Meta);
        let unified = confidence_score(0.8, 0, RoutingTier::Unified);
        assert!(specialist > meta && meta > unified);
        assert!((confidence_score(1.0, 2, RoutingTier::Specialist(Platform::Ebay)) - 0.6).abs() < 1e-12);
        assert_eq!(confidence_score(1.0, 9, RoutingTier::Unified), 0.0);
    }

    #[test]
    fn empty_router_yields_no_price_and_not_trained() {
        let router = PredictionRouter::new(
            ModelSet::default(),
            Default::default(),
            Default::default(),
        );
        let estimator = MlPriceEstimator::new(Arc::new(router));
        let estimate = estimator.estimate(&BookSignal::default());
        assert!(estimate.price.is_none());
        assert!(estimate.reason.starts_with("Model not ready"));
        assert_eq!(estimator.model_info().status, "not_trained");
    }
}
