use crate::artifacts::{ModelStore, PriceModel};
use crate::bootstrap::BootstrapEnsemble;
use crate::features::{feature_names, owned_names, platform_feature_names, FeatureExtractor, FeatureVector};
use crate::meta::{MetaModel, META_MODEL_NAME};
use crate::models::{BookSignal, Platform};
use crate::monitor::{NoopPredictionLogger, PredictionLogger, PredictionRecord};
use crate::specialist::{specialist_name, UNIFIED_MODEL_NAME};
use anyhow::Result;
use chrono::Utc;
use dashmap::DashSet;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use uuid::Uuid;

pub const DEFAULT_MIN_PRICE: f64 = 0.01;
pub const DEFAULT_MIN_UNIFIED_COMPLETENESS: f64 = 0.3;
pub const TOP_FEATURES_REPORTED: usize = 5;

/// Every artifact the router can answer from. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    pub specialists: BTreeMap<Platform, PriceModel>,
    pub meta: Option<MetaModel>,
    pub unified: Option<PriceModel>,
    pub bootstrap: Option<BootstrapEnsemble>,
}

impl ModelSet {
    /// Loads whatever is deployed under `store`. Absent artifacts are skipped; an artifact
    /// whose features disagree with the live extractor fails the whole load.
    pub fn load(store: &ModelStore) -> Result<Self> {
        let mut specialists = BTreeMap::new();
        for platform in Platform::ALL {
            let expected = owned_names(&platform_feature_names(platform));
            if let Some(model) = store.load_model(&store.specialist_dir(platform), &expected)? {
                specialists.insert(platform, model);
            }
        }
        let unified_names = owned_names(&feature_names());
        let set = Self {
            specialists,
            meta: MetaModel::load(store)?,
            unified: store.load_model(&store.unified_dir(), &unified_names)?,
            bootstrap: BootstrapEnsemble::load(store, &unified_names)?,
        };
        info!(
            "Loaded {} specialist(s), meta={}, unified={}, bootstrap={} from {}",
            set.specialists.len(),
            set.meta.is_some(),
            set.unified.is_some(),
            set.bootstrap.is_some(),
            store.root().display()
        );
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.specialists.is_empty() && self.meta.is_none() && self.unified.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub priority: Vec<Platform>,
    pub min_price: f64,
    pub min_unified_completeness: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            priority: vec![Platform::Abebooks],
            min_price: DEFAULT_MIN_PRICE,
            min_unified_completeness: DEFAULT_MIN_UNIFIED_COMPLETENESS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "tier", content = "platform")]
pub enum RoutingTier {
    Specialist(Platform),
    Meta,
    Unified,
}

impl RoutingTier {
    pub fn confidence_tag(&self) -> ConfidenceTag {
        match self {
            RoutingTier::Specialist(_) => ConfidenceTag::High,
            RoutingTier::Meta => ConfidenceTag::Medium,
            RoutingTier::Unified => ConfidenceTag::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTag {
    High,
    Medium,
    Low,
    None,
}

/// How one request was answered; logged, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub chosen_model_id: Option<String>,
    pub fallback_chain_tried: Vec<String>,
    pub confidence_tag: ConfidenceTag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedPrediction {
    /// Key of the logged record; ground truth reported later refers to it.
    pub prediction_id: Uuid,
    pub price: f64,
    pub tier: RoutingTier,
    /// Inputs of the answering model; the unified vector for the meta tier.
    pub features: FeatureVector,
    pub historical_mae: f64,
    pub model_version: String,
    pub top_features: Vec<(String, f64)>,
    pub decision: RoutingDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Priced(RoutedPrediction),
    /// The unified model is loaded but the request carries too little information.
    InsufficientData {
        completeness: f64,
        decision: RoutingDecision,
    },
    /// Nothing could answer; distinct from a zero price.
    NotReady {
        reason: String,
        decision: RoutingDecision,
    },
}

#[derive(Debug, Default)]
struct RoutingCounters {
    total: AtomicU64,
    specialist: [AtomicU64; 6],
    meta: AtomicU64,
    unified: AtomicU64,
    insufficient_data: AtomicU64,
    not_ready: AtomicU64,
    specialist_failures: AtomicU64,
}

impl RoutingCounters {
    fn all(&self) -> impl Iterator<Item = &AtomicU64> {
        [
            &self.total,
            &self.meta,
            &self.unified,
            &self.insufficient_data,
            &self.not_ready,
            &self.specialist_failures,
        ]
        .into_iter()
        .chain(self.specialist.iter())
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Read-only copy of the routing counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStats {
    pub total: u64,
    pub specialist_routed: BTreeMap<Platform, u64>,
    pub meta_routed: u64,
    pub unified_fallback: u64,
    pub insufficient_data: u64,
    pub not_ready: u64,
    pub specialist_failures: u64,
    pub specialist_pct: BTreeMap<Platform, f64>,
    pub meta_pct: f64,
    pub unified_pct: f64,
}

fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn positive(value: Option<f64>) -> bool {
    value.is_some_and(|v| v.is_finite() && v > 0.0)
}

/// Whether the request carries the signal a platform's specialist was trained on.
pub fn is_eligible(platform: Platform, signal: &BookSignal) -> bool {
    match platform {
        Platform::Ebay => signal.market.as_ref().is_some_and(|market| {
            positive(market.active_median_price) || positive(market.sold_avg_price)
        }),
        Platform::Abebooks => positive(signal.abebooks_avg_price()),
        Platform::Amazon => positive(signal.amazon_lowest_price()),
        Platform::Biblio | Platform::Alibris | Platform::Zvab => {
            positive(signal.bookfinder_vendor_price(platform))
        }
    }
}

/// Chooses which model answers a request: a specialist in priority order, then the stacking
/// model, then the unified model. Never returns an error to its caller.
pub struct PredictionRouter {
    models: RwLock<Arc<ModelSet>>,
    config: RouterConfig,
    extractor: FeatureExtractor,
    counters: RoutingCounters,
    missing_logged: DashSet<Platform>,
    logger: Arc<dyn PredictionLogger>,
}

impl PredictionRouter {
    pub fn new(models: ModelSet, config: RouterConfig, extractor: FeatureExtractor) -> Self {
        Self {
            models: RwLock::new(Arc::new(models)),
            config,
            extractor,
            counters: RoutingCounters::default(),
            missing_logged: DashSet::new(),
            logger: Arc::new(NoopPredictionLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn PredictionLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Current model set. Callers keep the `Arc` for the duration of a request.
    pub fn models(&self) -> Arc<ModelSet> {
        match self.models.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replaces the model set in one step; in-flight requests finish on the old one.
    pub fn install(&self, models: ModelSet) {
        let models = Arc::new(models);
        match self.models.write() {
            Ok(mut guard) => *guard = models,
            Err(poisoned) => *poisoned.into_inner() = models,
        }
        self.missing_logged.clear();
    }

    /// Loads a fresh set from disk and installs it only once every artifact validated.
    pub fn reload(&self, store: &ModelStore) -> Result<()> {
        let models = ModelSet::load(store)?;
        self.install(models);
        Ok(())
    }

    pub fn predict(&self, signal: &BookSignal) -> RouteOutcome {
        let started = Instant::now();
        let models = self.models();
        bump(&self.counters.total);
        let mut tried = Vec::new();
        let mut attempted: BTreeMap<Platform, Option<f64>> = BTreeMap::new();

        for &platform in &self.config.priority {
            let Some(model) = models.specialists.get(&platform) else {
                self.log_missing_once(platform);
                continue;
            };
            let name = specialist_name(platform);
            tried.push(name.clone());
            if !is_eligible(platform, signal) {
                debug!("{} ineligible for this request", name);
                attempted.insert(platform, None);
                continue;
            }
            match self.specialist_predict(platform, model, signal) {
                Ok((price, features)) => {
                    bump(&self.counters.specialist[platform.index()]);
                    let routed = self.routed(
                        RoutingTier::Specialist(platform),
                        name,
                        model,
                        price,
                        features,
                        tried,
                    );
                    self.log_prediction(&routed, Some(platform), started);
                    return RouteOutcome::Priced(routed);
                }
                Err(err) => {
                    bump(&self.counters.specialist_failures);
                    warn!("{} failed, falling back: {err:#}", name);
                    attempted.insert(platform, None);
                }
            }
        }

        if let Some(meta) = &models.meta {
            tried.push(META_MODEL_NAME.to_string());
            if let Some(routed) = self.meta_predict(&models, meta, signal, &mut attempted, &tried) {
                bump(&self.counters.meta);
                self.log_prediction(&routed, None, started);
                return RouteOutcome::Priced(routed);
            }
        }

        let Some(unified) = &models.unified else {
            bump(&self.counters.not_ready);
            return RouteOutcome::NotReady {
                reason: "no unified model is loaded".to_string(),
                decision: Self::unanswered(tried),
            };
        };
        tried.push(UNIFIED_MODEL_NAME.to_string());
        let features = self.extractor.extract(signal);
        if features.completeness() < self.config.min_unified_completeness {
            bump(&self.counters.insufficient_data);
            return RouteOutcome::InsufficientData {
                completeness: features.completeness(),
                decision: Self::unanswered(tried),
            };
        }
        match unified.predict_price(features.values()) {
            Ok(price) => {
                bump(&self.counters.unified);
                let routed = self.routed(
                    RoutingTier::Unified,
                    UNIFIED_MODEL_NAME.to_string(),
                    unified,
                    price,
                    features,
                    tried,
                );
                self.log_prediction(&routed, None, started);
                RouteOutcome::Priced(routed)
            }
            Err(err) => {
                warn!("Unified model failed: {err:#}");
                bump(&self.counters.not_ready);
                RouteOutcome::NotReady {
                    reason: format!("unified model failed: {err}"),
                    decision: Self::unanswered(tried),
                }
            }
        }
    }

    fn specialist_predict(
        &self,
        platform: Platform,
        model: &PriceModel,
        signal: &BookSignal,
    ) -> Result<(f64, FeatureVector)> {
        let features = self.extractor.extract_for_platform(platform, signal);
        let price = model.predict_price(features.values())?;
        Ok((price, features))
    }

    /// Stacking answer from the eligible base specialists, or `None` when none of them could
    /// contribute.
    fn meta_predict(
        &self,
        models: &ModelSet,
        meta: &MetaModel,
        signal: &BookSignal,
        attempted: &mut BTreeMap<Platform, Option<f64>>,
        tried: &[String],
    ) -> Option<RoutedPrediction> {
        let mut inputs = BTreeMap::new();
        for &platform in &meta.base_platforms {
            let prediction = match attempted.get(&platform) {
                Some(known) => *known,
                None => {
                    let value = models.specialists.get(&platform).and_then(|model| {
                        if !is_eligible(platform, signal) {
                            return None;
                        }
                        match self.specialist_predict(platform, model, signal) {
                            Ok((price, _)) => Some(price),
                            Err(err) => {
                                bump(&self.counters.specialist_failures);
                                warn!("{} failed as meta input: {err:#}", specialist_name(platform));
                                None
                            }
                        }
                    });
                    attempted.insert(platform, value);
                    value
                }
            };
            inputs.insert(platform, prediction);
        }
        if inputs.values().all(Option::is_none) {
            debug!("No base specialist available for the meta model");
            return None;
        }
        match meta.predict_price(&inputs) {
            Ok(price) => Some(self.routed(
                RoutingTier::Meta,
                META_MODEL_NAME.to_string(),
                &meta.model,
                price,
                self.extractor.extract(signal),
                tried.to_vec(),
            )),
            Err(err) => {
                warn!("Meta model failed, falling back: {err:#}");
                None
            }
        }
    }

    fn routed(
        &self,
        tier: RoutingTier,
        model_id: String,
        model: &PriceModel,
        price: f64,
        features: FeatureVector,
        tried: Vec<String>,
    ) -> RoutedPrediction {
        let top_features = match tier {
            RoutingTier::Meta => model.metadata.top_features(TOP_FEATURES_REPORTED),
            _ => model
                .metadata
                .top_features(usize::MAX)
                .into_iter()
                .filter(|(name, _)| !features.is_missing(name))
                .take(TOP_FEATURES_REPORTED)
                .collect(),
        };
        RoutedPrediction {
            prediction_id: Uuid::new_v4(),
            price: price.max(self.config.min_price),
            tier,
            features,
            historical_mae: model.metadata.test_metrics.mae,
            model_version: model.metadata.version.clone(),
            top_features,
            decision: RoutingDecision {
                chosen_model_id: Some(model_id),
                fallback_chain_tried: tried,
                confidence_tag: tier.confidence_tag(),
            },
        }
    }

    fn unanswered(tried: Vec<String>) -> RoutingDecision {
        RoutingDecision {
            chosen_model_id: None,
            fallback_chain_tried: tried,
            confidence_tag: ConfidenceTag::None,
        }
    }

    fn log_missing_once(&self, platform: Platform) {
        if self.missing_logged.insert(platform) {
            info!(
                "{} specialist not loaded; skipping it in routing",
                platform
            );
        }
    }

    fn log_prediction(&self, routed: &RoutedPrediction, platform: Option<Platform>, started: Instant) {
        let record = PredictionRecord {
            id: routed.prediction_id,
            timestamp: Utc::now(),
            model_name: routed
                .decision
                .chosen_model_id
                .clone()
                .unwrap_or_default(),
            platform,
            prediction: Some(routed.price),
            true_value: None,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            features: routed
                .features
                .feature_dict()
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        };
        let logger = Arc::clone(&self.logger);
        if catch_unwind(AssertUnwindSafe(move || logger.log(record))).is_err() {
            warn!("Prediction logger panicked; record dropped");
        }
    }

    pub fn stats(&self) -> RoutingStats {
        let c = &self.counters;
        let total = c.total.load(Ordering::Relaxed);
        let specialist_routed: BTreeMap<Platform, u64> = Platform::ALL
            .into_iter()
            .map(|platform| (platform, c.specialist[platform.index()].load(Ordering::Relaxed)))
            .collect();
        let meta_routed = c.meta.load(Ordering::Relaxed);
        let unified_fallback = c.unified.load(Ordering::Relaxed);
        RoutingStats {
            total,
            specialist_pct: specialist_routed
                .iter()
                .map(|(platform, count)| (*platform, pct(*count, total)))
                .collect(),
            specialist_routed,
            meta_routed,
            unified_fallback,
            insufficient_data: c.insufficient_data.load(Ordering::Relaxed),
            not_ready: c.not_ready.load(Ordering::Relaxed),
            specialist_failures: c.specialist_failures.load(Ordering::Relaxed),
            meta_pct: pct(meta_routed, total),
            unified_pct: pct(unified_fallback, total),
        }
    }

    pub fn reset_stats(&self) {
        for counter in self.counters.all() {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
