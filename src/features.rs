use crate::models::{BookMetadata, BookSignal, MarketStats, Platform};
use std::collections::{BTreeMap, BTreeSet};

/// Bumped whenever a feature list, its order or a default changes. Persisted next to every model.
pub const FEATURE_SCHEMA_VERSION: u32 = 3;

pub const DEFAULT_REFERENCE_YEAR: i32 = 2025;
const DEFAULT_SALES_RANK: f64 = 1_000_000.0;
const DEFAULT_PAGE_COUNT: f64 = 300.0;
const DEFAULT_AGE_YEARS: f64 = 5.0;

const TEXTBOOK_KEYWORDS: [&str; 10] = [
    "business",
    "finance",
    "medical",
    "nursing",
    "law",
    "science",
    "technology",
    "computer",
    "engineering",
    "mathematics",
];
const FICTION_KEYWORDS: [&str; 6] = ["fiction", "novel", "mystery", "thriller", "romance", "fantasy"];

/// Features whose absence costs extra confidence on top of plain completeness.
pub const CRITICAL_FEATURES: [&str; 3] = ["log_amazon_rank", "ebay_sold_count", "page_count"];

pub const UNIFIED_FEATURE_NAMES: [&str; 35] = [
    // Market signals
    "log_amazon_rank",
    "amazon_count",
    "ebay_sold_count",
    "ebay_active_count",
    "ebay_active_median",
    "sell_through_rate",
    // Book attributes
    "page_count",
    "age_years",
    "log_ratings",
    "rating",
    "has_list_price",
    "list_price",
    // Condition
    "is_new",
    "is_like_new",
    "is_very_good",
    "is_good",
    "is_acceptable",
    "is_poor",
    // Physical
    "is_hardcover",
    "is_paperback",
    "is_mass_market",
    "is_signed",
    "is_first_edition",
    // Category
    "is_textbook",
    "is_fiction",
    // Derived
    "demand_score",
    "competition_ratio",
    "price_velocity",
    // Vendor aggregates
    "ebay_sold_avg",
    "amazon_lowest_price",
    "abebooks_avg_price",
    "abebooks_min_price",
    "abebooks_seller_count",
    "bookfinder_lowest_price",
    "bookfinder_offer_count",
];

/// Book-level attributes appended to every platform list.
const BASE_FEATURE_NAMES: [&str; 19] = [
    "page_count",
    "age_years",
    "log_ratings",
    "rating",
    "has_list_price",
    "list_price",
    "is_new",
    "is_like_new",
    "is_very_good",
    "is_good",
    "is_acceptable",
    "is_poor",
    "is_hardcover",
    "is_paperback",
    "is_mass_market",
    "is_signed",
    "is_first_edition",
    "is_textbook",
    "is_fiction",
];

const EBAY_FEATURE_NAMES: [&str; 14] = [
    "log_amazon_rank",
    "ebay_sold_count",
    "ebay_active_count",
    "ebay_active_median",
    "ebay_active_min",
    "ebay_active_max",
    "ebay_sold_avg",
    "ebay_sold_median",
    "ebay_sold_min",
    "ebay_sold_max",
    "sell_through_rate",
    "demand_score",
    "competition_ratio",
    "price_velocity",
];

const ABEBOOKS_FEATURE_NAMES: [&str; 8] = [
    "abebooks_min_price",
    "abebooks_avg_price",
    "abebooks_seller_count",
    "abebooks_condition_spread",
    "abebooks_has_new",
    "abebooks_has_used",
    "abebooks_hardcover_premium",
    "log_amazon_rank",
];

const AMAZON_FEATURE_NAMES: [&str; 3] = ["log_amazon_rank", "amazon_count", "amazon_lowest_price"];

const VENDOR_FEATURE_NAMES: [&str; 7] = [
    "vendor_min_price",
    "vendor_premium",
    "bookfinder_lowest_price",
    "bookfinder_avg_price",
    "bookfinder_offer_count",
    "bookfinder_vendor_count",
    "log_amazon_rank",
];

/// Ordered feature list of the unified fallback model.
pub fn feature_names() -> Vec<&'static str> {
    UNIFIED_FEATURE_NAMES.to_vec()
}

/// Ordered feature list of one platform's specialist: platform signals first, then book attributes.
pub fn platform_feature_names(platform: Platform) -> Vec<&'static str> {
    let specific: &[&'static str] = match platform {
        Platform::Ebay => &EBAY_FEATURE_NAMES,
        Platform::Abebooks => &ABEBOOKS_FEATURE_NAMES,
        Platform::Amazon => &AMAZON_FEATURE_NAMES,
        Platform::Biblio | Platform::Alibris | Platform::Zvab => &VENDOR_FEATURE_NAMES,
    };
    specific
        .iter()
        .chain(BASE_FEATURE_NAMES.iter())
        .copied()
        .collect()
}

pub fn owned_names(names: &[&'static str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Immutable result of one extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    names: Vec<&'static str>,
    values: Vec<f64>,
    completeness: f64,
    missing_features: BTreeSet<&'static str>,
    feature_dict: BTreeMap<&'static str, f64>,
}

impl FeatureVector {
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn completeness(&self) -> f64 {
        self.completeness
    }

    pub fn missing_features(&self) -> &BTreeSet<&'static str> {
        &self.missing_features
    }

    pub fn is_missing(&self, name: &str) -> bool {
        self.missing_features.contains(name)
    }

    pub fn feature_dict(&self) -> &BTreeMap<&'static str, f64> {
        &self.feature_dict
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.feature_dict.get(name).copied()
    }

    pub fn missing_critical_count(&self) -> usize {
        CRITICAL_FEATURES
            .iter()
            .filter(|name| self.missing_features.contains(**name))
            .count()
    }
}

/// Full dictionary of every feature any list can ask for, with per-feature availability.
#[derive(Default)]
struct RawFeatures {
    values: BTreeMap<&'static str, f64>,
    missing: BTreeSet<&'static str>,
}

impl RawFeatures {
    fn set(&mut self, name: &'static str, value: f64, known: bool) {
        self.values.insert(name, value);
        if !known {
            self.missing.insert(name);
        }
    }

    fn set_option(&mut self, name: &'static str, value: Option<f64>) {
        match value {
            Some(v) if v.is_finite() => self.set(name, v, true),
            _ => self.set(name, 0.0, false),
        }
    }

    fn value(&self, name: &str) -> f64 {
        self.values.get(name).copied().unwrap_or(0.0)
    }

    fn known(&self, name: &str) -> bool {
        !self.missing.contains(name)
    }

    fn project(self, names: Vec<&'static str>) -> FeatureVector {
        let mut values = Vec::with_capacity(names.len());
        let mut missing_features = BTreeSet::new();
        let mut feature_dict = BTreeMap::new();
        for name in &names {
            let value = self.values.get(name).copied().unwrap_or(0.0);
            if self.missing.contains(name) || !self.values.contains_key(name) {
                missing_features.insert(*name);
            }
            values.push(value);
            feature_dict.insert(*name, value);
        }
        let completeness = if names.is_empty() {
            0.0
        } else {
            (1.0 - missing_features.len() as f64 / names.len() as f64).clamp(0.0, 1.0)
        };
        FeatureVector {
            names,
            values,
            completeness,
            missing_features,
            feature_dict,
        }
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Turns a `BookSignal` into model inputs. Extraction is total: absent inputs fall back to
/// documented defaults and are reported through `missing_features`.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    reference_year: i32,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            reference_year: DEFAULT_REFERENCE_YEAR,
        }
    }
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference_year(reference_year: i32) -> Self {
        Self { reference_year }
    }

    /// Unified feature vector.
    pub fn extract(&self, signal: &BookSignal) -> FeatureVector {
        self.raw_features(signal, None).project(feature_names())
    }

    /// Feature vector restricted to one platform's list; completeness is computed over that list.
    pub fn extract_for_platform(&self, platform: Platform, signal: &BookSignal) -> FeatureVector {
        let vendor = platform.is_bookfinder_vendor().then_some(platform);
        self.raw_features(signal, vendor)
            .project(platform_feature_names(platform))
    }

    fn raw_features(&self, signal: &BookSignal, vendor: Option<Platform>) -> RawFeatures {
        let mut raw = RawFeatures::default();
        self.market_features(&mut raw, signal);
        self.book_features(&mut raw, signal.metadata.as_ref());
        condition_features(&mut raw, &signal.condition);
        physical_features(&mut raw, signal.metadata.as_ref());
        category_features(&mut raw, signal.metadata.as_ref());
        derived_features(&mut raw, signal.market.as_ref());
        vendor_features(&mut raw, signal, vendor);
        raw
    }

    fn market_features(&self, raw: &mut RawFeatures, signal: &BookSignal) {
        let amazon = signal.vendors.amazon.as_ref();
        match amazon.and_then(|a| a.sales_rank).filter(|rank| *rank > 0) {
            Some(rank) => raw.set("log_amazon_rank", (rank as f64).ln_1p(), true),
            None => raw.set("log_amazon_rank", DEFAULT_SALES_RANK.ln_1p(), false),
        }
        raw.set_option(
            "amazon_count",
            amazon.and_then(|a| a.offer_count).map(f64::from),
        );
        raw.set_option(
            "amazon_lowest_price",
            positive(amazon.and_then(|a| a.lowest_price)),
        );

        let market = signal.market.as_ref();
        raw.set_option(
            "ebay_sold_count",
            market
                .and_then(|m| m.sold_count)
                .filter(|count| *count > 0)
                .map(f64::from),
        );
        raw.set_option(
            "ebay_active_count",
            market.and_then(|m| m.active_count).map(f64::from),
        );
        raw.set_option(
            "ebay_active_median",
            positive(market.and_then(|m| m.active_median_price)),
        );
        raw.set_option(
            "ebay_active_min",
            positive(market.and_then(|m| m.active_min_price)),
        );
        raw.set_option(
            "ebay_active_max",
            positive(market.and_then(|m| m.active_max_price)),
        );
        raw.set_option(
            "ebay_sold_avg",
            positive(market.and_then(|m| m.sold_avg_price)),
        );
        raw.set_option(
            "ebay_sold_median",
            positive(market.and_then(|m| m.sold_median_price)),
        );
        raw.set_option(
            "ebay_sold_min",
            positive(market.and_then(|m| m.sold_min_price)),
        );
        raw.set_option(
            "ebay_sold_max",
            positive(market.and_then(|m| m.sold_max_price)),
        );
        raw.set_option(
            "sell_through_rate",
            market.and_then(|m| m.sell_through_rate),
        );
    }

    fn book_features(&self, raw: &mut RawFeatures, metadata: Option<&BookMetadata>) {
        match metadata.and_then(|m| m.page_count).filter(|pages| *pages > 0) {
            Some(pages) => raw.set("page_count", f64::from(pages), true),
            None => raw.set("page_count", DEFAULT_PAGE_COUNT, false),
        }
        match metadata.and_then(|m| m.published_year) {
            Some(year) => raw.set(
                "age_years",
                f64::from(self.reference_year.saturating_sub(year).max(0)),
                true,
            ),
            None => raw.set("age_years", DEFAULT_AGE_YEARS, false),
        }
        raw.set_option(
            "log_ratings",
            metadata
                .and_then(|m| m.ratings_count)
                .filter(|count| *count > 0)
                .map(|count| (count as f64).ln_1p()),
        );
        raw.set_option("rating", positive(metadata.and_then(|m| m.average_rating)));

        let list_price = positive(metadata.and_then(|m| m.list_price));
        raw.set("has_list_price", flag(list_price.is_some()), list_price.is_some());
        raw.set_option("list_price", list_price);
    }
}

fn condition_features(raw: &mut RawFeatures, condition: &str) {
    let condition = condition.trim().to_ascii_lowercase();
    let known = !condition.is_empty();
    let is_like_new = condition.contains("like new");
    raw.set(
        "is_new",
        flag(condition.contains("new") && !condition.contains("like")),
        known,
    );
    raw.set("is_like_new", flag(is_like_new), known);
    raw.set("is_very_good", flag(condition.contains("very good")), known);
    raw.set("is_good", flag(condition == "good"), known);
    raw.set("is_acceptable", flag(condition.contains("acceptable")), known);
    raw.set("is_poor", flag(condition.contains("poor")), known);
}

fn physical_features(raw: &mut RawFeatures, metadata: Option<&BookMetadata>) {
    let cover = metadata
        .and_then(|m| m.cover_type.as_deref())
        .map(|cover| cover.trim().to_ascii_lowercase())
        .filter(|cover| !cover.is_empty());
    let cover_known = cover.is_some();
    let cover = cover.unwrap_or_default();
    raw.set("is_hardcover", flag(cover.contains("hardcover")), cover_known);
    raw.set("is_paperback", flag(cover.contains("paperback")), cover_known);
    raw.set(
        "is_mass_market",
        flag(cover.contains("mass market")),
        cover_known,
    );

    match metadata.and_then(|m| m.signed) {
        Some(signed) => raw.set("is_signed", flag(signed), true),
        None => raw.set("is_signed", 0.0, false),
    }

    let printing = metadata
        .and_then(|m| m.printing.as_deref())
        .map(|printing| printing.trim().to_ascii_lowercase())
        .filter(|printing| !printing.is_empty());
    match printing {
        Some(printing) => raw.set(
            "is_first_edition",
            flag(printing == "1st" || printing.starts_with("first")),
            true,
        ),
        None => raw.set("is_first_edition", 0.0, false),
    }
}

fn category_features(raw: &mut RawFeatures, metadata: Option<&BookMetadata>) {
    let categories: Vec<String> = metadata
        .map(|m| {
            m.categories
                .iter()
                .map(|category| category.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();
    let known = !categories.is_empty();
    let matches_any = |keywords: &[&str]| {
        categories
            .iter()
            .any(|category| keywords.iter().any(|keyword| category.contains(keyword)))
    };
    raw.set("is_textbook", flag(matches_any(&TEXTBOOK_KEYWORDS)), known);
    raw.set("is_fiction", flag(matches_any(&FICTION_KEYWORDS)), known);
}

fn derived_features(raw: &mut RawFeatures, market: Option<&MarketStats>) {
    let sold_known = raw.known("ebay_sold_count");
    let sold = raw.value("ebay_sold_count");
    let active = raw.value("ebay_active_count");
    let log_rank = raw.value("log_amazon_rank");

    if sold_known {
        raw.set("demand_score", sold / log_rank.max(1.0), true);
        raw.set("competition_ratio", active / sold, true);
    } else {
        raw.set("demand_score", 0.0, false);
        raw.set("competition_ratio", active, active > 0.0);
    }

    let active_median = positive(market.and_then(|m| m.active_median_price));
    let sold_avg = positive(market.and_then(|m| m.sold_avg_price));
    match (active_median, sold_avg) {
        (Some(median), Some(avg)) => raw.set("price_velocity", (median - avg) / avg.max(1.0), true),
        _ => raw.set("price_velocity", 0.0, false),
    }
}

fn vendor_features(raw: &mut RawFeatures, signal: &BookSignal, vendor: Option<Platform>) {
    let abebooks = signal.vendors.abebooks.as_ref();
    raw.set_option(
        "abebooks_min_price",
        positive(abebooks.and_then(|a| a.min_price)),
    );
    raw.set_option(
        "abebooks_avg_price",
        positive(abebooks.and_then(|a| a.avg_price)),
    );
    raw.set_option(
        "abebooks_seller_count",
        abebooks.and_then(|a| a.seller_count).map(f64::from),
    );
    raw.set_option(
        "abebooks_condition_spread",
        abebooks.and_then(|a| a.condition_spread),
    );
    raw.set_option(
        "abebooks_has_new",
        abebooks.and_then(|a| a.has_new).map(flag),
    );
    raw.set_option(
        "abebooks_has_used",
        abebooks.and_then(|a| a.has_used).map(flag),
    );
    raw.set_option(
        "abebooks_hardcover_premium",
        abebooks.and_then(|a| a.hardcover_premium),
    );

    let bookfinder = signal.vendors.bookfinder.as_ref();
    let lowest = positive(bookfinder.and_then(|b| b.lowest_price));
    raw.set_option("bookfinder_lowest_price", lowest);
    raw.set_option(
        "bookfinder_avg_price",
        positive(bookfinder.and_then(|b| b.avg_price)),
    );
    raw.set_option(
        "bookfinder_offer_count",
        bookfinder.and_then(|b| b.offer_count).map(f64::from),
    );
    raw.set_option(
        "bookfinder_vendor_count",
        bookfinder.and_then(|b| b.vendor_count).map(f64::from),
    );

    let vendor_min = vendor.and_then(|platform| positive(signal.bookfinder_vendor_price(platform)));
    raw.set_option("vendor_min_price", vendor_min);
    match (vendor_min, lowest) {
        (Some(min), Some(lowest)) => {
            raw.set("vendor_premium", (min - lowest) / lowest.max(1.0), true)
        }
        _ => raw.set("vendor_premium", 0.0, false),
    }
}
