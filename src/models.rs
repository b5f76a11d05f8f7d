use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Source platform a price was observed on. Each platform owns one specialist model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ebay,
    Abebooks,
    Amazon,
    Biblio,
    Alibris,
    Zvab,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Ebay,
        Platform::Abebooks,
        Platform::Amazon,
        Platform::Biblio,
        Platform::Alibris,
        Platform::Zvab,
    ];

    /// Platform whose sold prices are the ground truth for stacking and the unified model.
    pub const CANONICAL: Platform = Platform::Ebay;

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ebay => "ebay",
            Platform::Abebooks => "abebooks",
            Platform::Amazon => "amazon",
            Platform::Biblio => "biblio",
            Platform::Alibris => "alibris",
            Platform::Zvab => "zvab",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Platform::Ebay => 0,
            Platform::Abebooks => 1,
            Platform::Amazon => 2,
            Platform::Biblio => 3,
            Platform::Alibris => 4,
            Platform::Zvab => 5,
        }
    }

    /// BookFinder aggregates these vendors; their features come from the per-vendor minimum price.
    pub fn is_bookfinder_vendor(&self) -> bool {
        matches!(self, Platform::Biblio | Platform::Alibris | Platform::Zvab)
    }

    pub fn parse_list(raw: &str) -> AnyResult<Vec<Platform>> {
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(Platform::from_str)
            .collect()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ebay" => Ok(Platform::Ebay),
            "abebooks" => Ok(Platform::Abebooks),
            "amazon" => Ok(Platform::Amazon),
            "biblio" => Ok(Platform::Biblio),
            "alibris" => Ok(Platform::Alibris),
            "zvab" => Ok(Platform::Zvab),
            other => Err(anyhow!(
                "Unknown platform '{}' (expected one of ebay, abebooks, amazon, biblio, alibris, zvab)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    Sold,
    #[default]
    Listing,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::Sold => "sold",
            PriceType::Listing => "listing",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub page_count: Option<u32>,
    #[serde(default)]
    pub published_year: Option<i32>,
    #[serde(default)]
    pub ratings_count: Option<u64>,
    #[serde(default)]
    pub average_rating: Option<f64>,
    #[serde(default)]
    pub list_price: Option<f64>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub cover_type: Option<String>,
    #[serde(default)]
    pub signed: Option<bool>,
    #[serde(default)]
    pub printing: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    #[serde(default)]
    pub sold_count: Option<u32>,
    #[serde(default)]
    pub active_count: Option<u32>,
    #[serde(default)]
    pub active_median_price: Option<f64>,
    #[serde(default)]
    pub active_min_price: Option<f64>,
    #[serde(default)]
    pub active_max_price: Option<f64>,
    #[serde(default)]
    pub sold_avg_price: Option<f64>,
    #[serde(default)]
    pub sold_median_price: Option<f64>,
    #[serde(default)]
    pub sold_min_price: Option<f64>,
    #[serde(default)]
    pub sold_max_price: Option<f64>,
    #[serde(default)]
    pub sell_through_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmazonPricing {
    #[serde(default)]
    pub sales_rank: Option<u64>,
    #[serde(default)]
    pub offer_count: Option<u32>,
    #[serde(default)]
    pub lowest_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbebooksPricing {
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub avg_price: Option<f64>,
    #[serde(default)]
    pub seller_count: Option<u32>,
    #[serde(default)]
    pub condition_spread: Option<f64>,
    #[serde(default)]
    pub has_new: Option<bool>,
    #[serde(default)]
    pub has_used: Option<bool>,
    #[serde(default)]
    pub hardcover_premium: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookfinderPricing {
    #[serde(default)]
    pub lowest_price: Option<f64>,
    #[serde(default)]
    pub avg_price: Option<f64>,
    #[serde(default)]
    pub offer_count: Option<u32>,
    #[serde(default)]
    pub vendor_count: Option<u32>,
    /// Minimum price (including shipping) per vendor platform.
    #[serde(default)]
    pub vendor_min_prices: BTreeMap<Platform, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VendorSignals {
    #[serde(default)]
    pub amazon: Option<AmazonPricing>,
    #[serde(default)]
    pub abebooks: Option<AbebooksPricing>,
    #[serde(default)]
    pub bookfinder: Option<BookfinderPricing>,
}

/// Everything the estimator knows about one book at request time.
///
/// This is the single value object handed to extraction, routing and training; upstream
/// providers (metadata, market statistics, vendor pricing) fill in whatever they have.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSignal {
    #[serde(default)]
    pub metadata: Option<BookMetadata>,
    #[serde(default)]
    pub market: Option<MarketStats>,
    #[serde(default)]
    pub vendors: VendorSignals,
    #[serde(default)]
    pub condition: String,
}

impl BookSignal {
    pub fn abebooks_avg_price(&self) -> Option<f64> {
        self.vendors.abebooks.as_ref().and_then(|a| a.avg_price)
    }

    pub fn amazon_lowest_price(&self) -> Option<f64> {
        self.vendors.amazon.as_ref().and_then(|a| a.lowest_price)
    }

    pub fn bookfinder_vendor_price(&self, platform: Platform) -> Option<f64> {
        self.vendors
            .bookfinder
            .as_ref()
            .and_then(|b| b.vendor_min_prices.get(&platform).copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub price: f64,
    #[serde(default)]
    pub price_type: PriceType,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

/// One row of the persisted training data: a book and every platform price observed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub isbn: String,
    #[serde(default)]
    pub signal: BookSignal,
    #[serde(default)]
    pub targets: BTreeMap<Platform, PlatformTarget>,
}

impl TrainingRecord {
    pub fn sample_for(&self, platform: Platform) -> Option<TrainingSample> {
        let target = self.targets.get(&platform)?;
        if !target.price.is_finite() || target.price <= 0.0 {
            return None;
        }
        Some(TrainingSample {
            isbn: self.isbn.clone(),
            target_price: target.price,
            target_type: target.price_type,
            timestamp: target.observed_at,
            signal: self.signal.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub isbn: String,
    pub target_price: f64,
    pub target_type: PriceType,
    pub timestamp: Option<DateTime<Utc>>,
    pub signal: BookSignal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    pub mape: f64,
}
