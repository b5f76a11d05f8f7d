use anyhow::Result;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use price_engine::artifacts::{ModelStore, METADATA_FILE};
use price_engine::commands::{
    evaluate_bootstrap, evaluate_models, monitor_report, record_truth, save_baseline, train_all,
    train_specialists,
};
use price_engine::config::EngineSettings;
use price_engine::context::AppContext;
use price_engine::dataset::save_training_records;
use price_engine::error::EstimatorError;
use price_engine::models::{
    AbebooksPricing, AmazonPricing, BookMetadata, BookSignal, BookfinderPricing, MarketStats,
    Platform, PlatformTarget, PriceType, TrainingRecord,
};
use price_engine::monitor::PredictionRecord;
use price_engine::oof::load_oof;
use price_engine::router::{ModelSet, RoutingTier};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Once;

const CANONICAL_BOOKS: usize = 150;
const BIBLIO_ONLY_BOOKS: usize = 40;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn test_settings(model_dir: &Path, data_file: &Path, extra: &[(&str, &str)]) -> Result<EngineSettings> {
    let mut map: HashMap<String, String> = HashMap::from([
        ("MODEL_DIR".to_string(), model_dir.display().to_string()),
        ("TRAINING_DATA_FILE".to_string(), data_file.display().to_string()),
        ("MIN_TRAINING_SAMPLES".to_string(), "30".to_string()),
        ("CV_FOLDS".to_string(), "3".to_string()),
        ("SEARCH_ITERATIONS".to_string(), "0".to_string()),
        ("BOOTSTRAP_MODELS".to_string(), "3".to_string()),
        ("RANDOM_SEED".to_string(), "11".to_string()),
    ]);
    for (key, value) in extra {
        map.insert(key.to_string(), value.to_string());
    }
    EngineSettings::from_settings_map(&map)
}

fn book_signal(rng: &mut StdRng, value: f64) -> BookSignal {
    let page_count = 120 + (value * 18.0) as u32;
    let mut signal = BookSignal {
        metadata: Some(BookMetadata {
            title: Some(format!("Book {value:.2}")),
            page_count: Some(page_count),
            published_year: Some(rng.gen_range(1950..2022)),
            ratings_count: Some(rng.gen_range(10..5_000)),
            average_rating: Some(rng.gen_range(3.0..5.0)),
            list_price: Some(value * 1.4),
            categories: vec!["Fiction".to_string()],
            cover_type: Some(if rng.gen_bool(0.5) { "Hardcover" } else { "Paperback" }.to_string()),
            ..BookMetadata::default()
        }),
        market: Some(MarketStats {
            sold_count: Some(rng.gen_range(1..40)),
            active_count: Some(rng.gen_range(1..30)),
            active_median_price: Some(value * rng.gen_range(0.9..1.1)),
            sold_avg_price: Some(value * rng.gen_range(0.85..1.05)),
            ..MarketStats::default()
        }),
        condition: "Good".to_string(),
        ..BookSignal::default()
    };
    signal.vendors.abebooks = Some(AbebooksPricing {
        min_price: Some(value * 0.7),
        avg_price: Some(value * rng.gen_range(1.0..1.3)),
        seller_count: Some(rng.gen_range(1..20)),
        ..AbebooksPricing::default()
    });
    signal.vendors.amazon = Some(AmazonPricing {
        sales_rank: Some(rng.gen_range(1_000..2_000_000)),
        offer_count: Some(rng.gen_range(1..50)),
        lowest_price: Some(value * rng.gen_range(0.8..1.0)),
    });
    signal
}

fn target(price: f64, price_type: PriceType, days_ago: i64) -> PlatformTarget {
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single();
    PlatformTarget {
        price,
        price_type,
        observed_at: now.map(|t| t - ChronoDuration::days(days_ago)),
    }
}

/// Canonical books priced on eBay, AbeBooks and Amazon (only the first `amazon_rows` carry an
/// Amazon price), plus books seen only through Biblio.
fn synthetic_records(seed: u64, amazon_rows: usize) -> Vec<TrainingRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut records = Vec::new();
    for i in 0..CANONICAL_BOOKS {
        let value: f64 = rng.gen_range(4.0..60.0);
        let signal = book_signal(&mut rng, value);
        let mut targets = BTreeMap::new();
        let sold = if i % 3 == 0 { PriceType::Sold } else { PriceType::Listing };
        targets.insert(
            Platform::Ebay,
            target(value * rng.gen_range(0.95..1.05), sold, (i % 200) as i64),
        );
        targets.insert(
            Platform::Abebooks,
            target(value * rng.gen_range(1.1..1.3), PriceType::Listing, (i % 90) as i64),
        );
        if i < amazon_rows {
            targets.insert(
                Platform::Amazon,
                target(value * rng.gen_range(0.85..0.95), PriceType::Listing, (i % 30) as i64),
            );
        }
        records.push(TrainingRecord {
            isbn: format!("978000{:07}", i),
            signal,
            targets,
        });
    }
    for i in 0..BIBLIO_ONLY_BOOKS {
        let value: f64 = rng.gen_range(4.0..60.0);
        let mut signal = book_signal(&mut rng, value);
        signal.market = None;
        signal.vendors.bookfinder = Some(BookfinderPricing {
            lowest_price: Some(value * 0.9),
            vendor_min_prices: BTreeMap::from([(Platform::Biblio, value)]),
            ..BookfinderPricing::default()
        });
        records.push(TrainingRecord {
            isbn: format!("978100{:07}", i),
            signal,
            targets: BTreeMap::from([(
                Platform::Biblio,
                target(value * rng.gen_range(0.9..1.1), PriceType::Listing, 10),
            )]),
        });
    }
    records
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn train_all_then_estimate_end_to_end() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let data_file = dir.path().join("training.jsonl");
    let log_file = dir.path().join("logs").join("predictions.jsonl");
    let model_dir = dir.path().join("models");
    save_training_records(&data_file, &synthetic_records(5, CANONICAL_BOOKS))?;

    let log_path = log_file.display().to_string();
    let settings = test_settings(&model_dir, &data_file, &[("PREDICTION_LOG_FILE", log_path.as_str())])?;
    let app = AppContext::initialize(settings).await?;
    train_all::run(&app, false, None).await?;

    let store = ModelStore::new(&model_dir);
    let models = ModelSet::load(&store)?;
    for platform in [Platform::Ebay, Platform::Abebooks, Platform::Amazon, Platform::Biblio] {
        assert!(models.specialists.contains_key(&platform), "{platform} missing");
    }
    assert!(!models.specialists.contains_key(&Platform::Zvab));
    assert!(models.unified.is_some());
    assert_eq!(models.bootstrap.as_ref().map(|b| b.n_models()), Some(3));

    // Biblio never intersects the canonical rows: its column is empty and the stacking model
    // is built from the platforms that did produce signal.
    let (oof, oof_meta) = load_oof(&store)?.expect("oof saved");
    assert_eq!(oof.len(), CANONICAL_BOOKS);
    assert_eq!(oof.available_count(Platform::Biblio), 0);
    let biblio = &oof_meta.platforms[&Platform::Biblio];
    assert_eq!(biblio.n_samples, 0);
    assert!(biblio.reason.is_some());
    let meta = models.meta.as_ref().expect("meta trained");
    assert!(!meta.base_platforms.contains(&Platform::Biblio));
    assert!(meta.base_platforms.contains(&Platform::Ebay));

    let bootstrap_meta = models.bootstrap.as_ref().expect("bootstrap").metadata();
    assert_eq!(bootstrap_meta.n_models, Some(3));
    assert!(bootstrap_meta.test_samples > 0);
    assert!(bootstrap_meta.residual_std.is_some_and(|std| std > 0.0));
    let evaluation = evaluate_bootstrap::evaluate(&app, None).await?;
    assert_eq!(evaluation.n_samples, CANONICAL_BOOKS);
    assert_eq!(
        evaluation.calibration.calibrated,
        evaluation.calibration.ci_90_shortfall <= 0.10 && evaluation.calibration.ci_95_shortfall <= 0.10
    );
    let compared = evaluate_models::run(&app, None).await?;
    assert_eq!(compared.n_rows, CANONICAL_BOOKS);
    assert!(compared.n_scored > 0);
    let names: Vec<&str> = compared.comparison.iter().map(|(name, _)| name.as_str()).collect();
    for name in [evaluate_models::UNIFIED, evaluate_models::BOOTSTRAP, evaluate_models::ROUTED] {
        assert!(names.contains(&name), "{name} not compared");
    }
    assert_eq!(compared.best.model, compared.comparison[0].0);

    let estimator = app.estimator().await?;
    assert!(estimator.is_ready());
    let info = estimator.model_info();
    assert_eq!(info.status, "ready");
    for name in ["specialist_abebooks", "meta", "unified", "bootstrap"] {
        assert!(info.models.contains_key(name), "{name} not reported");
    }

    let mut rng = StdRng::seed_from_u64(99);
    let signal = book_signal(&mut rng, 25.0);
    let estimate = estimator.estimate(&signal);
    let price = estimate.price.expect("priced");
    assert_eq!(estimate.tier, Some(RoutingTier::Specialist(Platform::Abebooks)));
    assert!(estimate.confidence > 0.0 && estimate.confidence <= 1.0);
    let interval = estimate.interval.expect("interval");
    assert!(interval.lower >= 0.01);
    assert!(interval.lower <= price && price <= interval.upper);
    assert!(estimate.top_features.len() <= 5);

    // AbeBooks is the only prioritised specialist; with no AbeBooks average it is skipped.
    let mut no_abebooks = signal.clone();
    if let Some(abebooks) = no_abebooks.vendors.abebooks.as_mut() {
        abebooks.avg_price = Some(0.0);
    }
    let fallback = estimator.estimate(&no_abebooks);
    assert!(fallback.price.is_some());
    assert_eq!(fallback.tier, Some(RoutingTier::Meta));
    assert_eq!(
        fallback.routing.fallback_chain_tried.first().map(String::as_str),
        Some("specialist_abebooks")
    );

    let empty = estimator.estimate(&BookSignal::default());
    assert!(empty.price.is_none());
    assert!(empty.reason.starts_with("Insufficient data"));

    let stats = estimator.router().stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.insufficient_data, 1);
    assert_eq!(stats.meta_routed, 1);

    drop(estimator);
    app.shutdown();
    let logged: Vec<PredictionRecord> = std::fs::read_to_string(&log_file)?
        .lines()
        .map(serde_json::from_str)
        .collect::<std::result::Result<_, _>>()?;
    assert!(logged.len() >= 2);
    assert!(logged.iter().any(|r| r.model_name == "specialist_abebooks"));
    let served = logged
        .iter()
        .find(|r| r.model_name == "specialist_abebooks")
        .expect("abebooks record");
    assert_eq!(Some(served.id), estimate.prediction_id);

    // Report the sale price back, baseline the specialist, then check it against itself.
    let monitoring = AppContext::initialize(test_settings(
        &model_dir,
        &data_file,
        &[("PREDICTION_LOG_FILE", log_path.as_str())],
    )?)
    .await?;
    let served_price = served.prediction.expect("served price");
    record_truth::run(&monitoring, served.id, served_price + 2.0).await?;
    assert!(record_truth::run(&monitoring, served.id, f64::NAN).await.is_err());
    let baseline = save_baseline::run(&monitoring, "specialist_abebooks", 1).await?;
    assert_eq!(baseline.n_predictions, 1);
    assert!(baseline.mae.is_some_and(|mae| (mae - 2.0).abs() < 1e-6));
    let summary = monitor_report::run(&monitoring, Some("specialist_abebooks"), 24).await?;
    let window = summary.metrics.expect("window metrics");
    assert_eq!(window.n_predictions, 1);
    assert_eq!(window.n_with_ground_truth, 1);
    assert!(summary.new_alerts.is_empty());
    assert!(save_baseline::run(&monitoring, "bootstrap", 1).await.is_err());
    monitoring.shutdown();

    // A deployed artifact whose features disagree with the extractor refuses to load.
    let unified_metadata = model_dir.join("unified").join(METADATA_FILE);
    let mut raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&unified_metadata)?)?;
    raw["feature_names"][0] = serde_json::Value::String("renamed_feature".to_string());
    std::fs::write(&unified_metadata, serde_json::to_vec(&raw)?)?;
    let err = ModelSet::load(&store).expect_err("schema mismatch");
    assert!(EstimatorError::is_schema_mismatch(&err));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn under_minimum_platform_is_not_a_stacking_input() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let data_file = dir.path().join("training.jsonl");
    let model_dir = dir.path().join("models");
    // Ten Amazon rows against a minimum of thirty.
    save_training_records(&data_file, &synthetic_records(31, 10))?;

    let app = AppContext::initialize(test_settings(&model_dir, &data_file, &[])?).await?;
    train_all::run(&app, false, None).await?;

    let store = ModelStore::new(&model_dir);
    let models = ModelSet::load(&store)?;
    assert!(!models.specialists.contains_key(&Platform::Amazon));
    let (oof, oof_meta) = load_oof(&store)?.expect("oof saved");
    assert_eq!(oof.available_count(Platform::Amazon), 0);
    let amazon = &oof_meta.platforms[&Platform::Amazon];
    assert!(amazon.reason.as_deref().is_some_and(|r| r.contains("minimum")));

    let meta = models.meta.as_ref().expect("meta trained");
    assert!(!meta.base_platforms.contains(&Platform::Amazon));
    assert!(meta.base_platforms.contains(&Platform::Abebooks));
    app.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn insufficient_specialist_data_keeps_previous_artifact() -> Result<()> {
    ensure_test_env();
    let dir = tempfile::tempdir()?;
    let data_file = dir.path().join("training.jsonl");
    let model_dir = dir.path().join("models");
    save_training_records(&data_file, &synthetic_records(21, 90))?;

    let app = AppContext::initialize(test_settings(&model_dir, &data_file, &[])?).await?;
    let first = train_specialists::train(
        &app,
        std::sync::Arc::new(price_engine::dataset::load_training_records(&data_file)?),
        &[Platform::Amazon],
        false,
    )
    .await?;
    assert_eq!(first.trained, vec![Platform::Amazon]);

    let store = ModelStore::new(&model_dir);
    let amazon_dir = store.specialist_dir(Platform::Amazon);
    let deployed = store.read_metadata(&amazon_dir)?.expect("amazon deployed");

    // Ten Amazon rows is below the minimum: the platform is skipped and nothing is written.
    let second = train_specialists::train(
        &app,
        std::sync::Arc::new(synthetic_records(22, 10)),
        &[Platform::Amazon],
        false,
    )
    .await?;
    assert_eq!(second.skipped, vec![Platform::Amazon]);
    assert!(second.trained.is_empty() && second.failed.is_empty());

    let still_deployed = store.read_metadata(&amazon_dir)?.expect("amazon kept");
    assert_eq!(still_deployed.trained_at, deployed.trained_at);
    let leftovers: Vec<String> = std::fs::read_dir(amazon_dir.parent().expect("specialists dir"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("staging"))
        .collect();
    assert!(leftovers.is_empty(), "staging dirs left behind: {leftovers:?}");

    let models = ModelSet::load(&store)?;
    assert!(models.specialists.contains_key(&Platform::Amazon));
    app.shutdown();
    Ok(())
}
