use anyhow::Result;
use price_engine::commands::export_lightgbm;
use price_engine::config::EngineSettings;
use price_engine::context::AppContext;
use price_engine::models::PriceType;
use price_engine::param_utils::params_from_pairs;
use price_engine::regressor::{GradientBoostingLearner, Learner, RegressorModel, TreeEnsemble};
use price_engine::training::{train_price_model, LabeledRow, ModelSpec, TrainingConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

fn two_tree_regression_text() -> &'static str {
    "tree\nversion=v3\nnum_class=1\nnum_tree_per_iteration=1\nmax_feature_idx=1\nobjective=regression\n\nTree=0\nnum_leaves=2\nsplit_feature=0\nthreshold=0.5\nleft_child=-1\nright_child=-2\nleaf_value=1.5 2.5\nshrinkage=1\n\nTree=1\nnum_leaves=3\nsplit_feature=1 0\nthreshold=10 2\nleft_child=1 -1\nright_child=-3 -2\nleaf_value=-0.25 0.25 0.75\nshrinkage=0.1\n\nend of trees\n"
}

fn synthetic_xy(n: usize, seed: u64) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    for _ in 0..n {
        let a: f64 = rng.gen_range(0.0..5.0);
        let b: f64 = rng.gen_range(-1.0..1.0);
        let c: f64 = rng.gen_range(0.0..1.0);
        y.push(1.0 + 0.6 * a - 0.4 * b + if c > 0.5 { 0.3 } else { 0.0 });
        x.push(vec![a, b, c]);
    }
    (x, y)
}

fn quick_params() -> price_engine::param_utils::Params {
    params_from_pairs(&[
        ("n_estimators", 25.0),
        ("max_depth", 3.0),
        ("learning_rate", 0.2),
        ("subsample", 1.0),
        ("colsample_bytree", 1.0),
        ("min_child_weight", 1.0),
    ])
}

#[test]
fn parses_lightgbm_regression_text() {
    let ensemble = TreeEnsemble::from_lightgbm_text(two_tree_regression_text()).expect("parse");
    assert_eq!(ensemble.n_features, 2);
    assert_eq!(ensemble.trees.len(), 2);
    // x0 <= 0.5 and x1 <= 10 with x0 <= 2: 1.5 - 0.25
    assert!((ensemble.predict_row(&[0.2, 3.0]) - 1.25).abs() < 1e-12);
    // x0 > 0.5, x1 > 10: 2.5 + 0.75
    assert!((ensemble.predict_row(&[4.0, 20.0]) - 3.25).abs() < 1e-12);
}

#[test]
fn trained_trees_survive_text_round_trip() {
    let (x, y) = synthetic_xy(200, 3);
    let weights = vec![1.0; y.len()];
    let learner = GradientBoostingLearner::new();
    let RegressorModel::Trees(trained) = learner
        .fit(&x, &y, &weights, &quick_params(), 7)
        .expect("fit")
    else {
        panic!("boosting learner must produce trees");
    };
    let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let text = trained.to_lightgbm_text(&names).expect("render");
    assert!(text.contains("objective=regression"));
    assert!(text.contains("feature_names=a b c"));

    let parsed = TreeEnsemble::from_lightgbm_text(&text).expect("reparse");
    assert_eq!(parsed.n_features, 3);
    assert_eq!(parsed.trees.len(), trained.trees.len());
    for row in x.iter().take(50) {
        assert!((parsed.predict_row(row) - trained.predict_row(row)).abs() < 1e-9);
    }
}

#[test]
fn export_rejects_mismatched_feature_names() {
    let ensemble = TreeEnsemble::from_lightgbm_text(two_tree_regression_text()).expect("parse");
    assert!(ensemble.to_lightgbm_text(&["only_one".to_string()]).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn export_command_writes_deployed_tree_model() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let model_dir = dir.path().join("models");
    let settings = EngineSettings::from_settings_map(&HashMap::from([(
        "MODEL_DIR".to_string(),
        model_dir.display().to_string(),
    )]))?;
    let app = AppContext::initialize(settings).await?;

    let (x, y) = synthetic_xy(120, 9);
    let rows: Vec<LabeledRow> = x
        .into_iter()
        .zip(y)
        .enumerate()
        .map(|(i, (features, target))| LabeledRow {
            isbn: format!("978{:07}", i / 2),
            features,
            price: target.exp_m1(),
            price_type: PriceType::Listing,
            timestamp: None,
        })
        .collect();
    let spec = ModelSpec::new(
        "export_test",
        "test",
        vec!["a".to_string(), "b".to_string(), "c".to_string()],
    );
    let config = TrainingConfig {
        min_samples: 20,
        search: price_engine::search::SearchConfig {
            n_iter: 0,
            ..Default::default()
        },
        ..TrainingConfig::default()
    };
    let model = train_price_model(&spec, rows, &GradientBoostingLearner::new(), &config)?;
    let artifact_dir = model_dir.join("export_test");
    app.store().save_model(&artifact_dir, &model)?;

    let output = dir.path().join("out").join("model.txt");
    export_lightgbm::run(&app, &artifact_dir, &output).await?;
    let parsed = TreeEnsemble::from_lightgbm_text(&std::fs::read_to_string(&output)?)?;
    let RegressorModel::Trees(original) = &model.regressor else {
        panic!("expected trees");
    };
    let scaled = model.scaler.transform_row(&[2.0, 0.1, 0.7])?;
    assert!((parsed.predict_row(&scaled) - original.predict_row(&scaled)).abs() < 1e-9);
    app.shutdown();
    Ok(())
}
