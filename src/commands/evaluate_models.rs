use crate::context::AppContext;
use crate::evaluation::{
    compare_models, evaluate_model, render_evaluation_report, EvaluationMetrics, ModelEvaluation,
};
use crate::models::Platform;
use crate::router::{ModelSet, PredictionRouter, RouteOutcome};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const UNIFIED: &str = "unified";
pub const BOOTSTRAP: &str = "bootstrap_mean";
pub const ROUTED: &str = "routed";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsEvaluation {
    pub n_rows: usize,
    pub n_scored: usize,
    pub comparison: Vec<(String, EvaluationMetrics)>,
    pub best: ModelEvaluation,
}

/// Scores the deployed unified model, the bootstrap mean and the full routed estimator on
/// the canonical prices of a labelled file. Only rows every deployed model priced are used.
pub async fn run(app: &AppContext, data_file: Option<&Path>) -> Result<ModelsEvaluation> {
    let records = app.load_records(data_file).await?;
    let store = app.store().clone();
    let config = app.settings().router_config();
    let extractor = *app.extractor();

    let evaluation = tokio::task::spawn_blocking(move || -> Result<ModelsEvaluation> {
        // No logger: offline scoring must not land in the served-prediction log.
        let router = PredictionRouter::new(ModelSet::load(&store)?, config, extractor);
        let models = router.models();
        if models.is_empty() {
            return Err(anyhow!("No models deployed; run train-all first."));
        }

        let mut actual = Vec::new();
        let mut predictions: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut n_rows = 0usize;
        for sample in records.iter().filter_map(|r| r.sample_for(Platform::CANONICAL)) {
            n_rows += 1;
            let features = extractor.extract(&sample.signal).values().to_vec();
            let mut row: Vec<(&str, f64)> = Vec::new();
            if let Some(unified) = &models.unified {
                match unified.predict_price(&features) {
                    Ok(price) => row.push((UNIFIED, price)),
                    Err(err) => {
                        debug!("Unified model skipped {}: {err}", sample.isbn);
                        continue;
                    }
                }
            }
            if let Some(ensemble) = &models.bootstrap {
                match ensemble.predict(&features) {
                    Ok(prediction) => row.push((BOOTSTRAP, prediction.mean)),
                    Err(err) => {
                        debug!("Bootstrap ensemble skipped {}: {err}", sample.isbn);
                        continue;
                    }
                }
            }
            match router.predict(&sample.signal) {
                RouteOutcome::Priced(routed) => row.push((ROUTED, routed.price)),
                _ => continue,
            }
            actual.push(sample.target_price);
            for (name, price) in row {
                predictions.entry(name.to_string()).or_default().push(price);
            }
        }
        if actual.is_empty() {
            return Err(anyhow!(
                "None of the {} canonical row(s) was priced by every deployed model",
                n_rows
            ));
        }
        if actual.len() < n_rows {
            warn!(
                "Scoring {} of {} canonical row(s); the rest were not priced by every model",
                actual.len(),
                n_rows
            );
        }

        let comparison = compare_models(&actual, &predictions)?;
        let (best_name, _) = comparison
            .first()
            .ok_or_else(|| anyhow!("No model produced predictions"))?;
        let best = evaluate_model(best_name, &actual, &predictions[best_name])?;
        Ok(ModelsEvaluation {
            n_rows,
            n_scored: actual.len(),
            comparison,
            best,
        })
    })
    .await??;

    info!(
        "Evaluated {} model(s) on {} row(s); best is {} (MAE ${:.2})",
        evaluation.comparison.len(),
        evaluation.n_scored,
        evaluation.best.model,
        evaluation.best.overall.metrics.mae
    );
    println!(
        "{}",
        render_evaluation_report(&evaluation.best, &evaluation.comparison)
    );
    match serde_json::to_string(&evaluation) {
        Ok(payload) => println!("PRICE_ENGINE_EVALUATION_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize evaluation summary: {err}"),
    }
    Ok(evaluation)
}
