use crate::bootstrap::{BootstrapEnsemble, BootstrapEvaluation, CALIBRATION_TOLERANCE};
use crate::commands::{print_training_summary, TrainingSummary};
use crate::context::AppContext;
use crate::features::{feature_names, owned_names};
use crate::specialist::unified_rows;
use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use std::path::Path;

/// Reports interval coverage of the deployed ensemble on a labelled file, typically one
/// held out from training. Fails when either interval under-covers beyond the tolerance.
pub async fn run(app: &AppContext, data_file: Option<&Path>) -> Result<()> {
    let evaluation = evaluate(app, data_file).await?;
    if !evaluation.calibration.calibrated {
        bail!(
            "Bootstrap intervals are miscalibrated: 90% covers {:.1}%, 95% covers {:.1}% (tolerance {:.0} points)",
            evaluation.ci_90_coverage * 100.0,
            evaluation.ci_95_coverage * 100.0,
            CALIBRATION_TOLERANCE * 100.0
        );
    }
    Ok(())
}

pub async fn evaluate(app: &AppContext, data_file: Option<&Path>) -> Result<BootstrapEvaluation> {
    let records = app.load_records(data_file).await?;
    let extractor = *app.extractor();
    let store = app.store().clone();

    let (ensemble, evaluation) = tokio::task::spawn_blocking(move || {
        let ensemble = BootstrapEnsemble::load(&store, &owned_names(&feature_names()))?
            .ok_or_else(|| anyhow!("No bootstrap ensemble deployed; run train-bootstrap first."))?;
        let rows = unified_rows(&records, &extractor);
        if rows.is_empty() {
            return Err(anyhow!("Evaluation data has no canonical prices"));
        }
        let x: Vec<Vec<f64>> = rows.iter().map(|row| row.features.clone()).collect();
        let y: Vec<f64> = rows.iter().map(|row| row.price).collect();
        let evaluation = ensemble.evaluate(&x, &y)?;
        Ok((ensemble, evaluation))
    })
    .await??;

    info!(
        "Bootstrap evaluation on {} row(s): MAE ${:.2}, 90% coverage {:.1}%, 95% coverage {:.1}%",
        evaluation.n_samples,
        evaluation.mae,
        evaluation.ci_90_coverage * 100.0,
        evaluation.ci_95_coverage * 100.0
    );
    if !evaluation.calibration.calibrated {
        warn!(
            "Calibration failure: 90% interval short by {:.1} points, 95% short by {:.1} points",
            evaluation.calibration.ci_90_shortfall * 100.0,
            evaluation.calibration.ci_95_shortfall * 100.0
        );
    }
    print_training_summary(
        &TrainingSummary::from_metadata(ensemble.metadata()).with_bootstrap(evaluation),
    );
    Ok(evaluation)
}
