use crate::bootstrap::{train_bootstrap, BootstrapEnsemble, BootstrapEvaluation};
use crate::commands::{print_training_summary, TrainingSummary};
use crate::context::AppContext;
use crate::models::TrainingRecord;
use crate::specialist::{unified_rows, unified_spec};
use anyhow::Result;
use log::info;
use std::path::Path;
use std::sync::Arc;

pub async fn run(app: &AppContext, n_models: Option<usize>, data_file: Option<&Path>) -> Result<()> {
    let records = Arc::new(app.load_records(data_file).await?);
    train(app, records, n_models).await?;
    Ok(())
}

/// Fits the interval ensemble on canonical rows with the deployed unified model's
/// hyperparameters, falling back to the learner defaults.
pub async fn train(
    app: &AppContext,
    records: Arc<Vec<TrainingRecord>>,
    n_models: Option<usize>,
) -> Result<(BootstrapEnsemble, BootstrapEvaluation)> {
    let learner = app.learner()?;
    let training = app.settings().training_config(false);
    let config = app.settings().bootstrap_config(n_models, true)?;
    let extractor = *app.extractor();
    let store = app.store().clone();
    let params = match store.read_metadata(&store.unified_dir())? {
        Some(metadata) => {
            info!(
                "Bootstrap members reuse unified hyperparameters from {}",
                metadata.version
            );
            metadata.hyperparameters
        }
        None => learner.default_params(),
    };

    let (ensemble, evaluation) = tokio::task::spawn_blocking(move || {
        let rows = unified_rows(&records, &extractor);
        let trained = train_bootstrap(
            &unified_spec(),
            rows,
            learner.as_ref(),
            &params,
            &training,
            &config,
        )?;
        trained.0.save(&store)?;
        Ok::<_, anyhow::Error>(trained)
    })
    .await??;

    print_training_summary(
        &TrainingSummary::from_metadata(ensemble.metadata()).with_bootstrap(evaluation),
    );
    Ok((ensemble, evaluation))
}
