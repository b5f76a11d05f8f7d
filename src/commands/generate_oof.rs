use crate::context::AppContext;
use crate::models::{Platform, TrainingRecord};
use crate::oof::{availability_report, generate_oof, save_oof, OofMetadata, OofPredictions};
use crate::param_utils::Params;
use anyhow::Result;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub async fn run(app: &AppContext, data_file: Option<&Path>) -> Result<()> {
    let records = Arc::new(app.load_records(data_file).await?);
    generate(app, records).await?;
    Ok(())
}

/// Builds and persists out-of-fold predictions for every platform, reusing the deployed
/// specialists' hyperparameters where they exist.
pub async fn generate(
    app: &AppContext,
    records: Arc<Vec<TrainingRecord>>,
) -> Result<(OofPredictions, OofMetadata)> {
    let learner = app.learner()?;
    let extractor = *app.extractor();
    let store = app.store().clone();
    let config = app.settings().oof_config(deployed_params(app)?);

    let (predictions, metadata) = tokio::task::spawn_blocking(move || {
        let generated = generate_oof(
            &records,
            &Platform::ALL,
            learner.as_ref(),
            &config,
            &extractor,
        )?;
        save_oof(&store, &generated.0, &generated.1)?;
        Ok::<_, anyhow::Error>(generated)
    })
    .await??;

    for row in availability_report(&predictions) {
        info!(
            "OOF availability {:<8} {:>6}/{:<6} ({:.1}%)",
            row.platform.as_str(),
            row.available,
            row.total,
            row.coverage * 100.0
        );
    }
    for (platform, entry) in &metadata.platforms {
        if let Some(reason) = &entry.reason {
            warn!("{platform} has no out-of-fold signal: {reason}");
        }
    }
    match serde_json::to_string(&metadata) {
        Ok(payload) => println!("PRICE_ENGINE_OOF_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize OOF summary: {err}"),
    }
    Ok((predictions, metadata))
}

fn deployed_params(app: &AppContext) -> Result<BTreeMap<Platform, Params>> {
    let store = app.store();
    let mut params = BTreeMap::new();
    for platform in Platform::ALL {
        if let Some(metadata) = store.read_metadata(&store.specialist_dir(platform))? {
            params.insert(platform, metadata.hyperparameters);
        }
    }
    Ok(params)
}
