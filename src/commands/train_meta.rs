use crate::commands::{print_training_summary, TrainingSummary};
use crate::artifacts::ModelStore;
use crate::context::AppContext;
use crate::meta::{train_meta, MetaModel};
use crate::models::Platform;
use crate::oof::{load_oof, OofPredictions};
use anyhow::{anyhow, Result};

pub async fn run(app: &AppContext) -> Result<()> {
    let store = app.store().clone();
    let (predictions, _) = tokio::task::spawn_blocking(move || load_oof(&store))
        .await??
        .ok_or_else(|| {
            anyhow!("No out-of-fold predictions found; run generate-oof before train-meta.")
        })?;
    train(app, predictions).await?;
    Ok(())
}

pub async fn train(app: &AppContext, predictions: OofPredictions) -> Result<MetaModel> {
    let config = app.settings().training_config(false);
    let store = app.store().clone();
    let meta = tokio::task::spawn_blocking(move || -> Result<MetaModel> {
        let deployed = deployed_specialists(&store)?;
        let meta = train_meta(&predictions, &deployed, &config)?;
        store.save_model(&store.meta_dir(), &meta.model)?;
        Ok(meta)
    })
    .await??;
    print_training_summary(&TrainingSummary::from_metadata(&meta.model.metadata));
    Ok(meta)
}

/// Platforms with a specialist artifact on disk, in canonical order.
pub fn deployed_specialists(store: &ModelStore) -> Result<Vec<Platform>> {
    let mut deployed = Vec::new();
    for platform in Platform::ALL {
        if store.read_metadata(&store.specialist_dir(platform))?.is_some() {
            deployed.push(platform);
        }
    }
    Ok(deployed)
}
