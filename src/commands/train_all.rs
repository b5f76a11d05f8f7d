use crate::commands::{generate_oof, train_bootstrap, train_meta, train_specialists, train_unified};
use crate::context::AppContext;
use crate::models::Platform;
use anyhow::Result;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Specialists, unified model, out-of-fold predictions, stacking model and bootstrap
/// ensemble, in dependency order over one load of the training data.
pub async fn run(app: &AppContext, allow_partial: bool, data_file: Option<&Path>) -> Result<()> {
    let started = Instant::now();
    let records = Arc::new(app.load_records(data_file).await?);

    let report =
        train_specialists::train(app, Arc::clone(&records), &Platform::ALL, allow_partial).await?;
    train_unified::train(app, Arc::clone(&records)).await?;
    let (predictions, _) = generate_oof::generate(app, Arc::clone(&records)).await?;
    let deployed = train_meta::deployed_specialists(app.store())?;
    let stackable = predictions
        .platforms_with_signal()
        .iter()
        .any(|platform| deployed.contains(platform));
    if !stackable {
        warn!("No deployed specialist produced out-of-fold predictions; skipping the stacking model");
    } else {
        train_meta::train(app, predictions).await?;
    }
    train_bootstrap::train(app, records, None).await?;
    app.refresh_models().await?;

    info!(
        "Training pipeline finished in {:.1}s ({} specialist(s) trained, {} skipped)",
        started.elapsed().as_secs_f64(),
        report.trained.len(),
        report.skipped.len()
    );
    Ok(())
}
