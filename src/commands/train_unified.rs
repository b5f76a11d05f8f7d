use crate::artifacts::PriceModel;
use crate::commands::{print_training_summary, TrainingSummary};
use crate::context::AppContext;
use crate::models::TrainingRecord;
use crate::specialist::train_unified;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

pub async fn run(app: &AppContext, data_file: Option<&Path>) -> Result<()> {
    let records = Arc::new(app.load_records(data_file).await?);
    train(app, records).await?;
    Ok(())
}

pub async fn train(app: &AppContext, records: Arc<Vec<TrainingRecord>>) -> Result<PriceModel> {
    let learner = app.learner()?;
    let config = app.settings().training_config(true);
    let extractor = *app.extractor();
    let store = app.store().clone();
    let model = tokio::task::spawn_blocking(move || -> Result<PriceModel> {
        let model = train_unified(&records, learner.as_ref(), &config, &extractor)?;
        store.save_model(&store.unified_dir(), &model)?;
        Ok(model)
    })
    .await??;
    print_training_summary(&TrainingSummary::from_metadata(&model.metadata));
    Ok(model)
}
