use crate::commands::{print_training_summary, TrainingSummary};
use crate::context::AppContext;
use crate::error::EstimatorError;
use crate::models::{Platform, TrainingRecord};
use crate::specialist::train_specialist;
use anyhow::{anyhow, Result};
use futures::future::join_all;
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SpecialistRunReport {
    pub trained: Vec<Platform>,
    pub skipped: Vec<Platform>,
    pub failed: Vec<Platform>,
}

pub async fn run(
    app: &AppContext,
    platforms: &[Platform],
    allow_partial: bool,
    data_file: Option<&Path>,
) -> Result<()> {
    let records = Arc::new(app.load_records(data_file).await?);
    train(app, records, platforms, allow_partial).await?;
    Ok(())
}

/// Trains each requested platform on its own blocking task. A platform without enough data
/// is skipped and keeps whatever artifact it had; other failures fail the run unless
/// `allow_partial` is set.
pub async fn train(
    app: &AppContext,
    records: Arc<Vec<TrainingRecord>>,
    platforms: &[Platform],
    allow_partial: bool,
) -> Result<SpecialistRunReport> {
    let platforms: Vec<Platform> = if platforms.is_empty() {
        Platform::ALL.to_vec()
    } else {
        platforms.to_vec()
    };
    let learner = app.learner()?;
    let config = app.settings().training_config(false);
    let extractor = *app.extractor();
    info!(
        "Training {} specialist(s) with {} on {} record(s)",
        platforms.len(),
        learner.name(),
        records.len()
    );

    let handles = platforms.iter().map(|&platform| {
        let records = Arc::clone(&records);
        let learner = Arc::clone(&learner);
        let store = app.store().clone();
        tokio::task::spawn_blocking(move || -> Result<TrainingSummary> {
            let model = train_specialist(platform, &records, learner.as_ref(), &config, &extractor)?;
            store.save_model(&store.specialist_dir(platform), &model)?;
            Ok(TrainingSummary::from_metadata(&model.metadata))
        })
    });
    let results = join_all(handles).await;

    let mut report = SpecialistRunReport::default();
    for (platform, joined) in platforms.iter().copied().zip(results) {
        let outcome = joined.map_err(|err| anyhow!("{platform} training task failed: {err}"));
        match outcome.and_then(|result| result) {
            Ok(summary) => {
                print_training_summary(&summary);
                report.trained.push(platform);
            }
            Err(err) if EstimatorError::is_data_insufficient(&err) => {
                warn!("Skipping {platform} specialist: {err}");
                report.skipped.push(platform);
            }
            Err(err) => {
                error!("{platform} specialist training failed: {err:#}");
                report.failed.push(platform);
            }
        }
    }

    info!(
        "Specialists trained: [{}], skipped: [{}], failed: [{}]",
        join_platforms(&report.trained),
        join_platforms(&report.skipped),
        join_platforms(&report.failed)
    );
    if !report.failed.is_empty() && !allow_partial {
        return Err(anyhow!(
            "Specialist training failed for {}",
            join_platforms(&report.failed)
        ));
    }
    Ok(report)
}

fn join_platforms(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(|platform| platform.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
