use crate::context::AppContext;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext) -> Result<()> {
    let estimator = app.estimator().await?;
    let report = estimator.model_info();
    info!(
        "Model status {} ({} artifact(s) under {})",
        report.status,
        report.models.len(),
        app.store().root().display()
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
