use crate::context::AppContext;
use crate::models::BookSignal;
use anyhow::{Context, Result};
use log::debug;
use serde_json::Value;
use std::path::Path;

/// Prices a single `BookSignal` or a JSON array of them and prints the estimates.
pub async fn run(app: &AppContext, input: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", input.display()))?;
    let estimator = app.estimator().await?;

    let output = if value.is_array() {
        let signals: Vec<BookSignal> = serde_json::from_value(value)
            .with_context(|| format!("{} is not an array of book signals", input.display()))?;
        serde_json::to_string_pretty(&estimator.estimate_batch(&signals))?
    } else {
        let signal: BookSignal = serde_json::from_value(value)
            .with_context(|| format!("{} is not a book signal", input.display()))?;
        serde_json::to_string_pretty(&estimator.estimate(&signal))?
    };
    println!("{output}");

    if let Ok(stats) = serde_json::to_string(&estimator.router().stats()) {
        debug!("Routing stats: {stats}");
    }
    Ok(())
}
