use crate::context::AppContext;
use crate::regressor::RegressorModel;
use anyhow::{anyhow, Context, Result};
use log::info;
use std::fs;
use std::path::Path;

/// Writes a tree model artifact as LightGBM model text. The trees read standardized inputs;
/// `scaler.json` from the same artifact still has to be applied by whoever loads the text.
pub async fn run(app: &AppContext, model_dir: &Path, output: &Path) -> Result<()> {
    let store = app.store();
    let metadata = store
        .read_metadata(model_dir)?
        .ok_or_else(|| anyhow!("No model artifact found at {}", model_dir.display()))?;
    let model = store
        .load_model(model_dir, &metadata.feature_names)?
        .ok_or_else(|| anyhow!("No model artifact found at {}", model_dir.display()))?;

    let RegressorModel::Trees(ensemble) = &model.regressor else {
        return Err(anyhow!(
            "{} is a {} model; only tree models export to LightGBM text",
            metadata.model_name,
            model.regressor.kind()
        ));
    };
    let text = ensemble.to_lightgbm_text(&metadata.feature_names)?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(output, text).with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        "Exported {} ({}) to {}",
        metadata.model_name,
        metadata.version,
        output.display()
    );
    println!("Saved LightGBM model to {}", output.display());
    Ok(())
}
