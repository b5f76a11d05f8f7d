use crate::context::AppContext;
use crate::drift::GROUND_TRUTH_FILE;
use crate::monitor::{record_ground_truth, GroundTruthRecord};
use anyhow::Result;
use log::info;
use uuid::Uuid;

pub async fn run(app: &AppContext, prediction_id: Uuid, price: f64) -> Result<GroundTruthRecord> {
    let path = app.settings().monitoring_dir.join(GROUND_TRUTH_FILE);
    let record = record_ground_truth(&path, prediction_id, price)?;
    info!("Recorded ${:.2} for prediction {}", price, prediction_id);
    Ok(record)
}
