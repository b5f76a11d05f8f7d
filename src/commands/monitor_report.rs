use crate::context::AppContext;
use crate::drift::{
    append_alerts, compute_metrics, detect_drift, load_baseline, records_in_window, recent_alerts,
    render_monitoring_report, DriftAlert, MonitoringMetrics, Severity, ALERTS_FILE,
    GROUND_TRUTH_FILE,
};
use crate::monitor::{apply_ground_truth, read_json_lines, read_prediction_log, PredictionRecord};
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;

pub fn prediction_log_path(app: &AppContext) -> Result<PathBuf> {
    app.settings().prediction_log_file.clone().ok_or_else(|| {
        anyhow!("PREDICTION_LOG_FILE must be set to monitor served predictions.")
    })
}

/// Logged predictions with every reported true price joined on.
pub fn load_scored_log(app: &AppContext) -> Result<Vec<PredictionRecord>> {
    let log_path = prediction_log_path(app)?;
    let mut records = read_prediction_log(&log_path)?;
    let truths = read_json_lines(&app.settings().monitoring_dir.join(GROUND_TRUTH_FILE))?;
    let matched = apply_ground_truth(&mut records, &truths);
    info!(
        "Loaded {} logged prediction(s) from {}, {} with ground truth",
        records.len(),
        log_path.display(),
        matched
    );
    Ok(records)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSummary {
    pub hours: i64,
    pub metrics: Option<MonitoringMetrics>,
    pub new_alerts: Vec<DriftAlert>,
    pub recent_alerts: usize,
    pub critical_alerts: usize,
}

/// Window metrics, a drift check against the saved baseline, and the alert history.
pub async fn run(app: &AppContext, model: Option<&str>, hours: i64) -> Result<MonitorSummary> {
    if hours <= 0 {
        return Err(anyhow!("--hours must be positive, got {}", hours));
    }
    let records = load_scored_log(app)?;
    let monitoring_dir = app.settings().monitoring_dir.clone();
    let alerts_path = monitoring_dir.join(ALERTS_FILE);
    let now = Utc::now();
    let since = now - Duration::hours(hours);

    let metrics = compute_metrics(&records, model, since, now);
    let mut new_alerts = Vec::new();
    match model {
        Some(name) => match load_baseline(&monitoring_dir, name)? {
            Some(baseline) => {
                let recent = records_in_window(&records, Some(name), since);
                new_alerts = detect_drift(
                    &baseline,
                    &recent,
                    app.settings().drift_threshold_pct,
                    now,
                );
                append_alerts(&alerts_path, &new_alerts)?;
            }
            None => warn!("No baseline saved for {}; run save-baseline to enable drift checks", name),
        },
        None => info!("Drift checks need --model; reporting metrics only"),
    }
    for alert in &new_alerts {
        warn!("[{}] {}", alert.severity, alert.message);
    }

    let history = recent_alerts(&alerts_path, since, None, model)?;
    println!(
        "{}",
        render_monitoring_report(metrics.as_ref(), &history, hours)
    );
    let summary = MonitorSummary {
        hours,
        critical_alerts: history
            .iter()
            .filter(|alert| alert.severity == Severity::Critical)
            .count(),
        recent_alerts: history.len(),
        metrics,
        new_alerts,
    };
    match serde_json::to_string(&summary) {
        Ok(payload) => println!("PRICE_ENGINE_MONITOR_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize monitoring summary: {err}"),
    }
    Ok(summary)
}
