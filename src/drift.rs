use crate::artifacts::{read_json, resolve_artifact_dir_with, swap_into_place, to_json};
use crate::metrics::{mean, percentile, population_std};
use crate::monitor::{append_json_lines, read_json_lines, PredictionRecord};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_DRIFT_THRESHOLD_PCT: f64 = 20.0;
pub const BASELINE_FILE: &str = "baseline.json";
pub const ALERTS_FILE: &str = "drift_alerts.jsonl";
pub const GROUND_TRUTH_FILE: &str = "ground_truth.jsonl";

/// Baselines whose value is this close to zero cannot express a relative change.
const MIN_BASELINE_MAGNITUDE: f64 = 1e-6;

/// Served-prediction statistics over one time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringMetrics {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub model_name: String,
    pub n_predictions: usize,
    pub mean_prediction: f64,
    pub std_prediction: f64,
    pub n_with_ground_truth: usize,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
}

/// Records served by `model` (every model when `None`) at or after `since`.
pub fn records_in_window<'a>(
    records: &'a [PredictionRecord],
    model: Option<&str>,
    since: DateTime<Utc>,
) -> Vec<&'a PredictionRecord> {
    records
        .iter()
        .filter(|record| record.timestamp >= since && record.prediction.is_some())
        .filter(|record| model.map_or(true, |name| record.model_name == name))
        .collect()
}

fn errors(records: &[&PredictionRecord]) -> Vec<f64> {
    records.iter().filter_map(|record| record.error()).collect()
}

fn mean_absolute(errors: &[f64]) -> Option<f64> {
    if errors.is_empty() {
        return None;
    }
    let absolute: Vec<f64> = errors.iter().map(|e| e.abs()).collect();
    Some(mean(&absolute))
}

pub fn compute_metrics(
    records: &[PredictionRecord],
    model: Option<&str>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Option<MonitoringMetrics> {
    let window: Vec<&PredictionRecord> = records_in_window(records, model, window_start)
        .into_iter()
        .filter(|record| record.timestamp <= window_end)
        .collect();
    if window.is_empty() {
        return None;
    }
    let predictions: Vec<f64> = window.iter().filter_map(|r| r.prediction).collect();
    let latencies: Vec<f64> = window.iter().map(|r| r.latency_ms).collect();
    let errors = errors(&window);
    let squared: Vec<f64> = errors.iter().map(|e| e * e).collect();
    Some(MonitoringMetrics {
        window_start,
        window_end,
        model_name: model.unwrap_or("all").to_string(),
        n_predictions: window.len(),
        mean_prediction: mean(&predictions),
        std_prediction: population_std(&predictions),
        n_with_ground_truth: errors.len(),
        mae: mean_absolute(&errors),
        rmse: (!errors.is_empty()).then(|| mean(&squared).sqrt()),
        mean_latency_ms: mean(&latencies),
        p95_latency_ms: percentile(&latencies, 95),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributionStats {
    pub mean: f64,
    pub std: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
}

impl DistributionStats {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        Some(Self {
            mean: mean(values),
            std: population_std(values),
            p25: percentile(values, 25),
            p50: percentile(values, 50),
            p75: percentile(values, 75),
        })
    }
}

/// Reference distribution for one model, captured while it was known to behave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub n_predictions: usize,
    pub prediction: DistributionStats,
    #[serde(default)]
    pub mae: Option<f64>,
    pub features: BTreeMap<String, DistributionStats>,
}

fn feature_columns(records: &[&PredictionRecord]) -> BTreeMap<String, Vec<f64>> {
    let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for record in records {
        for (name, value) in &record.features {
            if value.is_finite() {
                columns.entry(name.clone()).or_default().push(*value);
            }
        }
    }
    columns
}

pub fn build_baseline(
    records: &[PredictionRecord],
    model: &str,
    since: DateTime<Utc>,
) -> Option<Baseline> {
    let window = records_in_window(records, Some(model), since);
    let predictions: Vec<f64> = window.iter().filter_map(|r| r.prediction).collect();
    let prediction = DistributionStats::of(&predictions)?;
    let features = feature_columns(&window)
        .into_iter()
        .filter_map(|(name, values)| DistributionStats::of(&values).map(|stats| (name, stats)))
        .collect();
    Some(Baseline {
        model_name: model.to_string(),
        created_at: Utc::now(),
        n_predictions: window.len(),
        prediction,
        mae: mean_absolute(&errors(&window)),
        features,
    })
}

pub fn baseline_dir(monitoring_dir: &Path, model: &str) -> PathBuf {
    monitoring_dir.join("baselines").join(model)
}

/// Replaces the stored baseline for the model.
pub fn save_baseline(monitoring_dir: &Path, baseline: &Baseline) -> Result<PathBuf> {
    let dir = baseline_dir(monitoring_dir, &baseline.model_name);
    swap_into_place(&dir, &[(BASELINE_FILE, to_json(baseline)?)])?;
    info!(
        "Saved {} baseline from {} prediction(s) to {}",
        baseline.model_name,
        baseline.n_predictions,
        dir.display()
    );
    Ok(dir.join(BASELINE_FILE))
}

pub fn load_baseline(monitoring_dir: &Path, model: &str) -> Result<Option<Baseline>> {
    match resolve_artifact_dir_with(&baseline_dir(monitoring_dir, model), BASELINE_FILE) {
        Some(dir) => Ok(Some(read_json(&dir.join(BASELINE_FILE))?)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    PredictionDrift,
    PerformanceDrift,
    FeatureDrift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        })
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(anyhow!(
                "Unknown severity '{}' (expected warning or critical)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftAlert {
    pub timestamp: DateTime<Utc>,
    pub model_name: String,
    pub drift_type: DriftKind,
    pub severity: Severity,
    pub metric: String,
    pub baseline_value: f64,
    pub current_value: f64,
    pub deviation_pct: f64,
    pub message: String,
}

fn deviation_pct(baseline: f64, current: f64) -> Option<f64> {
    if baseline.abs() < MIN_BASELINE_MAGNITUDE || !current.is_finite() {
        return None;
    }
    Some(((current - baseline) / baseline * 100.0).abs())
}

/// Beyond the threshold is a warning, beyond twice the threshold is critical.
fn severity(deviation: f64, threshold_pct: f64) -> Option<Severity> {
    if deviation > threshold_pct * 2.0 {
        Some(Severity::Critical)
    } else if deviation > threshold_pct {
        Some(Severity::Warning)
    } else {
        None
    }
}

struct AlertBuilder<'a> {
    model: &'a str,
    threshold_pct: f64,
    now: DateTime<Utc>,
    alerts: Vec<DriftAlert>,
}

impl AlertBuilder<'_> {
    fn check(
        &mut self,
        kind: DriftKind,
        metric: String,
        baseline: f64,
        current: f64,
        describe: impl FnOnce(f64) -> String,
    ) {
        let Some(deviation) = deviation_pct(baseline, current) else {
            return;
        };
        if let Some(severity) = severity(deviation, self.threshold_pct) {
            self.alerts.push(DriftAlert {
                timestamp: self.now,
                model_name: self.model.to_string(),
                drift_type: kind,
                severity,
                metric,
                baseline_value: baseline,
                current_value: current,
                deviation_pct: deviation,
                message: describe(deviation),
            });
        }
    }
}

/// Compares recent predictions with the baseline: prediction mean/std/median, MAE when ground
/// truth is present, and every feature mean the baseline knows.
pub fn detect_drift(
    baseline: &Baseline,
    recent: &[&PredictionRecord],
    threshold_pct: f64,
    now: DateTime<Utc>,
) -> Vec<DriftAlert> {
    let predictions: Vec<f64> = recent.iter().filter_map(|r| r.prediction).collect();
    let Some(current) = DistributionStats::of(&predictions) else {
        return Vec::new();
    };
    let mut builder = AlertBuilder {
        model: &baseline.model_name,
        threshold_pct,
        now,
        alerts: Vec::new(),
    };

    for (metric, base, value) in [
        ("prediction_mean", baseline.prediction.mean, current.mean),
        ("prediction_std", baseline.prediction.std, current.std),
        ("prediction_p50", baseline.prediction.p50, current.p50),
    ] {
        builder.check(
            DriftKind::PredictionDrift,
            metric.to_string(),
            base,
            value,
            |deviation| format!("Prediction distribution drift: {metric} changed by {deviation:.1}%"),
        );
    }

    if let (Some(base_mae), Some(current_mae)) = (baseline.mae, mean_absolute(&errors(recent))) {
        if current_mae > base_mae {
            builder.check(
                DriftKind::PerformanceDrift,
                "mae".to_string(),
                base_mae,
                current_mae,
                |deviation| format!("Performance degradation: MAE increased by {deviation:.1}%"),
            );
        }
    }

    for (name, values) in feature_columns(recent) {
        let Some(base) = baseline.features.get(&name) else {
            continue;
        };
        let current_mean = mean(&values);
        builder.check(
            DriftKind::FeatureDrift,
            format!("{name}_mean"),
            base.mean,
            current_mean,
            |deviation| format!("Feature drift: {name} mean changed by {deviation:.1}%"),
        );
    }
    builder.alerts
}

pub fn append_alerts(path: &Path, alerts: &[DriftAlert]) -> Result<()> {
    if alerts.is_empty() {
        return Ok(());
    }
    append_json_lines(path, alerts)
}

/// Stored alerts since `since`, newest first.
pub fn recent_alerts(
    path: &Path,
    since: DateTime<Utc>,
    severity: Option<Severity>,
    model: Option<&str>,
) -> Result<Vec<DriftAlert>> {
    let mut alerts: Vec<DriftAlert> = read_json_lines::<DriftAlert>(path)?
        .into_iter()
        .filter(|alert| alert.timestamp >= since)
        .filter(|alert| severity.map_or(true, |level| alert.severity == level))
        .filter(|alert| model.map_or(true, |name| alert.model_name == name))
        .collect();
    alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(alerts)
}

pub fn render_monitoring_report(
    metrics: Option<&MonitoringMetrics>,
    alerts: &[DriftAlert],
    hours: i64,
) -> String {
    let rule = "=".repeat(80);
    let mut out = vec![rule.clone(), "ML MONITORING REPORT".to_string(), rule.clone()];
    match metrics {
        Some(m) => {
            out.push(format!("\nMODEL: {}", m.model_name));
            out.push(format!(
                "WINDOW: {} to {}",
                m.window_start.to_rfc3339(),
                m.window_end.to_rfc3339()
            ));
            out.push("\nPREDICTION METRICS:".to_string());
            out.push(format!("  Total predictions: {}", m.n_predictions));
            out.push(format!("  Mean prediction: ${:.2}", m.mean_prediction));
            out.push(format!("  Std prediction: ${:.2}", m.std_prediction));
            if let (Some(mae), Some(rmse)) = (m.mae, m.rmse) {
                out.push(format!("\nPERFORMANCE (n={}):", m.n_with_ground_truth));
                out.push(format!("  MAE: ${mae:.2}"));
                out.push(format!("  RMSE: ${rmse:.2}"));
            }
            out.push("\nLATENCY:".to_string());
            out.push(format!("  Mean: {:.1}ms", m.mean_latency_ms));
            out.push(format!("  P95: {:.1}ms", m.p95_latency_ms));
        }
        None => out.push(format!("\nNo predictions in the last {hours} hours")),
    }
    if alerts.is_empty() {
        out.push(format!("\nNo drift alerts in the last {hours} hours"));
    } else {
        out.push(format!("\n{rule}"));
        out.push("DRIFT ALERTS".to_string());
        out.push(rule.clone());
        for alert in alerts {
            out.push(format!("\n[{}] {}", alert.severity, alert.timestamp.to_rfc3339()));
            out.push(format!("  {}", alert.message));
            out.push(format!(
                "  Baseline: {:.2}, Current: {:.2}",
                alert.baseline_value, alert.current_value
            ));
        }
    }
    out.push(format!("\n{rule}"));
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn served(model: &str, prediction: f64, truth: Option<f64>, page_count: f64, age_hours: i64) -> PredictionRecord {
        PredictionRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now() - Duration::hours(age_hours),
            model_name: model.to_string(),
            platform: None,
            prediction: Some(prediction),
            true_value: truth,
            latency_ms: 1.0 + prediction / 100.0,
            features: BTreeMap::from([("page_count".to_string(), page_count)]),
        }
    }

    #[test]
    fn metrics_cover_the_window_and_model() {
        let records = vec![
            served("unified", 10.0, Some(12.0), 300.0, 1),
            served("unified", 20.0, None, 300.0, 2),
            served("meta", 50.0, Some(40.0), 300.0, 1),
            served("unified", 99.0, Some(1.0), 300.0, 48),
        ];
        let now = Utc::now();
        let metrics = compute_metrics(&records, Some("unified"), now - Duration::hours(24), now)
            .expect("metrics");
        assert_eq!(metrics.n_predictions, 2);
        assert!((metrics.mean_prediction - 15.0).abs() < 1e-12);
        assert_eq!(metrics.n_with_ground_truth, 1);
        assert_eq!(metrics.mae, Some(2.0));
        assert_eq!(metrics.rmse, Some(2.0));

        let all = compute_metrics(&records, None, now - Duration::hours(24), now).expect("all");
        assert_eq!(all.model_name, "all");
        assert_eq!(all.n_predictions, 3);
        assert!(compute_metrics(&records, Some("bootstrap"), now - Duration::hours(24), now).is_none());
    }

    #[test]
    fn shifted_predictions_and_features_raise_alerts() {
        let history: Vec<PredictionRecord> = (0..20)
            .map(|i| served("unified", 10.0 + (i % 5) as f64, Some(10.0 + (i % 5) as f64 + 1.0), 300.0, 100))
            .collect();
        let baseline = build_baseline(&history, "unified", Utc::now() - Duration::hours(168))
            .expect("baseline");
        assert_eq!(baseline.n_predictions, 20);
        assert_eq!(baseline.mae, Some(1.0));

        let steady: Vec<PredictionRecord> = (0..10)
            .map(|i| served("unified", 10.0 + (i % 5) as f64, None, 300.0, 1))
            .collect();
        let steady_refs: Vec<&PredictionRecord> = steady.iter().collect();
        assert!(detect_drift(&baseline, &steady_refs, 20.0, Utc::now()).is_empty());

        // Prices tripled, page counts up 30%, errors four times larger.
        let shifted: Vec<PredictionRecord> = (0..10)
            .map(|i| {
                let price = 3.0 * (10.0 + (i % 5) as f64);
                served("unified", price, Some(price - 4.0), 390.0, 1)
            })
            .collect();
        let refs: Vec<&PredictionRecord> = shifted.iter().collect();
        let alerts = detect_drift(&baseline, &refs, 20.0, Utc::now());
        let metric = |name: &str| alerts.iter().find(|a| a.metric == name);
        assert_eq!(
            metric("prediction_mean").map(|a| a.severity),
            Some(Severity::Critical)
        );
        assert_eq!(metric("mae").map(|a| a.drift_type), Some(DriftKind::PerformanceDrift));
        let feature = metric("page_count_mean").expect("feature drift");
        assert_eq!(feature.severity, Severity::Warning);
        assert!((feature.deviation_pct - 30.0).abs() < 1e-9);
    }

    #[test]
    fn baselines_and_alerts_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records: Vec<PredictionRecord> =
            (0..5).map(|i| served("meta", 20.0 + i as f64, None, 200.0, 3)).collect();
        assert!(load_baseline(dir.path(), "meta").expect("load").is_none());
        let baseline = build_baseline(&records, "meta", Utc::now() - Duration::hours(24))
            .expect("baseline");
        save_baseline(dir.path(), &baseline).expect("save");
        let loaded = load_baseline(dir.path(), "meta").expect("load").expect("saved");
        assert_eq!(loaded.n_predictions, 5);
        assert!((loaded.prediction.mean - baseline.prediction.mean).abs() < 1e-9);
        assert!(loaded.features.contains_key("page_count"));

        let path = dir.path().join(ALERTS_FILE);
        let make = |severity, age: i64| DriftAlert {
            timestamp: Utc::now() - Duration::hours(age),
            model_name: "meta".to_string(),
            drift_type: DriftKind::PredictionDrift,
            severity,
            metric: "prediction_mean".to_string(),
            baseline_value: 20.0,
            current_value: 40.0,
            deviation_pct: 100.0,
            message: "Prediction distribution drift".to_string(),
        };
        append_alerts(&path, &[make(Severity::Warning, 30), make(Severity::Critical, 2)])
            .expect("append");
        append_alerts(&path, &[make(Severity::Warning, 1)]).expect("append again");

        let since = Utc::now() - Duration::hours(24);
        let recent = recent_alerts(&path, since, None, Some("meta")).expect("recent");
        assert_eq!(recent.len(), 2);
        assert!(recent[0].timestamp > recent[1].timestamp);
        let critical = recent_alerts(&path, since, Some(Severity::Critical), None).expect("critical");
        assert_eq!(critical.len(), 1);

        let report = render_monitoring_report(None, &recent, 24);
        assert!(report.contains("No predictions in the last 24 hours"));
        assert!(report.contains("[CRITICAL]"));
    }
}
