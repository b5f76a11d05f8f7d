use crate::commands::monitor_report::load_scored_log;
use crate::context::AppContext;
use crate::drift::{build_baseline, save_baseline, Baseline};
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};

/// Captures the last `hours` of `model`'s served predictions as its drift baseline.
pub async fn run(app: &AppContext, model: &str, hours: i64) -> Result<Baseline> {
    if hours <= 0 {
        return Err(anyhow!("--hours must be positive, got {}", hours));
    }
    let records = load_scored_log(app)?;
    let baseline = build_baseline(&records, model, Utc::now() - Duration::hours(hours))
        .ok_or_else(|| {
            anyhow!(
                "No {} predictions logged in the last {} hours; nothing to baseline",
                model,
                hours
            )
        })?;
    save_baseline(&app.settings().monitoring_dir, &baseline)?;
    Ok(baseline)
}
