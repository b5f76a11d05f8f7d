use crate::metrics::{median, percentile, regression_metrics};
use crate::models::RegressionMetrics;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const DEFAULT_TOP_ERRORS: usize = 10;
pub const ERROR_PERCENTILES: [usize; 7] = [10, 25, 50, 75, 90, 95, 99];

/// Price bands for books, upper bound exclusive; `None` is open-ended.
pub const DEFAULT_PRICE_RANGES: [(f64, Option<f64>); 5] = [
    (0.0, Some(10.0)),
    (10.0, Some(20.0)),
    (20.0, Some(50.0)),
    (50.0, Some(100.0)),
    (100.0, None),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationMetrics {
    #[serde(flatten)]
    pub metrics: RegressionMetrics,
    pub median_absolute_error: f64,
    pub n_samples: usize,
}

impl EvaluationMetrics {
    pub fn compute(actual: &[f64], predicted: &[f64]) -> Result<Self> {
        check_lengths(actual, predicted)?;
        let absolute: Vec<f64> = actual
            .iter()
            .zip(predicted)
            .map(|(a, p)| (a - p).abs())
            .collect();
        Ok(Self {
            metrics: regression_metrics(actual, predicted),
            median_absolute_error: median(&absolute),
            n_samples: actual.len(),
        })
    }
}

fn check_lengths(actual: &[f64], predicted: &[f64]) -> Result<()> {
    if actual.len() != predicted.len() {
        return Err(anyhow!(
            "Evaluation needs one prediction per target ({} targets, {} predictions)",
            actual.len(),
            predicted.len()
        ));
    }
    Ok(())
}

/// One scored row. `error` is predicted minus actual.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredPrediction {
    pub actual: f64,
    pub predicted: f64,
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAnalysis {
    pub worst: Vec<ScoredPrediction>,
    pub best: Vec<ScoredPrediction>,
    pub overestimates: Vec<ScoredPrediction>,
    pub underestimates: Vec<ScoredPrediction>,
    pub error_percentiles: BTreeMap<usize, f64>,
}

fn by_abs_error(a: &ScoredPrediction, b: &ScoredPrediction) -> Ordering {
    a.error
        .abs()
        .partial_cmp(&b.error.abs())
        .unwrap_or(Ordering::Equal)
}

/// Largest and smallest misses, the largest misses in each direction, and absolute error
/// percentiles.
pub fn analyze_errors(actual: &[f64], predicted: &[f64], top_n: usize) -> Result<ErrorAnalysis> {
    check_lengths(actual, predicted)?;
    let mut scored: Vec<ScoredPrediction> = actual
        .iter()
        .zip(predicted)
        .map(|(&actual, &predicted)| ScoredPrediction {
            actual,
            predicted,
            error: predicted - actual,
        })
        .filter(|row| row.error.is_finite())
        .collect();
    scored.sort_by(by_abs_error);

    let worst: Vec<ScoredPrediction> = scored.iter().rev().take(top_n).copied().collect();
    let best: Vec<ScoredPrediction> = scored.iter().take(top_n).copied().collect();
    let overestimates: Vec<ScoredPrediction> = scored
        .iter()
        .rev()
        .filter(|row| row.error > 0.0)
        .take(top_n)
        .copied()
        .collect();
    let underestimates: Vec<ScoredPrediction> = scored
        .iter()
        .rev()
        .filter(|row| row.error < 0.0)
        .take(top_n)
        .copied()
        .collect();

    let absolute: Vec<f64> = scored.iter().map(|row| row.error.abs()).collect();
    let error_percentiles = ERROR_PERCENTILES
        .iter()
        .map(|&p| (p, percentile(&absolute, p)))
        .collect();
    Ok(ErrorAnalysis {
        worst,
        best,
        overestimates,
        underestimates,
        error_percentiles,
    })
}

pub fn price_range_label(min: f64, max: Option<f64>) -> String {
    match max {
        Some(max) => format!("${min:.0}-${max:.0}"),
        None => format!("${min:.0}+"),
    }
}

/// Metrics per actual-price band, in band order. Empty bands are left out.
pub fn segment_by_price_range(
    actual: &[f64],
    predicted: &[f64],
    ranges: &[(f64, Option<f64>)],
) -> Result<Vec<(String, EvaluationMetrics)>> {
    check_lengths(actual, predicted)?;
    let mut segments = Vec::new();
    for &(min, max) in ranges {
        let (seg_actual, seg_predicted): (Vec<f64>, Vec<f64>) = actual
            .iter()
            .zip(predicted)
            .filter(|(a, _)| **a >= min && max.map_or(true, |max| **a < max))
            .map(|(a, p)| (*a, *p))
            .unzip();
        if seg_actual.is_empty() {
            continue;
        }
        segments.push((
            price_range_label(min, max),
            EvaluationMetrics::compute(&seg_actual, &seg_predicted)?,
        ));
    }
    Ok(segments)
}

/// Scores several models on the same targets, best MAE first.
pub fn compare_models(
    actual: &[f64],
    predictions: &BTreeMap<String, Vec<f64>>,
) -> Result<Vec<(String, EvaluationMetrics)>> {
    let mut ranked = predictions
        .iter()
        .map(|(name, predicted)| Ok((name.clone(), EvaluationMetrics::compute(actual, predicted)?)))
        .collect::<Result<Vec<_>>>()?;
    ranked.sort_by(|a, b| {
        a.1.metrics
            .mae
            .partial_cmp(&b.1.metrics.mae)
            .unwrap_or(Ordering::Equal)
    });
    Ok(ranked)
}

/// Full evaluation of one model's predictions, as printed by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEvaluation {
    pub model: String,
    pub overall: EvaluationMetrics,
    pub segments: Vec<(String, EvaluationMetrics)>,
    pub errors: ErrorAnalysis,
}

pub fn evaluate_model(model: &str, actual: &[f64], predicted: &[f64]) -> Result<ModelEvaluation> {
    Ok(ModelEvaluation {
        model: model.to_string(),
        overall: EvaluationMetrics::compute(actual, predicted)?,
        segments: segment_by_price_range(actual, predicted, &DEFAULT_PRICE_RANGES)?,
        errors: analyze_errors(actual, predicted, DEFAULT_TOP_ERRORS)?,
    })
}

pub fn render_evaluation_report(evaluation: &ModelEvaluation, comparison: &[(String, EvaluationMetrics)]) -> String {
    let rule = "=".repeat(80);
    let mut out = String::new();
    let _ = writeln!(out, "{rule}\n{} EVALUATION REPORT\n{rule}", evaluation.model.to_uppercase());
    let overall = &evaluation.overall;
    let _ = writeln!(
        out,
        "\nOVERALL METRICS\n  MAE:   ${:.2}\n  RMSE:  ${:.2}\n  R2:    {:.3}\n  MAPE:  {:.1}%\n  MedAE: ${:.2}\n  Samples: {}",
        overall.metrics.mae,
        overall.metrics.rmse,
        overall.metrics.r2,
        overall.metrics.mape,
        overall.median_absolute_error,
        overall.n_samples
    );

    let _ = writeln!(out, "\n{rule}\nPERFORMANCE BY PRICE RANGE\n{rule}");
    for (label, metrics) in &evaluation.segments {
        let _ = writeln!(
            out,
            "\n{label}:\n  MAE:  ${:.2}\n  RMSE: ${:.2}\n  R2:   {:.3}\n  Samples: {}",
            metrics.metrics.mae, metrics.metrics.rmse, metrics.metrics.r2, metrics.n_samples
        );
    }

    let _ = writeln!(out, "\n{rule}\nERROR ANALYSIS\n{rule}\n\nError Percentiles:");
    for (p, value) in &evaluation.errors.error_percentiles {
        let _ = writeln!(out, "  {p}th: ${value:.2}");
    }
    let sections = [
        ("Worst Predictions", &evaluation.errors.worst),
        ("Best Predictions", &evaluation.errors.best),
        ("Top Overestimates", &evaluation.errors.overestimates),
        ("Top Underestimates", &evaluation.errors.underestimates),
    ];
    for (title, rows) in sections {
        if rows.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{title}:");
        for (i, row) in rows.iter().take(5).enumerate() {
            let _ = writeln!(
                out,
                "  {}. True: ${:.2}, Pred: ${:.2}, Error: ${:+.2}",
                i + 1,
                row.actual,
                row.predicted,
                row.error
            );
        }
    }

    if !comparison.is_empty() {
        let _ = writeln!(out, "\n{rule}\nMODEL COMPARISON\n{rule}");
        let _ = writeln!(
            out,
            "\n{:<24} {:>8} {:>8} {:>7} {:>7} {:>8}",
            "Model", "MAE", "RMSE", "R2", "MAPE", "Samples"
        );
        for (name, metrics) in comparison {
            let _ = writeln!(
                out,
                "{:<24} {:>8.2} {:>8.2} {:>7.3} {:>6.1}% {:>8}",
                name,
                metrics.metrics.mae,
                metrics.metrics.rmse,
                metrics.metrics.r2,
                metrics.metrics.mape,
                metrics.n_samples
            );
        }
    }
    out.push_str(&rule);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_analysis_orders_misses() {
        let actual = [10.0, 20.0, 30.0, 40.0, 50.0];
        let predicted = [11.0, 15.0, 30.5, 48.0, 50.0];
        let analysis = analyze_errors(&actual, &predicted, 2).expect("analysis");
        assert_eq!(analysis.worst[0].error, 8.0);
        assert_eq!(analysis.worst[1].error, -5.0);
        assert_eq!(analysis.best[0].error, 0.0);
        assert_eq!(analysis.best[1].error, 0.5);
        assert_eq!(
            analysis.overestimates.iter().map(|r| r.error).collect::<Vec<_>>(),
            vec![8.0, 1.0]
        );
        assert_eq!(analysis.underestimates.len(), 1);
        assert_eq!(analysis.underestimates[0].actual, 20.0);
        assert_eq!(analysis.error_percentiles.len(), ERROR_PERCENTILES.len());
        assert_eq!(analysis.error_percentiles[&50], 1.0);
    }

    #[test]
    fn segments_follow_actual_price_bands() {
        let actual = [5.0, 8.0, 15.0, 120.0];
        let predicted = [6.0, 8.0, 18.0, 100.0];
        let segments =
            segment_by_price_range(&actual, &predicted, &DEFAULT_PRICE_RANGES).expect("segments");
        let labels: Vec<&str> = segments.iter().map(|(label, _)| label.as_str()).collect();
        assert_eq!(labels, vec!["$0-$10", "$10-$20", "$100+"]);
        assert_eq!(segments[0].1.n_samples, 2);
        assert!((segments[0].1.metrics.mae - 0.5).abs() < 1e-12);
        assert!((segments[2].1.metrics.mae - 20.0).abs() < 1e-12);
    }

    #[test]
    fn comparison_ranks_by_mae_and_checks_lengths() {
        let actual = vec![10.0, 20.0, 30.0];
        let predictions = BTreeMap::from([
            ("unified".to_string(), vec![12.0, 22.0, 32.0]),
            ("meta".to_string(), vec![10.5, 19.5, 30.5]),
        ]);
        let ranked = compare_models(&actual, &predictions).expect("compare");
        assert_eq!(ranked[0].0, "meta");
        assert!((ranked[1].1.metrics.mae - 2.0).abs() < 1e-12);

        let short = BTreeMap::from([("broken".to_string(), vec![1.0])]);
        assert!(compare_models(&actual, &short).is_err());
    }

    #[test]
    fn report_lists_sections() {
        let actual = [10.0, 20.0, 30.0];
        let predicted = [12.0, 18.0, 30.0];
        let evaluation = evaluate_model("unified", &actual, &predicted).expect("evaluate");
        assert!((evaluation.overall.median_absolute_error - 2.0).abs() < 1e-12);
        let report = render_evaluation_report(&evaluation, &[("unified".to_string(), evaluation.overall)]);
        assert!(report.contains("UNIFIED EVALUATION REPORT"));
        assert!(report.contains("$10-$20"));
        assert!(report.contains("Top Underestimates"));
        assert!(report.contains("MODEL COMPARISON"));
    }
}
