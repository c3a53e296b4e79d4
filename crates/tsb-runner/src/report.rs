//! Per-task result reports with forecast error metrics.

use crate::error::{Error, Result};
use crate::tasks::{column_values, Task};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_METRICS: &[&str] = &["smape", "mape", "rmse", "mae"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub duration_secs: f64,
    pub y_predict: Vec<Value>,
    pub y_real: Vec<Value>,
    /// Averaged over the task's series columns. A metric with no usable
    /// pairs (e.g. mape over all-zero actuals) is left out.
    pub metrics: BTreeMap<String, f64>,
    pub key_params: String,
    pub best_params: String,
}

/// Scores `predictions` against `ground_truth`, row by row, on the task's series columns.
pub fn make_report(
    task: &Task,
    predictions: &[Value],
    ground_truth: &[Value],
    key_params: impl Into<String>,
    best_params: impl Into<String>,
) -> Result<Report> {
    let series = &task.config().series_name;
    if series.is_empty() {
        return Err(Error::config(format!("task {} has no series columns", task.id())));
    }
    if predictions.is_empty() || ground_truth.is_empty() {
        return Err(Error::config("cannot report on empty predictions or ground truth"));
    }
    if predictions.len() != ground_truth.len() {
        return Err(Error::config(format!(
            "predictions have {} rows but ground truth has {}",
            predictions.len(),
            ground_truth.len()
        )));
    }

    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for column in series {
        let predicted = column_values(predictions, column);
        let actual = column_values(ground_truth, column);
        if predicted.len() != predictions.len() || actual.len() != ground_truth.len() {
            return Err(Error::config(format!(
                "column {} is missing or not numeric in some rows",
                column
            )));
        }
        for (name, value) in metrics_for(&predicted, &actual) {
            let entry = sums.entry(name).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    let metrics = sums
        .into_iter()
        .map(|(name, (sum, n))| (name.to_string(), sum / n as f64))
        .collect();

    let elapsed = Utc::now() - task.created_at;
    Ok(Report {
        duration_secs: elapsed.num_milliseconds() as f64 / 1000.0,
        y_predict: project(predictions, series),
        y_real: project(ground_truth, series),
        metrics,
        key_params: key_params.into(),
        best_params: best_params.into(),
    })
}

fn project(rows: &[Value], columns: &[String]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let mut out = Map::new();
            for c in columns {
                if let Some(v) = row.get(c) {
                    out.insert(c.clone(), v.clone());
                }
            }
            Value::Object(out)
        })
        .collect()
}

fn metrics_for(predicted: &[f64], actual: &[f64]) -> Vec<(&'static str, f64)> {
    let mut out = Vec::with_capacity(DEFAULT_METRICS.len());
    if let Some(v) = smape(predicted, actual) {
        out.push(("smape", v));
    }
    if let Some(v) = mape(predicted, actual) {
        out.push(("mape", v));
    }
    if let Some(v) = rmse(predicted, actual) {
        out.push(("rmse", v));
    }
    if let Some(v) = mae(predicted, actual) {
        out.push(("mae", v));
    }
    out
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

pub fn smape(predicted: &[f64], actual: &[f64]) -> Option<f64> {
    mean(predicted.iter().zip(actual).filter_map(|(p, a)| {
        let denom = p.abs() + a.abs();
        (denom != 0.0).then(|| 2.0 * (p - a).abs() / denom)
    }))
}

pub fn mape(predicted: &[f64], actual: &[f64]) -> Option<f64> {
    mean(
        predicted
            .iter()
            .zip(actual)
            .filter(|(_, a)| **a != 0.0)
            .map(|(p, a)| ((p - a) / a).abs()),
    )
}

pub fn rmse(predicted: &[f64], actual: &[f64]) -> Option<f64> {
    mean(predicted.iter().zip(actual).map(|(p, a)| (p - a).powi(2))).map(f64::sqrt)
}

pub fn mae(predicted: &[f64], actual: &[f64]) -> Option<f64> {
    mean(predicted.iter().zip(actual).map(|(p, a)| (p - a).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{sample_config, TaskKind};
    use serde_json::json;
    use std::sync::Arc;

    fn task(series: &[&str]) -> Task {
        let mut config = sample_config("694826", TaskKind::UnivariateForecast);
        config.series_name = series.iter().map(|s| s.to_string()).collect();
        Task::new(Arc::new(config), Some(8086), None, None)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn metric_values() {
        let p = [2.0, 4.0];
        let a = [1.0, 4.0];
        assert!(close(mae(&p, &a).expect("mae"), 0.5));
        assert!(close(rmse(&p, &a).expect("rmse"), (0.5f64).sqrt()));
        assert!(close(mape(&p, &a).expect("mape"), 0.5));
        assert!(close(smape(&p, &a).expect("smape"), (2.0 / 3.0) / 2.0));
    }

    #[test]
    fn zero_denominators_are_skipped() {
        assert!(close(mape(&[1.0, 3.0], &[0.0, 2.0]).expect("mape"), 0.5));
        assert_eq!(mape(&[1.0], &[0.0]), None);
        assert_eq!(smape(&[0.0], &[0.0]), None);
        assert_eq!(mae(&[], &[]), None);
    }

    #[test]
    fn report_projects_series_and_averages_metrics() {
        let t = task(&["a", "b"]);
        let predictions = vec![json!({"date": "2021-01-01", "a": 2.0, "b": 1.0})];
        let truth = vec![json!({"date": "2021-01-01", "a": 1.0, "b": 1.0, "extra": 9})];
        let report = make_report(&t, &predictions, &truth, "lr=0.1", "").expect("report");
        assert_eq!(report.y_predict, vec![json!({"a": 2.0, "b": 1.0})]);
        assert_eq!(report.y_real, vec![json!({"a": 1.0, "b": 1.0})]);
        assert!(close(report.metrics["mae"], 0.5));
        assert!(close(report.metrics["rmse"], 0.5));
        assert_eq!(report.key_params, "lr=0.1");
        assert!(report.duration_secs >= 0.0);
        let keys: Vec<_> = report.metrics.keys().cloned().collect();
        assert_eq!(keys, vec!["mae", "mape", "rmse", "smape"]);
    }

    #[test]
    fn mismatched_or_empty_inputs_are_rejected() {
        let t = task(&["a"]);
        let one = vec![json!({"a": 1.0})];
        let two = vec![json!({"a": 1.0}), json!({"a": 2.0})];
        assert!(matches!(make_report(&t, &one, &two, "", ""), Err(Error::Configuration(_))));
        assert!(matches!(make_report(&t, &[], &[], "", ""), Err(Error::Configuration(_))));
        let missing = vec![json!({"b": 1.0})];
        assert!(matches!(make_report(&t, &missing, &one, "", ""), Err(Error::Configuration(_))));
    }
}
