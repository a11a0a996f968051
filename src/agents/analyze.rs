use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::with_context_update;
use crate::registry::{AgentHandler, TaskRequest};
use crate::taxonomy::{assess_severity, detect_error_type};

const ERROR_KEYS: [&str; 3] = ["error_message", "error", "issue"];

/// Classifies error reports and summarizes numeric metrics.
pub struct AnalyzeAgent;

fn analyze_error(message: &str, task: &TaskRequest) -> Map<String, Value> {
    let error_type = detect_error_type(message);
    let severity = match task.get_str("priority") {
        Some("critical") => crate::taxonomy::ErrorSeverity::Critical,
        _ => assess_severity(error_type, message),
    };

    let mut analysis = Map::new();
    analysis.insert("error_type".to_string(), json!(error_type));
    analysis.insert("severity".to_string(), json!(severity));
    analysis.insert("cause".to_string(), json!(error_type.probable_cause()));
    analysis.insert("impact".to_string(), json!(severity.impact()));
    analysis.insert("suggestions".to_string(), json!(error_type.suggestions()));
    if let Some(file_path) = task.lookup("file_path").and_then(Value::as_str) {
        analysis.insert("file_path".to_string(), json!(file_path));
    }
    analysis
}

fn collect_series(value: &Value) -> BTreeMap<String, Vec<f64>> {
    let mut series = BTreeMap::new();
    match value {
        Value::Array(items) => {
            let values = items.iter().filter_map(Value::as_f64).collect::<Vec<_>>();
            series.insert("values".to_string(), values);
        }
        Value::Object(map) => {
            for (name, item) in map {
                let values = match item {
                    Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
                    other => other.as_f64().into_iter().collect(),
                };
                series.insert(name.clone(), values);
            }
        }
        other => {
            if let Some(number) = other.as_f64() {
                series.insert("value".to_string(), vec![number]);
            }
        }
    }
    series.retain(|_, values| !values.is_empty());
    series
}

fn analyze_metrics(metrics: &Value) -> Map<String, Value> {
    let mut stats = Map::new();
    for (name, values) in collect_series(metrics) {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        stats.insert(
            name,
            json!({ "min": min, "max": max, "avg": avg, "samples": values.len() }),
        );
    }

    let mut analysis = Map::new();
    analysis.insert("analysis_type".to_string(), json!("performance"));
    analysis.insert("metrics".to_string(), Value::Object(stats));
    analysis
}

fn analyze_file(path: &str) -> Map<String, Value> {
    let mut analysis = Map::new();
    analysis.insert("file_path".to_string(), json!(path));
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let lines = content.lines().count();
            let markers = content
                .lines()
                .filter(|line| line.contains("TODO") || line.contains("FIXME"))
                .count();
            analysis.insert("lines".to_string(), json!(lines));
            analysis.insert("open_markers".to_string(), json!(markers));
        }
        Err(err) => {
            analysis.insert("readable".to_string(), json!(false));
            analysis.insert("read_error".to_string(), json!(err.to_string()));
        }
    }
    analysis
}

#[async_trait]
impl AgentHandler for AnalyzeAgent {
    async fn handle(&self, task: &TaskRequest) -> Result<Value> {
        let message = ERROR_KEYS
            .iter()
            .find_map(|key| task.lookup(key).and_then(Value::as_str))
            .filter(|message| !message.trim().is_empty());

        let analysis = if let Some(message) = message {
            analyze_error(message, task)
        } else if let Some(metrics) = task.lookup("metrics").filter(|value| !value.is_null()) {
            analyze_metrics(metrics)
        } else if let Some(path) = task.lookup("file_path").and_then(Value::as_str) {
            analyze_file(path)
        } else {
            return Err(anyhow::anyhow!(
                "nothing to analyze: expected an error message, metrics, or file_path"
            ));
        };

        let value = Value::Object(analysis.clone());
        Ok(with_context_update(analysis, "analysis", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn classifies_error_messages() {
        let task = TaskRequest::from_value(json!({
            "type": "analyze",
            "error_message": "ImportError: cannot import name 'x'",
            "file_path": "app.py"
        }));
        let result = AnalyzeAgent.handle(&task).await.unwrap();
        assert_eq!(result["error_type"], json!("import"));
        assert_eq!(result["file_path"], json!("app.py"));
        assert!(result["suggestions"].as_array().unwrap().len() >= 1);
        assert_eq!(result["context_update"]["analysis"]["error_type"], json!("import"));
    }

    #[tokio::test]
    async fn critical_priority_overrides_severity() {
        let task = TaskRequest::from_value(json!({
            "type": "analyze",
            "priority": "critical",
            "context": { "issue": "disk almost full" }
        }));
        let result = AnalyzeAgent.handle(&task).await.unwrap();
        assert_eq!(result["severity"], json!("critical"));
        assert_eq!(result["error_type"], json!("unknown"));
    }

    #[tokio::test]
    async fn summarizes_metric_series() {
        let task = TaskRequest::from_value(json!({
            "type": "analyze",
            "context": { "metrics": { "latency_ms": [10, 20, 30], "errors": 4 } }
        }));
        let result = AnalyzeAgent.handle(&task).await.unwrap();
        let latency = &result["metrics"]["latency_ms"];
        assert_eq!(latency["min"], json!(10.0));
        assert_eq!(latency["max"], json!(30.0));
        assert_eq!(latency["avg"], json!(20.0));
        assert_eq!(result["metrics"]["errors"]["samples"], json!(1));
    }

    #[tokio::test]
    async fn empty_task_is_rejected() {
        let task = TaskRequest::from_value(json!({ "type": "analyze" }));
        assert!(AnalyzeAgent.handle(&task).await.is_err());
    }
}
