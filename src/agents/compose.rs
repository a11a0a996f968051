use std::fmt::Write as _;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{value_text, with_context_update};
use crate::registry::{AgentHandler, TaskRequest};
use crate::taxonomy::{ErrorSeverity, ErrorType};

/// Renders Markdown documents from workflow context and proposes error fixes.
pub struct ComposeAgent;

fn title_for(template: &str, task: &TaskRequest) -> String {
    match template {
        "code_fix" => "Fix proposal".to_string(),
        "code_improvements" => "Code improvements".to_string(),
        "monitoring_report" => "Monitoring report".to_string(),
        "emergency_fix" => "Emergency fix".to_string(),
        _ => task
            .lookup("topic")
            .and_then(Value::as_str)
            .unwrap_or("Documentation topic")
            .to_string(),
    }
}

fn render_document(template: &str, task: &TaskRequest) -> String {
    let mut doc = String::new();
    let _ = writeln!(doc, "# {}\n", title_for(template, task));

    if let Some(findings) = task.lookup("research_findings").and_then(Value::as_array) {
        doc.push_str("## Findings\n\n");
        for finding in findings {
            let _ = writeln!(doc, "- {}", value_text(finding));
        }
        doc.push('\n');
    }

    if let Some(analysis) = task.lookup("analysis").and_then(Value::as_object) {
        doc.push_str("## Analysis\n\n");
        for key in ["error_type", "cause", "impact"] {
            if let Some(value) = analysis.get(key) {
                let _ = writeln!(doc, "- **{key}:** {}", value_text(value));
            }
        }
        if let Some(metrics) = analysis.get("metrics").and_then(Value::as_object) {
            for (name, stats) in metrics {
                let _ = writeln!(
                    doc,
                    "- **{name}:** min {} / max {} / avg {}",
                    value_text(&stats["min"]),
                    value_text(&stats["max"]),
                    value_text(&stats["avg"])
                );
            }
        }
        if let Some(suggestions) = analysis.get("suggestions").and_then(Value::as_array) {
            doc.push_str("\n### Suggested actions\n\n");
            for suggestion in suggestions {
                let _ = writeln!(doc, "1. {}", value_text(suggestion));
            }
        }
        doc.push('\n');
    }

    if let Some(review) = task.lookup("review").and_then(Value::as_object) {
        doc.push_str("## Review\n\n");
        let _ = writeln!(
            doc,
            "- approved: {}\n- score: {}",
            value_text(review.get("approved").unwrap_or(&Value::Null)),
            value_text(review.get("score").unwrap_or(&Value::Null))
        );
        doc.push('\n');
    }

    if doc.lines().count() <= 2 {
        doc.push_str("No findings were collected for this document.\n");
    }
    doc
}

/// Build a fix proposal from the error context, the analysis, and any similar
/// fixes that worked before.
fn propose_fix(task: &TaskRequest) -> Value {
    let error_context = task
        .get("error_context")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let error_type = error_context
        .get("type")
        .cloned()
        .and_then(|value| serde_json::from_value::<ErrorType>(value).ok())
        .unwrap_or(ErrorType::Unknown);
    let severity = error_context
        .get("severity")
        .cloned()
        .and_then(|value| serde_json::from_value::<ErrorSeverity>(value).ok())
        .unwrap_or(ErrorSeverity::Medium);

    let similar = task
        .get("similar_fixes")
        .and_then(Value::as_array)
        .and_then(|fixes| fixes.first())
        .and_then(Value::as_object);
    if let Some(previous) = similar {
        let confidence = previous
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        let description = previous
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("previous fix");
        return json!({
            "type": previous.get("fix_type").cloned().unwrap_or_else(|| json!(error_type.fix_kind())),
            "description": format!("Reapply previous fix: {description}"),
            "code_changes": previous.get("code_changes").cloned().unwrap_or(Value::Null),
            "file_patches": previous.get("file_patches").cloned().unwrap_or(Value::Null),
            "confidence": (confidence + 0.1).min(0.95),
            "impact": severity.impact(),
            "rollback_plan": previous.get("rollback_plan").cloned().unwrap_or(Value::Null),
        });
    }

    let suggestion = task
        .lookup("analysis")
        .and_then(|analysis| analysis.get("suggestions"))
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(Value::as_str)
        .unwrap_or_else(|| error_type.suggestions()[0]);
    let confidence = match error_type {
        ErrorType::Unknown => 0.2,
        ErrorType::Security => 0.3,
        _ => 0.6,
    };

    json!({
        "type": error_type.fix_kind(),
        "description": suggestion,
        "confidence": confidence,
        "impact": severity.impact(),
    })
}

#[async_trait]
impl AgentHandler for ComposeAgent {
    async fn handle(&self, task: &TaskRequest) -> Result<Value> {
        if task.kind == "rollback" {
            return Ok(json!({
                "rolled_back": true,
                "restore_point": task.get("restore_point").cloned().unwrap_or(Value::Null),
            }));
        }

        let template = task.get_str("template").unwrap_or("default").to_string();
        if template == "error_fix" {
            return Ok(json!({ "template": template, "fix": propose_fix(task) }));
        }

        let content = render_document(&template, task);
        let mut result = Map::new();
        result.insert("template".to_string(), json!(template));
        result.insert("title".to_string(), json!(title_for(&template, task)));
        result.insert("content".to_string(), json!(content));
        Ok(with_context_update(result, "document", json!(content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn document_uses_topic_and_findings() {
        let task = TaskRequest::from_value(json!({
            "type": "compose",
            "template": "default",
            "context": {
                "topic": "Key rotation",
                "research_findings": ["Scope: Key rotation", "Related standards: ISO27001"]
            }
        }));
        let result = ComposeAgent.handle(&task).await.unwrap();
        let content = result["content"].as_str().unwrap();
        assert!(content.starts_with("# Key rotation"));
        assert!(content.contains("- Related standards: ISO27001"));
        assert_eq!(result["context_update"]["document"], result["content"]);
    }

    #[tokio::test]
    async fn monitoring_report_lists_metric_stats() {
        let task = TaskRequest::from_value(json!({
            "type": "compose",
            "template": "monitoring_report",
            "context": {
                "analysis": { "metrics": { "latency_ms": { "min": 10.0, "max": 30.0, "avg": 20.0 } } }
            }
        }));
        let result = ComposeAgent.handle(&task).await.unwrap();
        let content = result["content"].as_str().unwrap();
        assert!(content.starts_with("# Monitoring report"));
        assert!(content.contains("**latency_ms:** min 10.0 / max 30.0 / avg 20.0"));
    }

    #[tokio::test]
    async fn error_fix_prefers_similar_history() {
        let task = TaskRequest::from_value(json!({
            "type": "compose",
            "template": "error_fix",
            "error_context": { "type": "import", "severity": "high" },
            "analysis": { "suggestions": ["pip install pyyaml"] },
            "similar_fixes": [{
                "fix_type": "dependency",
                "description": "pin pyyaml",
                "confidence": 0.8
            }]
        }));
        let result = ComposeAgent.handle(&task).await.unwrap();
        let fix = &result["fix"];
        assert_eq!(fix["type"], json!("dependency"));
        assert_eq!(fix["description"], json!("Reapply previous fix: pin pyyaml"));
        assert!((fix["confidence"].as_f64().unwrap() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn error_fix_without_history_uses_analysis() {
        let task = TaskRequest::from_value(json!({
            "type": "compose",
            "template": "error_fix",
            "error_context": { "type": "runtime", "severity": "critical" },
            "analysis": { "suggestions": ["Guard the lookup"] },
            "similar_fixes": []
        }));
        let result = ComposeAgent.handle(&task).await.unwrap();
        assert_eq!(result["fix"]["type"], json!("code"));
        assert_eq!(result["fix"]["description"], json!("Guard the lookup"));
        assert_eq!(result["fix"]["confidence"], json!(0.6));
    }

    #[tokio::test]
    async fn rollback_task_is_acknowledged() {
        let task = TaskRequest::from_value(json!({ "type": "rollback", "restore_point": "b-17" }));
        let result = ComposeAgent.handle(&task).await.unwrap();
        assert_eq!(result["rolled_back"], json!(true));
        assert_eq!(result["restore_point"], json!("b-17"));
    }
}
