use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::with_context_update;
use crate::registry::{AgentHandler, TaskRequest};

const DEFAULT_MIN_SCORE: f64 = 0.7;
const UNFINISHED_MARKERS: [&str; 3] = ["TODO", "FIXME", "XXX"];

/// Scores documents and validates applied fixes.
pub struct ReviewAgent {
    fail_on_reject: bool,
    min_score: f64,
}

impl ReviewAgent {
    pub fn new(fail_on_reject: bool, min_score: Option<f64>) -> Self {
        Self {
            fail_on_reject,
            min_score: min_score.unwrap_or(DEFAULT_MIN_SCORE),
        }
    }

    fn review_content(&self, content: &str) -> (f64, Vec<String>) {
        let mut issues = Vec::new();
        if content.trim().is_empty() {
            return (0.0, vec!["content is empty".to_string()]);
        }
        if !content.lines().any(|line| line.starts_with('#')) {
            issues.push("content has no headings".to_string());
        }
        for marker in UNFINISHED_MARKERS {
            if content.contains(marker) {
                issues.push(format!("content contains unfinished marker '{marker}'"));
            }
        }
        let score = (1.0 - 0.25 * issues.len() as f64).max(0.0);
        (score, issues)
    }

    fn review_fix(&self, fix: &Map<String, Value>) -> (f64, Vec<String>) {
        let mut issues = Vec::new();
        let description = fix
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if description.trim().is_empty() {
            issues.push("fix has no description".to_string());
        }
        let confidence = fix.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        if confidence < 0.5 {
            issues.push(format!("fix confidence {confidence:.2} is below 0.50"));
        }
        if fix.get("fix_type").and_then(Value::as_str) == Some("manual") {
            issues.push("manual fixes cannot be validated automatically".to_string());
        }
        let score = if issues.is_empty() { confidence } else { 0.0 };
        (score, issues)
    }
}

#[async_trait]
impl AgentHandler for ReviewAgent {
    async fn handle(&self, task: &TaskRequest) -> Result<Value> {
        let fix = task.get("fix").and_then(Value::as_object);
        let (score, issues, approved) = match fix {
            Some(fix) if task.get("fix_applied").and_then(Value::as_bool) == Some(true) => {
                let (score, issues) = self.review_fix(fix);
                let approved = issues.is_empty();
                (score, issues, approved)
            }
            _ => {
                let content = task
                    .get_str("content")
                    .or_else(|| task.lookup("document").and_then(Value::as_str))
                    .unwrap_or_default();
                let (score, issues) = self.review_content(content);
                (score, issues, score >= self.min_score)
            }
        };

        let standards = task.get("standards").cloned().unwrap_or_else(|| json!([]));
        let check_type = task.get_str("check_type").unwrap_or("content").to_string();
        tracing::debug!(check_type = %check_type, score, approved, "review completed");

        if !approved && self.fail_on_reject {
            return Err(anyhow::anyhow!(
                "review rejected ({check_type}): {}",
                issues.join("; ")
            ));
        }

        let review = json!({
            "approved": approved,
            "score": score,
            "issues": issues,
            "standards": standards,
            "check_type": check_type,
        });
        let mut result = review.as_object().cloned().unwrap_or_default();
        result.insert("type".to_string(), json!("review"));
        Ok(with_context_update(result, "review", review))
    }
}
