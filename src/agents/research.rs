use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{value_text, with_context_update};
use crate::registry::{AgentHandler, TaskRequest};

const RELATED_KEYS: [&str; 4] = ["error", "issue", "file_path", "standards"];

/// Collects findings from the task and the accumulated workflow context.
pub struct ResearchAgent {
    system: String,
}

impl ResearchAgent {
    pub fn new(system: &str) -> Self {
        Self {
            system: system.to_string(),
        }
    }

    fn findings(&self, query: &str, task: &TaskRequest) -> Vec<String> {
        let mut findings = vec![format!("Scope: {query}")];

        for key in RELATED_KEYS {
            if let Some(value) = task.lookup(key)
                && !value.is_null()
            {
                findings.push(format!("Related {key}: {}", value_text(value)));
            }
        }

        let analysis = task
            .lookup("analysis")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(cause) = analysis.get("cause").and_then(Value::as_str) {
            findings.push(format!("Known cause: {cause}"));
        }
        if let Some(suggestions) = analysis.get("suggestions").and_then(Value::as_array) {
            for suggestion in suggestions.iter().filter_map(Value::as_str) {
                findings.push(format!("Candidate fix: {suggestion}"));
            }
        }

        findings
    }
}

#[async_trait]
impl AgentHandler for ResearchAgent {
    async fn handle(&self, task: &TaskRequest) -> Result<Value> {
        let query = task
            .get_str("query")
            .or_else(|| task.lookup("topic").and_then(Value::as_str))
            .unwrap_or("general research")
            .to_string();
        let findings = self.findings(&query, task);
        tracing::debug!(query = %query, findings = findings.len(), "research completed");

        let mut result = Map::new();
        result.insert("query".to_string(), json!(query));
        result.insert("system".to_string(), json!(self.system));
        result.insert("findings".to_string(), json!(findings));
        result.insert("sources".to_string(), json!([]));
        Ok(with_context_update(result, "research_findings", json!(findings)))
    }
}
