use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::ContextManager;
use crate::registry::{AgentHandler, TaskRequest};

const DEFAULT_IMPORTANCE: u8 = 5;
const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Exposes the shared knowledge store to workflows.
///
/// The task `action` is one of `store`, `recall`, or `search` (the default).
pub struct MemoryAgent {
    context: Arc<ContextManager>,
}

impl MemoryAgent {
    pub fn new(context: Arc<ContextManager>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl AgentHandler for MemoryAgent {
    async fn handle(&self, task: &TaskRequest) -> Result<Value> {
        let action = task.get_str("action").unwrap_or("search");
        match action {
            "store" => {
                let key = task
                    .get_str("key")
                    .filter(|key| !key.trim().is_empty())
                    .ok_or_else(|| anyhow::anyhow!("memory store requires a non-empty 'key'"))?;
                let value = task.get("value").cloned().unwrap_or(Value::Null);
                let importance = task
                    .get("importance")
                    .and_then(Value::as_u64)
                    .map(|importance| importance.min(10) as u8)
                    .unwrap_or(DEFAULT_IMPORTANCE);
                self.context.remember(key, value, importance)?;
                Ok(json!({ "action": "store", "key": key, "stored": true }))
            }
            "recall" => {
                let key = task
                    .get_str("key")
                    .ok_or_else(|| anyhow::anyhow!("memory recall requires a 'key'"))?;
                let entry = self.context.recall(key);
                Ok(json!({
                    "action": "recall",
                    "key": key,
                    "found": entry.is_some(),
                    "entry": entry,
                }))
            }
            "search" => {
                let query = task
                    .get_str("query")
                    .or_else(|| task.lookup("topic").and_then(Value::as_str))
                    .unwrap_or_default();
                let limit = task
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|limit| limit as usize)
                    .unwrap_or(DEFAULT_SEARCH_LIMIT);
                let hits = self.context.relevant_knowledge(query, limit);
                Ok(json!({ "action": "search", "query": query, "hits": hits }))
            }
            other => Err(anyhow::anyhow!(
                "unknown memory action '{other}'; expected store, recall, or search"
            )),
        }
    }
}
