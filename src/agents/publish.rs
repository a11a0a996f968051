use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde_json::{Map, Value, json};

use super::with_context_update;
use crate::registry::{AgentHandler, TaskRequest};

/// Writes documents to the local output directory. Remote channels are
/// recorded but not delivered.
pub struct PublishAgent {
    output_dir: PathBuf,
}

impl PublishAgent {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    fn resolve_target(&self, filename: &str) -> Result<PathBuf> {
        let relative = Path::new(filename);
        let escapes = relative.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if filename.trim().is_empty() || escapes {
            return Err(anyhow::anyhow!(
                "refusing to publish '{filename}': path must stay inside the output directory"
            ));
        }
        Ok(self.output_dir.join(relative))
    }

    fn publish_local(&self, filename: &str, content: &str) -> Result<PathBuf> {
        let target = self.resolve_target(filename)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory '{}'", parent.display())
            })?;
        }
        std::fs::write(&target, content)
            .with_context(|| format!("failed to write '{}'", target.display()))?;
        Ok(target)
    }
}

fn channels(task: &TaskRequest) -> Vec<String> {
    let listed = task
        .get("channels")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if listed.is_empty() {
        vec!["local".to_string()]
    } else {
        listed
    }
}

#[async_trait]
impl AgentHandler for PublishAgent {
    async fn handle(&self, task: &TaskRequest) -> Result<Value> {
        let content = task
            .get_str("content")
            .or_else(|| task.lookup("document").and_then(Value::as_str))
            .ok_or_else(|| anyhow::anyhow!("nothing to publish: no content or document in task"))?;
        let filename = task
            .get_str("filename")
            .or_else(|| task.lookup("filename").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("document_{}.md", Local::now().format("%Y%m%d_%H%M%S")));

        let mut published = Vec::new();
        let mut local_path = None;
        for channel in channels(task) {
            if channel == "local" {
                let path = self.publish_local(&filename, content)?;
                tracing::info!(path = %path.display(), "document published");
                published.push(json!({
                    "channel": channel,
                    "status": "published",
                    "path": path.display().to_string(),
                }));
                local_path = Some(path.display().to_string());
            } else {
                tracing::debug!(channel = %channel, "channel not configured; skipping");
                published.push(json!({ "channel": channel, "status": "skipped" }));
            }
        }

        let mut result = Map::new();
        result.insert("filename".to_string(), json!(filename));
        result.insert("published".to_string(), json!(published));
        Ok(with_context_update(
            result,
            "published_path",
            local_path.map(Value::String).unwrap_or(Value::Null),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_channel_writes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = PublishAgent::new(dir.path().to_path_buf());
        let task = TaskRequest::from_value(json!({
            "type": "publish",
            "channels": ["local", "slack"],
            "filename": "reports/out.md",
            "context": { "document": "# Hello\n" }
        }));

        let result = agent.handle(&task).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("reports/out.md")).unwrap();
        assert_eq!(written, "# Hello\n");
        assert_eq!(result["published"][0]["status"], json!("published"));
        assert_eq!(result["published"][1], json!({ "channel": "slack", "status": "skipped" }));
    }

    #[tokio::test]
    async fn default_filename_is_timestamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = PublishAgent::new(dir.path().to_path_buf());
        let task = TaskRequest::from_value(json!({ "type": "publish", "content": "# x" }));
        let result = agent.handle(&task).await.unwrap();
        let filename = result["filename"].as_str().unwrap();
        assert!(filename.starts_with("document_") && filename.ends_with(".md"));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = PublishAgent::new(dir.path().to_path_buf());
        for filename in ["../escape.md", "/etc/passwd"] {
            let task = TaskRequest::from_value(json!({
                "type": "publish",
                "content": "x",
                "filename": filename
            }));
            assert!(agent.handle(&task).await.is_err(), "{filename} should be rejected");
        }
    }

    #[tokio::test]
    async fn missing_content_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = PublishAgent::new(dir.path().to_path_buf());
        let task = TaskRequest::from_value(json!({ "type": "publish" }));
        assert!(agent.handle(&task).await.is_err());
    }
}
