use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

use crate::registry::{AgentHandler, TaskRequest};

const MAX_STDERR: usize = 2_048;

/// Runs an external command as an agent. The task is written to stdin as
/// JSON; stdout is parsed as JSON when possible, otherwise returned as
/// `{"output": "..."}`. A non-zero exit status fails the task.
pub struct CommandAgent {
    command: String,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... truncated", &text[..end])
}

#[async_trait]
impl AgentHandler for CommandAgent {
    async fn handle(&self, task: &TaskRequest) -> Result<Value> {
        let start = Instant::now();
        let input = serde_json::to_vec(&task.to_value()).context("failed to encode task")?;

        let run = async move {
            let mut child = tokio::process::Command::new("bash")
                .arg("-c")
                .arg(&self.command)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            // Fed alongside output collection so neither pipe can fill up and
            // stall the other. The command may exit without reading stdin.
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(&input).await;
                    let _ = stdin.shutdown().await;
                });
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "command '{}' timed out after {}ms",
                    self.command,
                    self.timeout.as_millis()
                )
            })?
            .with_context(|| format!("failed to run command '{}'", self.command))?;

        let exit_code = output.status.code().unwrap_or(-1);
        tracing::info!(
            command = %self.command,
            exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "command agent finished"
        );
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "command '{}' exited with status {exit_code}: {}",
                self.command,
                truncate(stderr.trim(), MAX_STDERR)
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str::<Value>(trimmed)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({ "output": trimmed })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_task_json_from_stdin() {
        let agent = CommandAgent::new("cat".to_string(), Duration::from_secs(5));
        let task = TaskRequest::from_value(json!({ "type": "execute", "target": "docs" }));
        let result = agent.handle(&task).await.unwrap();
        assert_eq!(result["type"], json!("execute"));
        assert_eq!(result["target"], json!("docs"));
    }

    #[tokio::test]
    async fn large_input_does_not_stall_on_early_output() {
        // writes more than a pipe buffer before reading any input
        let agent = CommandAgent::new(
            "head -c 200000 /dev/zero | tr '\\0' a; cat >/dev/null; echo done".to_string(),
            Duration::from_secs(10),
        );
        let task = TaskRequest::from_value(json!({ "type": "execute", "payload": "x".repeat(1_000_000) }));
        let result = agent.handle(&task).await.unwrap();
        let output = result["output"].as_str().unwrap();
        assert_eq!(output.len(), 200_004);
        assert!(output.ends_with("done"));
    }

    #[tokio::test]
    async fn plain_stdout_is_wrapped() {
        let agent = CommandAgent::new("echo hello".to_string(), Duration::from_secs(5));
        let result = agent.handle(&TaskRequest::default()).await.unwrap();
        assert_eq!(result, json!({ "output": "hello" }));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let agent = CommandAgent::new("echo broken >&2; exit 3".to_string(), Duration::from_secs(5));
        let err = agent.handle(&TaskRequest::default()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("status 3"), "{message}");
        assert!(message.contains("broken"), "{message}");
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let agent = CommandAgent::new("sleep 5".to_string(), Duration::from_millis(100));
        let err = agent.handle(&TaskRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
