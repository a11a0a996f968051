//! Built-in agent kinds and the factory that turns catalog definitions into
//! handlers.
//!
//! - `research`: derives findings from the task and workflow context
//! - `compose`: renders Markdown documents and error fixes
//! - `review`: scores content and validates applied fixes
//! - `publish`: writes documents under the output directory
//! - `analyze`: classifies errors and summarizes metrics
//! - `memory`: stores and recalls knowledge in the context store
//! - `command`: delegates to an external shell command speaking JSON

pub mod analyze;
pub mod command;
pub mod compose;
pub mod memory;
pub mod publish;
pub mod research;
pub mod review;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{AgentDefinition, RuntimeConfig};
use crate::context::ContextManager;
use crate::registry::{AgentHandler, Capability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Research,
    Compose,
    Review,
    Publish,
    Analyze,
    Memory,
    Command,
}

impl AgentKind {
    pub fn label(self) -> &'static str {
        match self {
            AgentKind::Research => "research",
            AgentKind::Compose => "compose",
            AgentKind::Review => "review",
            AgentKind::Publish => "publish",
            AgentKind::Analyze => "analyze",
            AgentKind::Memory => "memory",
            AgentKind::Command => "command",
        }
    }

    /// Capabilities assumed when a catalog entry omits them.
    pub fn default_capabilities(self) -> &'static [Capability] {
        match self {
            AgentKind::Research => &[Capability::Research],
            AgentKind::Compose => &[Capability::Compose],
            AgentKind::Review => &[Capability::Review],
            AgentKind::Publish => &[Capability::Publish],
            AgentKind::Analyze => &[Capability::Analyze],
            AgentKind::Memory => &[Capability::Memory],
            AgentKind::Command => &[],
        }
    }
}

pub struct AgentFactory {
    pub output_dir: PathBuf,
    pub command_timeout: Duration,
    pub context: Option<Arc<ContextManager>>,
}

impl AgentFactory {
    pub fn new(cfg: &RuntimeConfig, context: Option<Arc<ContextManager>>) -> Self {
        Self {
            output_dir: PathBuf::from(&cfg.output_dir),
            command_timeout: Duration::from_secs(cfg.command_timeout_secs),
            context,
        }
    }

    pub fn build(&self, definition: &AgentDefinition) -> Result<Arc<dyn AgentHandler>> {
        let handler: Arc<dyn AgentHandler> = match definition.kind {
            AgentKind::Research => Arc::new(research::ResearchAgent::new(&definition.system)),
            AgentKind::Compose => Arc::new(compose::ComposeAgent),
            AgentKind::Review => Arc::new(review::ReviewAgent::new(
                definition.fail_on_reject,
                definition.min_score,
            )),
            AgentKind::Publish => Arc::new(publish::PublishAgent::new(self.output_dir.clone())),
            AgentKind::Analyze => Arc::new(analyze::AnalyzeAgent),
            AgentKind::Memory => {
                let context = self.context.clone().ok_or_else(|| {
                    anyhow::anyhow!(
                        "agent '{}' needs a context store but none is configured",
                        definition.id
                    )
                })?;
                Arc::new(memory::MemoryAgent::new(context))
            }
            AgentKind::Command => {
                let command = definition.command.clone().ok_or_else(|| {
                    anyhow::anyhow!("agent '{}' has no command configured", definition.id)
                })?;
                let timeout = definition
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.command_timeout);
                Arc::new(command::CommandAgent::new(command, timeout))
            }
        };
        Ok(handler)
    }
}

/// Merge a `context_update` object into a handler result.
pub(crate) fn with_context_update(mut result: Map<String, Value>, key: &str, value: Value) -> Value {
    let mut update = Map::new();
    update.insert(key.to_string(), value);
    result.insert("context_update".to_string(), Value::Object(update));
    Value::Object(result)
}

/// Render a JSON value as short human text for documents and reports.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
