use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::agents::{AgentFactory, AgentKind};
use crate::config::AgentDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Research,
    Compose,
    Review,
    Integrate,
    Publish,
    Analyze,
    Monitor,
    Protect,
    Memory,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::Research,
        Capability::Compose,
        Capability::Review,
        Capability::Integrate,
        Capability::Publish,
        Capability::Analyze,
        Capability::Monitor,
        Capability::Protect,
        Capability::Memory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Research => "research",
            Capability::Compose => "compose",
            Capability::Review => "review",
            Capability::Integrate => "integrate",
            Capability::Publish => "publish",
            Capability::Analyze => "analyze",
            Capability::Monitor => "monitor",
            Capability::Protect => "protect",
            Capability::Memory => "memory",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Capability::ALL
            .into_iter()
            .find(|cap| cap.as_str() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "unknown capability '{}'. Expected one of: {}",
                    value,
                    Capability::ALL.map(Capability::as_str).join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Available,
    Busy,
    Error,
    Offline,
    Initializing,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
            AgentStatus::Initializing => "initializing",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task kinds handlers understand; anything else is dispatched as `process`.
pub const TASK_KINDS: [&str; 8] = [
    "research", "compose", "review", "publish", "analyze", "process", "execute", "rollback",
];

/// A unit of work handed to an agent. The payload is the full task object,
/// including its `type` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub kind: String,
    pub payload: Map<String, Value>,
}

impl TaskRequest {
    pub fn new(kind: &str, payload: Map<String, Value>) -> Self {
        Self {
            kind: normalize_task_kind(Some(kind)),
            payload,
        }
    }

    pub fn from_value(value: Value) -> Self {
        let payload = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        let kind = normalize_task_kind(payload.get("type").and_then(Value::as_str));
        Self { kind, payload }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Look a key up in the task first, then in the nested workflow `context`.
    /// Explicit nulls in the task fall through to the context.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.payload.get(key).filter(|value| !value.is_null()).or_else(|| {
            self.payload
                .get("context")
                .and_then(Value::as_object)
                .and_then(|ctx| ctx.get(key))
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

fn normalize_task_kind(kind: Option<&str>) -> String {
    match kind {
        Some(kind) if TASK_KINDS.contains(&kind) => kind.to_string(),
        _ => "process".to_string(),
    }
}

#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, task: &TaskRequest) -> Result<Value>;

    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub system: String,
    pub status: AgentStatus,
    pub capabilities: Vec<Capability>,
    pub kind: AgentKind,
    pub last_active: Option<DateTime<Utc>>,
    pub task_count: u64,
    pub error_count: u64,
    pub load: u32,
}

impl AgentRecord {
    pub fn new(id: &str, name: &str, system: &str, kind: AgentKind, caps: &[Capability]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            system: system.to_string(),
            status: AgentStatus::Initializing,
            capabilities: caps.to_vec(),
            kind,
            last_active: None,
            task_count: 0,
            error_count: 0,
            load: 0,
        }
    }

    fn from_definition(definition: &AgentDefinition) -> Self {
        Self::new(
            &definition.id,
            &definition.name,
            &definition.system,
            definition.kind,
            &definition.capabilities,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl TaskOutcome {
    fn failure(agent: Option<String>, error: String) -> Self {
        Self {
            success: false,
            agent,
            result: None,
            error: Some(error),
            timed_out: false,
        }
    }
}

/// Releases an agent reserved by `dispatch` if the task future is dropped
/// before the handler result is recorded.
struct BusyGuard {
    state: Arc<RwLock<RegistryState>>,
    agent_id: String,
    armed: bool,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let state = self.state.clone();
        let agent_id = std::mem::take(&mut self.agent_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut state = state.write().await;
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    agent.status = AgentStatus::Available;
                    agent.load = agent.load.saturating_sub(1);
                }
                tracing::debug!(agent = %agent_id, "released agent after cancelled task");
            });
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub system: String,
    pub status: AgentStatus,
    pub capabilities: Vec<Capability>,
    pub task_count: u64,
    pub error_count: u64,
    pub load: u32,
    pub last_active: Option<String>,
    pub loaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub total_agents: usize,
    pub by_system: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_capability: BTreeMap<String, usize>,
    pub agents: Vec<AgentSummary>,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
    order: Vec<String>,
    capability_map: HashMap<Capability, Vec<String>>,
}

impl RegistryState {
    fn available_for(&self, capability: Capability, system: Option<&str>) -> Vec<&AgentRecord> {
        let Some(ids) = self.capability_map.get(&capability) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.agents.get(id))
            .filter(|agent| agent.status == AgentStatus::Available)
            .filter(|agent| system.is_none_or(|system| agent.system == system))
            .collect()
    }

    fn select(&mut self, capability: Capability, prefer_system: Option<&str>) -> Option<String> {
        let mut candidates = self.available_for(capability, prefer_system);
        if candidates.is_empty() && prefer_system.is_some() {
            candidates = self.available_for(capability, None);
        }

        // min_by_key keeps the first of equal elements, so ties go to registration order.
        let selected = candidates
            .into_iter()
            .min_by_key(|agent| agent.load)
            .map(|agent| agent.id.clone())?;

        if let Some(agent) = self.agents.get_mut(&selected) {
            agent.load += 1;
            agent.task_count += 1;
            agent.last_active = Some(Utc::now());
        }
        Some(selected)
    }
}

/// Registry of agents across systems, indexed by capability.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every declared agent and register it. Agents whose handler
    /// cannot be built are still registered, as `Offline`.
    pub async fn initialize_all(&self, factory: &AgentFactory, definitions: &[AgentDefinition]) {
        for definition in definitions {
            let mut record = AgentRecord::from_definition(definition);
            if !definition.enabled {
                record.status = AgentStatus::Offline;
                self.register(record, None).await;
                continue;
            }

            match factory.build(definition) {
                Ok(handler) => {
                    record.status = AgentStatus::Available;
                    record.last_active = Some(Utc::now());
                    tracing::info!(agent = %definition.id, system = %definition.system, "agent loaded");
                    self.register(record, Some(handler)).await;
                }
                Err(err) => {
                    record.status = AgentStatus::Offline;
                    tracing::warn!(agent = %definition.id, error = %err, "agent failed to load");
                    self.register(record, None).await;
                }
            }
        }
    }

    pub async fn register(&self, mut record: AgentRecord, handler: Option<Arc<dyn AgentHandler>>) {
        let mut state = self.state.write().await;
        let id = record.id.clone();

        if state.agents.contains_key(&id) {
            for ids in state.capability_map.values_mut() {
                ids.retain(|existing| existing != &id);
            }
        } else {
            state.order.push(id.clone());
        }

        for capability in &record.capabilities {
            let ids = state.capability_map.entry(*capability).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
        }

        record.load = 0;
        match handler {
            Some(handler) => {
                state.handlers.insert(id.clone(), handler);
            }
            None => {
                state.handlers.remove(&id);
            }
        }
        tracing::debug!(agent = %id, capabilities = ?record.capabilities, "agent registered");
        state.agents.insert(id, record);
    }

    pub async fn agents_by_capability(
        &self,
        capability: Capability,
        system: Option<&str>,
    ) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        state
            .available_for(capability, system)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Pick the least-loaded available agent for a capability, preferring the
    /// given system, and reserve it (load and task counters are bumped).
    pub async fn select_agent(
        &self,
        capability: Capability,
        prefer_system: Option<&str>,
    ) -> Option<AgentRecord> {
        let mut state = self.state.write().await;
        let Some(id) = state.select(capability, prefer_system) else {
            tracing::warn!(capability = %capability, "no agent available");
            return None;
        };
        state.agents.get(&id).cloned()
    }

    pub async fn execute_task(
        &self,
        capability: Capability,
        task: &TaskRequest,
        prefer_system: Option<&str>,
    ) -> TaskOutcome {
        self.dispatch(capability, task, prefer_system, None).await
    }

    /// Like `execute_task`, but the handler must finish within `limit`. A
    /// timed-out agent goes back to `Available` with its error count bumped.
    pub async fn execute_task_within(
        &self,
        capability: Capability,
        task: &TaskRequest,
        prefer_system: Option<&str>,
        limit: Duration,
    ) -> TaskOutcome {
        self.dispatch(capability, task, prefer_system, Some(limit)).await
    }

    async fn dispatch(
        &self,
        capability: Capability,
        task: &TaskRequest,
        prefer_system: Option<&str>,
        limit: Option<Duration>,
    ) -> TaskOutcome {
        let (agent_id, handler) = {
            let mut state = self.state.write().await;
            let Some(agent_id) = state.select(capability, prefer_system) else {
                tracing::warn!(capability = %capability, "no agent available");
                return TaskOutcome::failure(None, format!("No agent available for {capability}"));
            };

            let Some(handler) = state.handlers.get(&agent_id).cloned() else {
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    agent.load = agent.load.saturating_sub(1);
                }
                return TaskOutcome::failure(
                    Some(agent_id.clone()),
                    format!("Agent {agent_id} not loaded"),
                );
            };

            if let Some(agent) = state.agents.get_mut(&agent_id) {
                agent.status = AgentStatus::Busy;
            }
            (agent_id, handler)
        };

        let mut guard = BusyGuard {
            state: self.state.clone(),
            agent_id: agent_id.clone(),
            armed: true,
        };
        tracing::debug!(agent = %agent_id, capability = %capability, kind = %task.kind, "dispatching task");
        let result = match limit {
            Some(limit) => tokio::time::timeout(limit, handler.handle(task))
                .await
                .map_err(|_| limit),
            None => Ok(handler.handle(task).await),
        };

        let mut state = self.state.write().await;
        guard.armed = false;
        let agent = state.agents.get_mut(&agent_id);
        match result {
            Ok(Ok(value)) => {
                if let Some(agent) = agent {
                    agent.status = AgentStatus::Available;
                    agent.load = agent.load.saturating_sub(1);
                    agent.last_active = Some(Utc::now());
                }
                TaskOutcome {
                    success: true,
                    agent: Some(agent_id),
                    result: Some(value),
                    error: None,
                    timed_out: false,
                }
            }
            Ok(Err(err)) => {
                if let Some(agent) = agent {
                    agent.status = AgentStatus::Error;
                    agent.error_count += 1;
                    agent.load = agent.load.saturating_sub(1);
                }
                tracing::warn!(agent = %agent_id, capability = %capability, error = %err, "agent task failed");
                TaskOutcome::failure(Some(agent_id), format!("{err:#}"))
            }
            Err(limit) => {
                if let Some(agent) = agent {
                    agent.status = AgentStatus::Available;
                    agent.error_count += 1;
                    agent.load = agent.load.saturating_sub(1);
                }
                tracing::warn!(agent = %agent_id, capability = %capability, limit_ms = limit.as_millis() as u64, "agent task timed out");
                let mut outcome = TaskOutcome::failure(
                    Some(agent_id),
                    format!("timed out after {}ms", limit.as_millis()),
                );
                outcome.timed_out = true;
                outcome
            }
        }
    }

    /// Probe every loaded agent and refresh statuses.
    pub async fn health_check(&self) {
        let handlers = {
            let state = self.state.read().await;
            state
                .order
                .iter()
                .map(|id| (id.clone(), state.handlers.get(id).cloned()))
                .collect::<Vec<_>>()
        };

        let mut results = Vec::with_capacity(handlers.len());
        for (id, handler) in handlers {
            let healthy = match handler {
                Some(handler) => Some(handler.health_check().await),
                None => None,
            };
            results.push((id, healthy));
        }

        let mut state = self.state.write().await;
        for (id, healthy) in results {
            let Some(agent) = state.agents.get_mut(&id) else {
                continue;
            };
            match healthy {
                Some(true) if agent.status != AgentStatus::Busy => {
                    agent.status = AgentStatus::Available;
                }
                Some(true) => {}
                Some(false) => {
                    tracing::warn!(agent = %id, "agent health check failed");
                    agent.status = AgentStatus::Error;
                }
                None if agent.status == AgentStatus::Available => {
                    agent.status = AgentStatus::Offline;
                }
                None => {}
            }
        }
    }

    pub async fn agent(&self, id: &str) -> Option<AgentRecord> {
        self.state.read().await.agents.get(id).cloned()
    }

    pub async fn agents(&self) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.agents.get(id))
            .cloned()
            .collect()
    }

    pub async fn status(&self) -> RegistryStatus {
        let state = self.state.read().await;
        let mut by_system = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        let mut agents = Vec::with_capacity(state.order.len());

        for agent in state.order.iter().filter_map(|id| state.agents.get(id)) {
            *by_system.entry(agent.system.clone()).or_insert(0) += 1;
            *by_status.entry(agent.status.to_string()).or_insert(0) += 1;
            agents.push(AgentSummary {
                id: agent.id.clone(),
                name: agent.name.clone(),
                system: agent.system.clone(),
                status: agent.status,
                capabilities: agent.capabilities.clone(),
                task_count: agent.task_count,
                error_count: agent.error_count,
                load: agent.load,
                last_active: agent.last_active.map(|ts| ts.to_rfc3339()),
                loaded: state.handlers.contains_key(&agent.id),
            });
        }

        let by_capability = state
            .capability_map
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(cap, ids)| (cap.to_string(), ids.len()))
            .collect();

        RegistryStatus {
            total_agents: state.agents.len(),
            by_system,
            by_status,
            by_capability,
            agents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Echo;

    #[async_trait]
    impl AgentHandler for Echo {
        async fn handle(&self, task: &TaskRequest) -> Result<Value> {
            Ok(json!({ "kind": task.kind }))
        }
    }

    struct Failing;

    #[async_trait]
    impl AgentHandler for Failing {
        async fn handle(&self, _task: &TaskRequest) -> Result<Value> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct Flaky(AtomicBool);

    #[async_trait]
    impl AgentHandler for Flaky {
        async fn handle(&self, _task: &TaskRequest) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn health_check(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn record(id: &str, system: &str, caps: &[Capability]) -> AgentRecord {
        let mut record = AgentRecord::new(id, id, system, AgentKind::Research, caps);
        record.status = AgentStatus::Available;
        record
    }

    #[test]
    fn capability_parses_case_insensitively() {
        assert_eq!("Review".parse::<Capability>().unwrap(), Capability::Review);
        assert!("deploy".parse::<Capability>().is_err());
        assert_eq!(
            serde_json::to_value(Capability::Memory).unwrap(),
            json!("memory")
        );
    }

    #[test]
    fn task_request_defaults_kind_to_process() {
        let task = TaskRequest::from_value(json!({ "query": "x" }));
        assert_eq!(task.kind, "process");
        let task = TaskRequest::from_value(json!({ "type": "deploy" }));
        assert_eq!(task.kind, "process");
        let task = TaskRequest::from_value(json!({ "type": "rollback" }));
        assert_eq!(task.kind, "rollback");
    }

    #[test]
    fn task_lookup_falls_back_to_context() {
        let task = TaskRequest::from_value(json!({
            "type": "research",
            "context": { "topic": "tls" }
        }));
        assert_eq!(task.lookup("topic"), Some(&json!("tls")));
        assert_eq!(task.lookup("missing"), None);
    }

    #[tokio::test]
    async fn select_prefers_system_then_falls_back() {
        let registry = AgentRegistry::new();
        registry
            .register(record("a", "documents", &[Capability::Research]), Some(Arc::new(Echo)))
            .await;
        registry
            .register(record("b", "galaxy", &[Capability::Research]), Some(Arc::new(Echo)))
            .await;

        let picked = registry
            .select_agent(Capability::Research, Some("galaxy"))
            .await
            .unwrap();
        assert_eq!(picked.id, "b");

        let picked = registry
            .select_agent(Capability::Research, Some("elsewhere"))
            .await
            .unwrap();
        assert_eq!(picked.id, "a");

        assert!(registry.select_agent(Capability::Publish, None).await.is_none());
    }

    #[tokio::test]
    async fn select_balances_by_load_with_registration_order_ties() {
        let registry = AgentRegistry::new();
        registry
            .register(record("first", "galaxy", &[Capability::Review]), Some(Arc::new(Echo)))
            .await;
        registry
            .register(record("second", "galaxy", &[Capability::Review]), Some(Arc::new(Echo)))
            .await;

        let one = registry.select_agent(Capability::Review, None).await.unwrap();
        let two = registry.select_agent(Capability::Review, None).await.unwrap();
        assert_eq!(one.id, "first");
        assert_eq!(two.id, "second");
        assert_eq!(registry.agent("first").await.unwrap().task_count, 1);
    }

    #[tokio::test]
    async fn execute_task_reports_missing_agent_and_handler() {
        let registry = AgentRegistry::new();
        let task = TaskRequest::from_value(json!({ "type": "publish" }));
        let outcome = registry.execute_task(Capability::Publish, &task, None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("No agent available for publish"));

        registry
            .register(record("ghost", "galaxy", &[Capability::Publish]), None)
            .await;
        let outcome = registry.execute_task(Capability::Publish, &task, None).await;
        assert_eq!(outcome.error.as_deref(), Some("Agent ghost not loaded"));
        assert_eq!(registry.agent("ghost").await.unwrap().load, 0);
    }

    #[tokio::test]
    async fn execute_task_updates_status_and_counters() {
        let registry = AgentRegistry::new();
        registry
            .register(record("ok", "galaxy", &[Capability::Analyze]), Some(Arc::new(Echo)))
            .await;
        registry
            .register(record("bad", "galaxy", &[Capability::Compose]), Some(Arc::new(Failing)))
            .await;

        let task = TaskRequest::from_value(json!({ "type": "analyze" }));
        let outcome = registry.execute_task(Capability::Analyze, &task, None).await;
        assert!(outcome.success);
        assert_eq!(outcome.agent.as_deref(), Some("ok"));
        assert_eq!(outcome.result, Some(json!({ "kind": "analyze" })));
        let ok = registry.agent("ok").await.unwrap();
        assert_eq!(ok.status, AgentStatus::Available);
        assert_eq!(ok.load, 0);

        let outcome = registry.execute_task(Capability::Compose, &task, None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
        let bad = registry.agent("bad").await.unwrap();
        assert_eq!(bad.status, AgentStatus::Error);
        assert_eq!(bad.error_count, 1);
        assert_eq!(bad.load, 0);
    }

    struct Slow;

    #[async_trait]
    impl AgentHandler for Slow {
        async fn handle(&self, _task: &TaskRequest) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn timed_out_task_releases_agent() {
        let registry = AgentRegistry::new();
        registry
            .register(record("slow", "galaxy", &[Capability::Integrate]), Some(Arc::new(Slow)))
            .await;

        let task = TaskRequest::from_value(json!({ "type": "execute" }));
        let outcome = registry
            .execute_task_within(Capability::Integrate, &task, None, Duration::from_millis(20))
            .await;
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert_eq!(outcome.error.as_deref(), Some("timed out after 20ms"));

        let slow = registry.agent("slow").await.unwrap();
        assert_eq!(slow.status, AgentStatus::Available);
        assert_eq!(slow.load, 0);
        assert_eq!(slow.error_count, 1);
    }

    #[tokio::test]
    async fn dropped_task_future_releases_agent() {
        let registry = AgentRegistry::new();
        registry
            .register(record("slow", "galaxy", &[Capability::Integrate]), Some(Arc::new(Slow)))
            .await;

        let task = TaskRequest::from_value(json!({ "type": "execute" }));
        let background = registry.clone();
        let handle = tokio::spawn(async move {
            background.execute_task(Capability::Integrate, &task, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.agent("slow").await.unwrap().status, AgentStatus::Busy);

        handle.abort();
        let _ = handle.await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let slow = registry.agent("slow").await.unwrap();
        assert_eq!(slow.status, AgentStatus::Available);
        assert_eq!(slow.load, 0);
    }

    #[tokio::test]
    async fn reregistering_drops_stale_capabilities() {
        let registry = AgentRegistry::new();
        registry
            .register(
                record("x", "galaxy", &[Capability::Research, Capability::Review]),
                Some(Arc::new(Echo)),
            )
            .await;
        registry
            .register(record("x", "galaxy", &[Capability::Review]), Some(Arc::new(Echo)))
            .await;

        assert!(registry
            .agents_by_capability(Capability::Research, None)
            .await
            .is_empty());
        assert_eq!(registry.agents_by_capability(Capability::Review, None).await.len(), 1);
        assert_eq!(registry.status().await.total_agents, 1);
    }

    #[tokio::test]
    async fn health_check_refreshes_statuses() {
        let registry = AgentRegistry::new();
        let flaky = Arc::new(Flaky(AtomicBool::new(false)));
        registry
            .register(record("flaky", "galaxy", &[Capability::Monitor]), Some(flaky.clone()))
            .await;
        registry
            .register(record("unloaded", "galaxy", &[Capability::Monitor]), None)
            .await;

        registry.health_check().await;
        assert_eq!(registry.agent("flaky").await.unwrap().status, AgentStatus::Error);
        assert_eq!(
            registry.agent("unloaded").await.unwrap().status,
            AgentStatus::Offline
        );

        flaky.0.store(true, Ordering::SeqCst);
        registry.health_check().await;
        assert_eq!(
            registry.agent("flaky").await.unwrap().status,
            AgentStatus::Available
        );

        let status = registry.status().await;
        assert_eq!(status.by_status.get("available"), Some(&1));
        assert_eq!(status.by_status.get("offline"), Some(&1));
        assert_eq!(status.by_capability.get("monitor"), Some(&2));
    }
}
