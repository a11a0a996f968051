//! Workflow orchestration over the agent registry.
//!
//! Each started workflow runs on its own tokio task. The executor re-reads the
//! workflow under the lock before every step, so a cancellation (which flips
//! the status and aborts the task) is observed even when the abort lands
//! between awaits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

use crate::checkpoint::WorkflowStore;
use crate::config::RuntimeConfig;
use crate::context::ContextManager;
use crate::registry::{AgentRegistry, Capability, TaskOutcome, TaskRequest};
use crate::telemetry::TelemetrySink;
use crate::workflow::{
    StepStatus, Workflow, WorkflowStatus, WorkflowStatusReport, WorkflowSummary, WorkflowTemplate,
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub step_timeout: Duration,
    /// Total attempts per step; only timeouts are retried.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub prefer_system: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(120),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(500),
            prefer_system: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            step_timeout: Duration::from_secs(cfg.step_timeout_secs),
            retry_attempts: cfg.step_retry_attempts.max(1),
            retry_delay: Duration::from_millis(cfg.step_retry_delay_ms),
            prefer_system: cfg.prefer_system.clone(),
        }
    }
}

struct RunningWorkflow {
    token: u64,
    handle: JoinHandle<()>,
    done: watch::Receiver<bool>,
}

enum StepPlan {
    Skip,
    Run {
        step_id: String,
        name: String,
        capability: Capability,
        task: TaskRequest,
        rollback: Option<TaskRequest>,
    },
}

fn is_active(status: WorkflowStatus) -> bool {
    matches!(status, WorkflowStatus::Running | WorkflowStatus::Rollback)
}

/// Step task plus the workflow id, step id, and a copy of the workflow context.
fn step_task(
    base: &Map<String, Value>,
    workflow_id: &str,
    step_id: &str,
    context: &Map<String, Value>,
) -> TaskRequest {
    let mut payload = base.clone();
    payload.insert("workflow_id".to_string(), json!(workflow_id));
    payload.insert("step_id".to_string(), json!(step_id));
    payload.insert("context".to_string(), Value::Object(context.clone()));
    TaskRequest::from_value(Value::Object(payload))
}

#[derive(Clone)]
pub struct WorkflowOrchestrator {
    registry: AgentRegistry,
    templates: Arc<BTreeMap<String, WorkflowTemplate>>,
    workflows: Arc<RwLock<HashMap<String, Workflow>>>,
    running: Arc<Mutex<HashMap<String, RunningWorkflow>>>,
    next_token: Arc<AtomicU64>,
    store: Option<WorkflowStore>,
    telemetry: TelemetrySink,
    settings: Arc<OrchestratorSettings>,
    context: Option<Arc<ContextManager>>,
}

impl WorkflowOrchestrator {
    pub fn new(registry: AgentRegistry, templates: BTreeMap<String, WorkflowTemplate>) -> Self {
        Self {
            registry,
            templates: Arc::new(templates),
            workflows: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
            store: None,
            telemetry: TelemetrySink::disabled(),
            settings: Arc::new(OrchestratorSettings::default()),
            context: None,
        }
    }

    pub fn with_store(mut self, store: WorkflowStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_context(mut self, context: Arc<ContextManager>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn templates(&self) -> Vec<WorkflowTemplate> {
        self.templates.values().cloned().collect()
    }

    /// Load stored workflows into memory. Already-known ids are left alone.
    pub async fn restore_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let stored = store.load_all()?;
        let mut workflows = self.workflows.write().await;
        let mut restored = 0;
        for workflow in stored {
            if !workflows.contains_key(&workflow.id) {
                workflows.insert(workflow.id.clone(), workflow);
                restored += 1;
            }
        }
        tracing::info!(restored, dir = %store.dir().display(), "workflow store loaded");
        Ok(restored)
    }

    // ---- lifecycle --------------------------------------------------------

    pub async fn create_workflow(&self, kind: &str, context: Map<String, Value>) -> Result<String> {
        let template = self
            .templates
            .get(kind)
            .ok_or_else(|| anyhow::anyhow!("Unknown workflow type: {kind}"))?;
        let workflow = template.instantiate(context);
        let id = workflow.id.clone();

        self.persist(&workflow);
        self.remember_context(&workflow);
        self.telemetry.emit(
            "workflow.created",
            json!({ "workflow_id": id, "kind": kind, "steps": workflow.steps.len() }),
        );
        tracing::info!(workflow_id = %id, kind = %kind, "workflow created");
        self.workflows.write().await.insert(id.clone(), workflow);
        Ok(id)
    }

    pub async fn start_workflow(&self, id: &str) -> bool {
        let snapshot = {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(id) else {
                tracing::error!(workflow_id = %id, "cannot start unknown workflow");
                return false;
            };
            if workflow.status != WorkflowStatus::Pending {
                tracing::warn!(workflow_id = %id, status = %workflow.status, "workflow is not pending; not starting");
                return false;
            }
            workflow.status = WorkflowStatus::Running;
            workflow.started_at = Some(Utc::now());
            workflow.completed_at = None;
            workflow.clone()
        };
        self.persist(&snapshot);
        self.telemetry.emit(
            "workflow.started",
            json!({ "workflow_id": id, "kind": snapshot.kind }),
        );

        // Held across spawn so the task cannot deregister before it is registered.
        let mut running = self.running.lock().await;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);
        let this = self.clone();
        let workflow_id = id.to_string();
        let handle = tokio::spawn(async move {
            this.execute(&workflow_id).await;
            {
                let mut running = this.running.lock().await;
                if running.get(&workflow_id).is_some_and(|run| run.token == token) {
                    running.remove(&workflow_id);
                }
            }
            let _ = done_tx.send(true);
        });
        running.insert(
            id.to_string(),
            RunningWorkflow {
                token,
                handle,
                done: done_rx,
            },
        );
        tracing::info!(workflow_id = %id, "workflow started");
        true
    }

    pub async fn cancel_workflow(&self, id: &str) -> bool {
        let snapshot = {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(id) else {
                return false;
            };
            if !is_active(workflow.status) {
                return false;
            }
            let now = Utc::now();
            workflow.status = WorkflowStatus::Cancelled;
            workflow.completed_at = Some(now);
            for step in &mut workflow.steps {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Failed;
                    step.error = Some("cancelled".to_string());
                    step.completed_at = Some(now);
                }
            }
            workflow.clone()
        };

        if let Some(run) = self.running.lock().await.remove(id) {
            run.handle.abort();
        }
        self.persist(&snapshot);
        self.telemetry.emit(
            "workflow.cancelled",
            json!({ "workflow_id": id, "kind": snapshot.kind }),
        );
        tracing::info!(workflow_id = %id, "workflow cancelled");
        true
    }

    /// Wait until a running workflow finishes and return its final status.
    pub async fn wait_for(&self, id: &str) -> Option<WorkflowStatusReport> {
        let done = self
            .running
            .lock()
            .await
            .get(id)
            .map(|run| run.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the task was aborted; either way it is over.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.workflow_status(id).await
    }

    /// Restart a failed, cancelled, or interrupted workflow from its last
    /// checkpoint. Steps that already succeeded are kept.
    pub async fn resume_workflow(&self, id: &str) -> Result<bool> {
        if self.running.lock().await.contains_key(id) {
            return Err(anyhow::anyhow!("workflow {id} is already running"));
        }

        let stored = match &self.store {
            Some(store) => store.load(id)?,
            None => None,
        };
        let mut workflow = match stored {
            Some(workflow) => workflow,
            None => self
                .workflows
                .read()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Unknown workflow: {id}"))?,
        };

        match workflow.status {
            WorkflowStatus::Completed => {
                return Err(anyhow::anyhow!(
                    "workflow {id} already completed and cannot be resumed"
                ));
            }
            WorkflowStatus::Pending => {}
            WorkflowStatus::Running
            | WorkflowStatus::Rollback
            | WorkflowStatus::Failed
            | WorkflowStatus::Cancelled => {
                for step in &mut workflow.steps {
                    if step.status != StepStatus::Success {
                        step.reset();
                    }
                }
                workflow.status = WorkflowStatus::Pending;
                workflow.error = None;
                workflow.completed_at = None;
            }
        }

        self.persist(&workflow);
        self.workflows.write().await.insert(id.to_string(), workflow);
        tracing::info!(workflow_id = %id, "workflow resumed");
        Ok(self.start_workflow(id).await)
    }

    // ---- queries ----------------------------------------------------------

    pub async fn workflow(&self, id: &str) -> Option<Workflow> {
        self.workflows.read().await.get(id).cloned()
    }

    pub async fn workflow_status(&self, id: &str) -> Option<WorkflowStatusReport> {
        self.workflows
            .read()
            .await
            .get(id)
            .map(Workflow::status_report)
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let workflows = self.workflows.read().await;
        let mut ordered = workflows.values().collect::<Vec<_>>();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        ordered.into_iter().map(Workflow::summary).collect()
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    // ---- executor ---------------------------------------------------------

    async fn execute(&self, id: &str) {
        let step_count = match self.workflows.read().await.get(id) {
            Some(workflow) => workflow.steps.len(),
            None => return,
        };

        for index in 0..step_count {
            let Some(plan) = self.plan_step(id, index).await else {
                return;
            };
            let StepPlan::Run {
                step_id,
                name,
                capability,
                task,
                rollback,
            } = plan
            else {
                continue;
            };

            let (outcome, attempts) = self.run_with_retries(capability, &task).await;
            let Some(succeeded) = self.record_step(id, index, &outcome, attempts).await else {
                return;
            };
            if succeeded {
                continue;
            }

            let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            if let Some(rollback) = rollback
                && self.roll_back(id, index, capability, &rollback).await
            {
                continue;
            }
            self.fail(id, &step_id, &format!("Step {name} failed: {error}"))
                .await;
            return;
        }

        self.finish(id).await;
    }

    /// Decide what to do with step `index`. `None` means stop executing.
    async fn plan_step(&self, id: &str, index: usize) -> Option<StepPlan> {
        let (plan, snapshot) = {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows.get_mut(id)?;
            if workflow.status != WorkflowStatus::Running {
                return None;
            }
            if workflow.steps[index].status != StepStatus::Pending {
                return Some(StepPlan::Skip);
            }

            if !workflow.dependencies_met(&workflow.steps[index]) {
                let step = &mut workflow.steps[index];
                step.status = StepStatus::Skipped;
                step.completed_at = Some(Utc::now());
                tracing::info!(workflow_id = %id, step = %step.id, "step skipped: dependencies not met");
                self.telemetry.emit(
                    "step.skipped",
                    json!({ "workflow_id": id, "step_id": step.id }),
                );
                (StepPlan::Skip, workflow.clone())
            } else {
                let context = workflow.context.clone();
                let step = &mut workflow.steps[index];
                step.status = StepStatus::Running;
                step.started_at = Some(Utc::now());
                let task = step_task(&step.task, id, &step.id, &context);
                let rollback = step
                    .rollback_task
                    .as_ref()
                    .map(|rollback| step_task(rollback, id, &step.id, &context));
                tracing::info!(workflow_id = %id, step = %step.id, capability = %step.capability, "step started");
                let plan = StepPlan::Run {
                    step_id: step.id.clone(),
                    name: step.name.clone(),
                    capability: step.capability,
                    task,
                    rollback,
                };
                (plan, workflow.clone())
            }
        };
        self.persist(&snapshot);
        Some(plan)
    }

    async fn run_with_retries(&self, capability: Capability, task: &TaskRequest) -> (TaskOutcome, u32) {
        let attempts = self.settings.retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .registry
                .execute_task_within(
                    capability,
                    task,
                    self.settings.prefer_system.as_deref(),
                    self.settings.step_timeout,
                )
                .await;
            if outcome.success || !outcome.timed_out || attempt >= attempts {
                return (outcome, attempt);
            }
            tracing::warn!(
                capability = %capability,
                attempt,
                attempts,
                "step timed out; retrying"
            );
            tokio::time::sleep(self.settings.retry_delay).await;
        }
    }

    /// Store a step outcome. Returns `None` if the workflow was cancelled or
    /// removed meanwhile, otherwise whether the step succeeded.
    async fn record_step(
        &self,
        id: &str,
        index: usize,
        outcome: &TaskOutcome,
        attempts: u32,
    ) -> Option<bool> {
        let snapshot = {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows.get_mut(id)?;
            if workflow.status != WorkflowStatus::Running {
                return None;
            }
            let step = &mut workflow.steps[index];
            step.attempts += attempts;
            step.completed_at = Some(Utc::now());

            if outcome.success {
                let result = outcome.result.clone().unwrap_or(Value::Null);
                step.status = StepStatus::Success;
                step.result = Some(result.clone());
                step.error = None;
                let step_id = step.id.clone();
                if let Some(update) = result.get("context_update").and_then(Value::as_object) {
                    for (key, value) in update {
                        workflow.context.insert(key.clone(), value.clone());
                    }
                }
                workflow.results.insert(step_id.clone(), result);
                tracing::info!(workflow_id = %id, step = %step_id, agent = ?outcome.agent, "step completed");
                self.telemetry.emit(
                    "step.succeeded",
                    json!({ "workflow_id": id, "step_id": step_id, "agent": outcome.agent, "attempts": attempts }),
                );
            } else {
                step.status = StepStatus::Failed;
                step.error = outcome.error.clone();
                tracing::warn!(workflow_id = %id, step = %step.id, error = ?outcome.error, "step failed");
                self.telemetry.emit(
                    "step.failed",
                    json!({
                        "workflow_id": id,
                        "step_id": step.id,
                        "error": outcome.error,
                        "timed_out": outcome.timed_out,
                        "attempts": attempts,
                    }),
                );
            }
            workflow.clone()
        };
        self.persist(&snapshot);
        Some(outcome.success)
    }

    async fn roll_back(
        &self,
        id: &str,
        index: usize,
        capability: Capability,
        task: &TaskRequest,
    ) -> bool {
        {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(id) else {
                return false;
            };
            if workflow.status != WorkflowStatus::Running {
                return false;
            }
            workflow.status = WorkflowStatus::Rollback;
        }

        let outcome = self
            .registry
            .execute_task_within(
                capability,
                task,
                self.settings.prefer_system.as_deref(),
                self.settings.step_timeout,
            )
            .await;

        let snapshot = {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(id) else {
                return false;
            };
            if workflow.status != WorkflowStatus::Rollback {
                return false;
            }
            workflow.status = WorkflowStatus::Running;
            if outcome.success {
                let step = &mut workflow.steps[index];
                step.status = StepStatus::RolledBack;
                if let Some(result) = outcome.result.clone() {
                    step.result = Some(result);
                }
                tracing::info!(workflow_id = %id, step = %step.id, "step rolled back");
                self.telemetry.emit(
                    "step.rolled_back",
                    json!({ "workflow_id": id, "step_id": step.id }),
                );
            } else {
                tracing::warn!(workflow_id = %id, error = ?outcome.error, "rollback failed");
            }
            workflow.clone()
        };
        self.persist(&snapshot);
        outcome.success
    }

    async fn fail(&self, id: &str, step_id: &str, error: &str) {
        let snapshot = {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(id) else {
                return;
            };
            if workflow.status != WorkflowStatus::Running {
                return;
            }
            workflow.status = WorkflowStatus::Failed;
            workflow.error = Some(error.to_string());
            workflow.completed_at = Some(Utc::now());
            workflow.clone()
        };
        tracing::error!(workflow_id = %id, step = %step_id, error = %error, "workflow failed");
        self.telemetry.emit(
            "workflow.failed",
            json!({ "workflow_id": id, "kind": snapshot.kind, "step_id": step_id, "error": error }),
        );
        self.persist(&snapshot);
        self.remember_context(&snapshot);
    }

    async fn finish(&self, id: &str) {
        let snapshot = {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(id) else {
                return;
            };
            if workflow.status != WorkflowStatus::Running {
                return;
            }
            let unfinished = workflow
                .steps
                .iter()
                .filter(|step| !matches!(step.status, StepStatus::Success | StepStatus::Skipped))
                .map(|step| step.id.as_str())
                .collect::<Vec<_>>();
            if unfinished.is_empty() {
                workflow.status = WorkflowStatus::Completed;
            } else {
                workflow.status = WorkflowStatus::Failed;
                workflow.error = Some(format!("steps did not succeed: {}", unfinished.join(", ")));
            }
            workflow.completed_at = Some(Utc::now());
            workflow.clone()
        };

        let event = match snapshot.status {
            WorkflowStatus::Completed => "workflow.completed",
            _ => "workflow.failed",
        };
        tracing::info!(workflow_id = %id, status = %snapshot.status, "workflow finished");
        self.telemetry.emit(
            event,
            json!({ "workflow_id": id, "kind": snapshot.kind, "error": snapshot.error }),
        );
        self.persist(&snapshot);
        self.remember_context(&snapshot);
    }

    fn persist(&self, workflow: &Workflow) {
        if let Some(store) = &self.store
            && let Err(err) = store.save(workflow)
        {
            tracing::warn!(workflow_id = %workflow.id, error = %format!("{err:#}"), "failed to persist workflow");
        }
    }

    fn remember_context(&self, workflow: &Workflow) {
        if let Some(context) = &self.context
            && let Err(err) = context.save_workflow_context(&workflow.id, &workflow.context)
        {
            tracing::warn!(workflow_id = %workflow.id, error = %format!("{err:#}"), "failed to save workflow context");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;
    use crate::registry::{AgentHandler, AgentRecord, AgentStatus};
    use crate::workflow::builtin_templates;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Returns a fixed context update for every task.
    struct Produce(&'static str, Value);

    #[async_trait]
    impl AgentHandler for Produce {
        async fn handle(&self, task: &TaskRequest) -> Result<Value> {
            Ok(json!({
                "kind": task.kind,
                "seen_context": task.get("context").cloned().unwrap_or(Value::Null),
                "context_update": { self.0: self.1.clone() }
            }))
        }
    }

    /// Fails regular tasks, succeeds on rollback tasks.
    struct FailThenRollback;

    #[async_trait]
    impl AgentHandler for FailThenRollback {
        async fn handle(&self, task: &TaskRequest) -> Result<Value> {
            if task.kind == "rollback" {
                Ok(json!({ "rolled_back": true }))
            } else {
                Err(anyhow::anyhow!("patch did not apply"))
            }
        }
    }

    struct Failing;

    #[async_trait]
    impl AgentHandler for Failing {
        async fn handle(&self, _task: &TaskRequest) -> Result<Value> {
            Err(anyhow::anyhow!("agent exploded"))
        }
    }

    struct Slow(Duration, Arc<AtomicUsize>);

    #[async_trait]
    impl AgentHandler for Slow {
        async fn handle(&self, _task: &TaskRequest) -> Result<Value> {
            self.1.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.0).await;
            Ok(json!({}))
        }
    }

    async fn register(
        registry: &AgentRegistry,
        id: &str,
        caps: &[Capability],
        handler: Arc<dyn AgentHandler>,
    ) {
        let mut record = AgentRecord::new(id, id, "test", AgentKind::Research, caps);
        record.status = AgentStatus::Available;
        registry.register(record, Some(handler)).await;
    }

    fn orchestrator(registry: AgentRegistry) -> WorkflowOrchestrator {
        let templates = builtin_templates()
            .into_iter()
            .map(|template| (template.kind.clone(), template))
            .collect();
        WorkflowOrchestrator::new(registry, templates).with_settings(OrchestratorSettings {
            step_timeout: Duration::from_secs(5),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
            prefer_system: None,
        })
    }

    async fn document_registry() -> AgentRegistry {
        let registry = AgentRegistry::new();
        register(&registry, "research", &[Capability::Research], Arc::new(Produce("research_findings", json!(["a"])))).await;
        register(&registry, "compose", &[Capability::Compose], Arc::new(Produce("document", json!("# Doc")))).await;
        register(&registry, "review", &[Capability::Review], Arc::new(Produce("review", json!({ "approved": true })))).await;
        register(&registry, "publish", &[Capability::Publish], Arc::new(Produce("published_path", json!("out.md")))).await;
        registry
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let orchestrator = orchestrator(AgentRegistry::new());
        let err = orchestrator
            .create_workflow("make_coffee", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown workflow type: make_coffee");
        assert!(!orchestrator.start_workflow("nope").await);
    }

    #[tokio::test]
    async fn document_pipeline_completes_and_merges_context() {
        let orchestrator = orchestrator(document_registry().await);
        let id = orchestrator
            .create_workflow("full_document_pipeline", Map::new())
            .await
            .unwrap();
        assert!(orchestrator.start_workflow(&id).await);
        assert!(!orchestrator.start_workflow(&id).await);

        let report = orchestrator.wait_for(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert!(report.steps.iter().all(|step| step.status == StepStatus::Success));
        assert!(report.completed_at.is_some());

        let workflow = orchestrator.workflow(&id).await.unwrap();
        assert_eq!(workflow.context["document"], json!("# Doc"));
        assert_eq!(workflow.context["published_path"], json!("out.md"));
        // compose saw the research findings merged by the previous step
        assert_eq!(
            workflow.results["compose"]["seen_context"]["research_findings"],
            json!(["a"])
        );
        assert_eq!(orchestrator.running_count().await, 0);
    }

    #[tokio::test]
    async fn failed_step_without_rollback_fails_workflow() {
        let registry = AgentRegistry::new();
        register(&registry, "analyze", &[Capability::Analyze], Arc::new(Failing)).await;
        let orchestrator = orchestrator(registry);
        let id = orchestrator
            .create_workflow("code_review_and_improve", Map::new())
            .await
            .unwrap();
        orchestrator.start_workflow(&id).await;
        let report = orchestrator.wait_for(&id).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(
            report.error.as_deref(),
            Some("Step Analyze Code failed: agent exploded")
        );
        assert_eq!(report.steps[0].status, StepStatus::Failed);
        assert_eq!(report.steps[1].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn rollback_marks_step_rolled_back() {
        let registry = AgentRegistry::new();
        register(&registry, "analyze", &[Capability::Analyze], Arc::new(Produce("analysis", json!({})))).await;
        register(&registry, "fixer", &[Capability::Compose], Arc::new(FailThenRollback)).await;
        // The failing agent lands in Error, so the rollback needs a second composer.
        register(&registry, "fixer_2", &[Capability::Compose], Arc::new(FailThenRollback)).await;
        let orchestrator = orchestrator(registry);

        let mut context = Map::new();
        context.insert("issue".to_string(), json!("db down"));
        context.insert("backup_id".to_string(), json!("b-1"));
        let id = orchestrator.create_workflow("emergency_fix", context).await.unwrap();
        orchestrator.start_workflow(&id).await;
        let report = orchestrator.wait_for(&id).await.unwrap();

        assert_eq!(report.steps[0].status, StepStatus::Success);
        assert_eq!(report.steps[1].status, StepStatus::RolledBack);
        // a rolled-back step is not a success, so the workflow fails
        assert_eq!(report.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn timeouts_are_retried() {
        let registry = AgentRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        register(
            &registry,
            "slow",
            &[Capability::Analyze],
            Arc::new(Slow(Duration::from_millis(200), calls.clone())),
        )
        .await;
        let orchestrator = orchestrator(registry).with_settings(OrchestratorSettings {
            step_timeout: Duration::from_millis(20),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
            prefer_system: None,
        });
        let id = orchestrator
            .create_workflow("monitoring_to_docs", Map::new())
            .await
            .unwrap();
        orchestrator.start_workflow(&id).await;
        let report = orchestrator.wait_for(&id).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(report.steps[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(report.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_stops_a_running_workflow() {
        let registry = AgentRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        register(
            &registry,
            "slow",
            &[Capability::Analyze],
            Arc::new(Slow(Duration::from_secs(30), calls.clone())),
        )
        .await;
        let orchestrator = orchestrator(registry.clone());
        let id = orchestrator
            .create_workflow("monitoring_to_docs", Map::new())
            .await
            .unwrap();
        orchestrator.start_workflow(&id).await;
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(orchestrator.cancel_workflow(&id).await);
        assert!(!orchestrator.cancel_workflow(&id).await);
        let report = orchestrator.wait_for(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Cancelled);
        assert_eq!(report.steps[0].status, StepStatus::Failed);
        assert_eq!(report.steps[0].error.as_deref(), Some("cancelled"));

        // the aborted handler releases its agent
        for _ in 0..50 {
            if registry.agent("slow").await.unwrap().status == AgentStatus::Available {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.agent("slow").await.unwrap().status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn resume_reruns_only_unfinished_steps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = AgentRegistry::new();
        register(&registry, "analyze", &[Capability::Analyze], Arc::new(Produce("analysis", json!({})))).await;
        register(&registry, "review", &[Capability::Review], Arc::new(Failing)).await;
        let orchestrator =
            orchestrator(registry.clone()).with_store(WorkflowStore::new(dir.path().to_path_buf()));
        let id = orchestrator
            .create_workflow("code_review_and_improve", Map::new())
            .await
            .unwrap();
        orchestrator.start_workflow(&id).await;
        assert_eq!(orchestrator.wait_for(&id).await.unwrap().status, WorkflowStatus::Failed);

        register(&registry, "review", &[Capability::Review], Arc::new(Produce("review", json!({})))).await;
        register(&registry, "compose", &[Capability::Compose], Arc::new(Produce("document", json!("x")))).await;
        assert!(orchestrator.resume_workflow(&id).await.unwrap());
        let report = orchestrator.wait_for(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.steps[0].attempts, 1);
        assert_eq!(report.steps[1].attempts, 1);

        let err = orchestrator.resume_workflow(&id).await.unwrap_err();
        assert!(err.to_string().contains("already completed"));
    }

    #[tokio::test]
    async fn restore_marks_interrupted_workflows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkflowStore::new(dir.path().to_path_buf());
        let mut workflow = builtin_templates()[0].instantiate(Map::new());
        workflow.status = WorkflowStatus::Running;
        store.save(&workflow).unwrap();

        let orchestrator = orchestrator(AgentRegistry::new()).with_store(store);
        assert_eq!(orchestrator.restore_from_store().await.unwrap(), 1);
        let report = orchestrator.workflow_status(&workflow.id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("interrupted"));
        assert_eq!(orchestrator.list_workflows().await.len(), 1);
    }
}
