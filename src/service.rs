use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::agents::AgentFactory;
use crate::checkpoint::WorkflowStore;
use crate::config::{RuntimeConfig, load_agent_definitions};
use crate::context::ContextManager;
use crate::orchestrator::{OrchestratorSettings, WorkflowOrchestrator};
use crate::pipeline::ErrorPipeline;
use crate::registry::AgentRegistry;
use crate::telemetry::TelemetrySink;
use crate::workflow::load_templates;

/// Everything a command or the server needs, wired together once.
#[derive(Clone)]
pub struct GalaxyService {
    pub cfg: RuntimeConfig,
    pub context: Arc<ContextManager>,
    pub registry: AgentRegistry,
    pub orchestrator: WorkflowOrchestrator,
    pub pipeline: Arc<ErrorPipeline>,
    pub telemetry: TelemetrySink,
}

impl GalaxyService {
    pub async fn boot(cfg: &RuntimeConfig, telemetry: TelemetrySink) -> Result<Self> {
        let context = Arc::new(ContextManager::open(Path::new(&cfg.state_dir))?);
        match context.restore_last_session() {
            Ok(true) => tracing::info!("restored last session"),
            Ok(false) => tracing::debug!("no previous session to restore"),
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "failed to restore last session"),
        }
        if let Some(identity_file) = &cfg.identity_file {
            let loaded = context
                .load_identity_file(Path::new(identity_file))
                .with_context(|| format!("failed to load identity file '{identity_file}'"))?;
            tracing::info!(entries = loaded, "identity loaded");
        }

        let definitions = load_agent_definitions(cfg)?;
        let registry = AgentRegistry::new();
        let factory = AgentFactory::new(cfg, Some(context.clone()));
        registry.initialize_all(&factory, &definitions).await;

        let templates = load_templates(Path::new(&cfg.workflow_catalog_path))?;
        let orchestrator = WorkflowOrchestrator::new(registry.clone(), templates)
            .with_store(WorkflowStore::new(cfg.workflows_dir()))
            .with_settings(OrchestratorSettings::from_config(cfg))
            .with_telemetry(telemetry.clone())
            .with_context(context.clone());
        orchestrator
            .restore_from_store()
            .await
            .context("failed to load workflow store")?;

        let pipeline = ErrorPipeline::new(registry.clone())
            .with_context(context.clone())
            .with_telemetry(telemetry.clone())
            .with_auto_fix_threshold(cfg.auto_fix_threshold)
            .with_task_timeout(Duration::from_secs(cfg.step_timeout_secs))
            .with_prefer_system(cfg.prefer_system.clone());

        Ok(Self {
            cfg: cfg.clone(),
            context,
            registry,
            orchestrator,
            pipeline: Arc::new(pipeline),
            telemetry,
        })
    }

    /// Periodic registry health checks and context autosave.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let registry = self.registry.clone();
        let health_every = Duration::from_secs(self.cfg.health_interval_secs);
        let health = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.health_check().await;
                tracing::debug!("registry health check complete");
            }
        });

        let context = self.context.clone();
        let autosave_every = Duration::from_secs(self.cfg.autosave_interval_secs);
        let autosave = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(autosave_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match context.persist_all() {
                    Ok(checkpoint) => tracing::debug!(checkpoint = %checkpoint, "context autosaved"),
                    Err(err) => tracing::warn!(error = %format!("{err:#}"), "context autosave failed"),
                }
            }
        });

        BackgroundTasks {
            handles: vec![health, autosave],
        }
    }

    pub fn shutdown(&self) -> Result<String> {
        let checkpoint = self
            .context
            .persist_all()
            .context("failed to persist context on shutdown")?;
        tracing::info!(checkpoint = %checkpoint, "context persisted");
        Ok(checkpoint)
    }
}

pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn abort_all(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}
