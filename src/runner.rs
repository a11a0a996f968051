use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::CommandFactory;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use crate::cli::{
    AgentCommands, Cli, Commands, ContextCommands, ErrorCommands, OutputFormat, ProfileCommands,
    TelemetryCommands, WorkflowCommands, command_label,
};
use crate::config::{
    ProfilesFile, RuntimeConfig, display_path, load_agent_definitions, load_profiles,
    resolve_runtime_config,
};
use crate::context::ContextManager;
use crate::doctor::run_doctor;
use crate::error::categorize_error;
use crate::pipeline::{ErrorReport, ProcessedError};
use crate::profiles::{run_profiles_list, run_profiles_show};
use crate::registry::RegistryStatus;
use crate::server::run_server;
use crate::service::GalaxyService;
use crate::taxonomy::{assess_severity, detect_error_type};
use crate::telemetry::{TelemetrySink, run_telemetry_report};
use crate::workflow::{WorkflowStatus, WorkflowStatusReport, load_templates};

pub fn init_tracing(log_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let format = cli.format;

    let Some(command) = cli.command else {
        Cli::command()
            .print_help()
            .context("failed to print help")?;
        println!();
        return Ok(());
    };

    let telemetry = TelemetrySink::new(&cfg, command_label(&command));
    let started = Instant::now();
    let outcome = dispatch(command, &cfg, &profiles, format, telemetry.clone()).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    match &outcome {
        Ok(()) => telemetry.emit("command.completed", json!({ "duration_ms": duration_ms })),
        Err(err) => telemetry.emit(
            "command.failed",
            json!({
                "duration_ms": duration_ms,
                "category": categorize_error(err).code(),
                "error": format!("{err:#}"),
            }),
        ),
    }
    outcome
}

async fn dispatch(
    command: Commands,
    cfg: &RuntimeConfig,
    profiles: &ProfilesFile,
    format: OutputFormat,
    telemetry: TelemetrySink,
) -> Result<()> {
    match command {
        Commands::Agents { command } => run_agents(command, cfg, format, telemetry).await,
        Commands::Workflow { command } => run_workflow(command, cfg, format, telemetry).await,
        Commands::Errors { command } => run_errors(command, cfg, format, telemetry).await,
        Commands::Context { command } => run_context(command, cfg, format),
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(cfg, path, limit),
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(profiles, cfg),
            ProfileCommands::Show => run_profiles_show(cfg),
        },
        Commands::Doctor => run_doctor(cfg),
        Commands::Serve { host, port } => {
            let service = GalaxyService::boot(cfg, telemetry).await?;
            run_server(service, host, port).await
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON output")?;
    println!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// agents
// ---------------------------------------------------------------------------

fn print_registry_status(status: &RegistryStatus) {
    println!("Agents: {}", status.total_agents);
    for agent in &status.agents {
        let capabilities = agent
            .capabilities
            .iter()
            .map(|capability| capability.as_str())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "- {:<20} system={:<10} status={:<12} load={} tasks={} errors={} caps={}",
            agent.id,
            agent.system,
            agent.status.as_str(),
            agent.load,
            agent.task_count,
            agent.error_count,
            capabilities
        );
    }
    let by_status = status
        .by_status
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("By status: {by_status}");
}

async fn run_agents(
    command: AgentCommands,
    cfg: &RuntimeConfig,
    format: OutputFormat,
    telemetry: TelemetrySink,
) -> Result<()> {
    let service = GalaxyService::boot(cfg, telemetry).await?;
    let registry = &service.registry;

    match command {
        AgentCommands::List => {
            let status = registry.status().await;
            match format {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Text => print_registry_status(&status),
            }
        }
        AgentCommands::Show { id } => {
            let record = registry
                .agent(&id)
                .await
                .ok_or_else(|| anyhow::anyhow!("Unknown agent: {id}"))?;
            let definition = load_agent_definitions(cfg)?
                .into_iter()
                .find(|definition| definition.id == id);
            match format {
                OutputFormat::Json => print_json(&json!({
                    "agent": record,
                    "source": definition.as_ref().map(|definition| definition.source.label()),
                    "command": definition.as_ref().and_then(|definition| definition.command.clone()),
                }))?,
                OutputFormat::Text => {
                    println!("Agent: {} ({})", record.id, record.name);
                    println!("System: {}", record.system);
                    println!("Kind: {}", record.kind.label());
                    println!("Status: {}", record.status.as_str());
                    println!(
                        "Capabilities: {}",
                        record
                            .capabilities
                            .iter()
                            .map(|capability| capability.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    println!(
                        "Tasks: {} (errors={}, load={})",
                        record.task_count, record.error_count, record.load
                    );
                    if let Some(definition) = &definition {
                        println!("Source: {}", definition.source.label());
                        if let Some(command) = &definition.command {
                            println!("Command: {command}");
                        }
                    }
                }
            }
        }
        AgentCommands::Health => {
            registry.health_check().await;
            let status = registry.status().await;
            match format {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Text => print_registry_status(&status),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// workflow
// ---------------------------------------------------------------------------

/// Build a workflow context from `--context-json` and `--set KEY=VALUE`
/// pairs. `--set` wins on conflicts; values that parse as JSON are kept
/// typed, anything else is a string.
pub fn parse_context_args(set: &[String], context_json: Option<&str>) -> Result<Map<String, Value>> {
    let mut context = match context_json {
        Some(raw) => match serde_json::from_str::<Value>(raw)
            .context("--context-json is not valid JSON")?
        {
            Value::Object(map) => map,
            _ => return Err(anyhow::anyhow!("--context-json must be a JSON object")),
        },
        None => Map::new(),
    };

    for pair in set {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(anyhow::anyhow!(
                "invalid --set '{pair}': expected KEY=VALUE"
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow::anyhow!(
                "invalid --set '{pair}': expected KEY=VALUE"
            ));
        }
        let value = match serde_json::from_str::<Value>(value) {
            Ok(parsed @ (Value::Number(_) | Value::Bool(_) | Value::Array(_) | Value::Object(_))) => {
                parsed
            }
            _ => Value::String(value.to_string()),
        };
        context.insert(key.to_string(), value);
    }
    Ok(context)
}

fn print_workflow_report(report: &WorkflowStatusReport) {
    println!("Workflow: {} ({})", report.id, report.name);
    println!("Kind: {}", report.kind);
    println!("Status: {}", report.status);
    for step in &report.steps {
        let attempts = if step.attempts > 1 {
            format!(" attempts={}", step.attempts)
        } else {
            String::new()
        };
        match &step.error {
            Some(error) => println!("- {} [{}]{attempts}: {error}", step.name, step.status),
            None => println!("- {} [{}]{attempts}", step.name, step.status),
        }
    }
    if let Some(error) = &report.error {
        println!("Error: {error}");
    }
}

fn emit_workflow_report(report: &WorkflowStatusReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Text => {
            print_workflow_report(report);
            Ok(())
        }
    }
}

fn ensure_completed(report: &WorkflowStatusReport) -> Result<()> {
    if report.status == WorkflowStatus::Completed {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "workflow {} finished with status {}: {}",
        report.id,
        report.status,
        report.error.as_deref().unwrap_or("no error recorded")
    ))
}

async fn run_workflow(
    command: WorkflowCommands,
    cfg: &RuntimeConfig,
    format: OutputFormat,
    telemetry: TelemetrySink,
) -> Result<()> {
    if let WorkflowCommands::Templates = command {
        let templates = load_templates(Path::new(&cfg.workflow_catalog_path))?;
        return match format {
            OutputFormat::Json => print_json(&templates.values().collect::<Vec<_>>()),
            OutputFormat::Text => {
                println!("Workflow templates:");
                for template in templates.values() {
                    let origin = if template.builtin { "built-in" } else { "catalog" };
                    println!(
                        "- {:<26} {} ({} steps, {origin})",
                        template.kind,
                        template.name,
                        template.steps.len()
                    );
                    if let Some(description) = &template.description {
                        println!("    {description}");
                    }
                }
                Ok(())
            }
        };
    }

    let service = GalaxyService::boot(cfg, telemetry).await?;
    let orchestrator = &service.orchestrator;

    match command {
        WorkflowCommands::Templates => {}
        WorkflowCommands::Run {
            kind,
            set,
            context_json,
        } => {
            let context = parse_context_args(&set, context_json.as_deref())?;
            let id = orchestrator.create_workflow(kind.trim(), context).await?;
            tracing::info!(workflow = %id, kind = %kind, "workflow created");
            if !orchestrator.start_workflow(&id).await {
                return Err(anyhow::anyhow!("workflow {id} could not be started"));
            }
            let report = orchestrator
                .wait_for(&id)
                .await
                .ok_or_else(|| anyhow::anyhow!("Unknown workflow: {id}"))?;
            service.shutdown()?;
            emit_workflow_report(&report, format)?;
            ensure_completed(&report)?;
        }
        WorkflowCommands::Status { id } => {
            let report = orchestrator
                .workflow_status(&id)
                .await
                .ok_or_else(|| anyhow::anyhow!("Unknown workflow: {id}"))?;
            emit_workflow_report(&report, format)?;
        }
        WorkflowCommands::List => {
            let workflows = orchestrator.list_workflows().await;
            match format {
                OutputFormat::Json => print_json(&workflows)?,
                OutputFormat::Text => {
                    if workflows.is_empty() {
                        println!("No stored workflows in {}.", cfg.workflows_dir().display());
                    }
                    for summary in workflows {
                        println!(
                            "- {} {:<24} {:<10} {}/{} steps (created {})",
                            summary.id,
                            summary.kind,
                            summary.status.as_str(),
                            summary.steps_done,
                            summary.steps_total,
                            summary.created_at
                        );
                    }
                }
            }
        }
        WorkflowCommands::Resume { id } => {
            if !orchestrator.resume_workflow(&id).await? {
                return Err(anyhow::anyhow!("workflow {id} could not be resumed"));
            }
            let report = orchestrator
                .wait_for(&id)
                .await
                .ok_or_else(|| anyhow::anyhow!("Unknown workflow: {id}"))?;
            service.shutdown()?;
            emit_workflow_report(&report, format)?;
            ensure_completed(&report)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// errors
// ---------------------------------------------------------------------------

fn print_processed_error(processed: &ProcessedError, cfg: &RuntimeConfig) {
    let context = &processed.error_context;
    println!("Error type: {}", context.error_type.as_str());
    println!("Severity: {}", context.severity.as_str());
    match (&context.file_path, context.line_number) {
        (Some(file), Some(line)) => println!("Location: {file}:{line}"),
        (Some(file), None) => println!("Location: {file}"),
        _ => println!("Location: unknown"),
    }
    println!(
        "Fix: {} (confidence {:.2}, impact {})",
        processed.fix.fix_type, processed.fix.confidence, processed.fix.estimated_impact
    );
    println!("  {}", processed.fix.description);
    println!("Applied: {}", processed.applied);
    if let Some(snapshot) = &processed.snapshot_id {
        println!("Snapshot: {snapshot}");
    }
    if let Some(report) = &processed.report {
        println!("Report: {}", display_path(cfg, report));
    }
}

async fn run_errors(
    command: ErrorCommands,
    cfg: &RuntimeConfig,
    format: OutputFormat,
    telemetry: TelemetrySink,
) -> Result<()> {
    match command {
        ErrorCommands::Classify { message } => {
            let message = message.join(" ");
            let error_type = detect_error_type(&message);
            let severity = assess_severity(error_type, &message);
            match format {
                OutputFormat::Json => print_json(&json!({
                    "type": error_type,
                    "severity": severity,
                    "probable_cause": error_type.probable_cause(),
                    "suggestions": error_type.suggestions(),
                    "fix_kind": error_type.fix_kind(),
                    "impact": severity.impact(),
                }))?,
                OutputFormat::Text => {
                    println!("Type: {}", error_type.as_str());
                    println!("Severity: {} ({})", severity.as_str(), severity.impact());
                    println!("Probable cause: {}", error_type.probable_cause());
                    println!("Suggested fix kind: {}", error_type.fix_kind());
                    for suggestion in error_type.suggestions() {
                        println!("- {suggestion}");
                    }
                }
            }
            Ok(())
        }
        ErrorCommands::Process {
            message,
            file_path,
            line_number,
            stack_trace_file,
            source,
            auto_fix,
        } => {
            let stack_trace = stack_trace_file
                .map(|path| {
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read stack trace file '{path}'"))
                })
                .transpose()?;
            let report = ErrorReport {
                message,
                file_path,
                line_number,
                stack_trace,
                source,
                additional_info: Map::new(),
            };
            if report.message.trim().is_empty() {
                return Err(anyhow::anyhow!("--message cannot be empty"));
            }

            let service = GalaxyService::boot(cfg, telemetry).await?;
            let processed = service.pipeline.process_error(&report, auto_fix).await?;
            service.shutdown()?;
            match format {
                OutputFormat::Json => print_json(&processed)?,
                OutputFormat::Text => print_processed_error(&processed, cfg),
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// context
// ---------------------------------------------------------------------------

fn open_context(cfg: &RuntimeConfig) -> Result<ContextManager> {
    let context = ContextManager::open(Path::new(&cfg.state_dir))?;
    context.restore_last_session()?;
    if let Some(identity_file) = &cfg.identity_file {
        context.load_identity_file(Path::new(identity_file))?;
    }
    Ok(context)
}

fn run_context(command: ContextCommands, cfg: &RuntimeConfig, format: OutputFormat) -> Result<()> {
    let context = open_context(cfg)?;

    match command {
        ContextCommands::Snapshot {
            workflow_id,
            step_id,
        } => {
            let snapshot = context.create_snapshot(&workflow_id, step_id.as_deref())?;
            context.persist_all()?;
            match format {
                OutputFormat::Json => print_json(&snapshot)?,
                OutputFormat::Text => println!(
                    "Snapshot {} created for workflow {} ({} knowledge entries)",
                    snapshot.id,
                    snapshot.workflow_id,
                    snapshot.knowledge.len()
                ),
            }
        }
        ContextCommands::Checkpoint => {
            let id = context.persist_all()?;
            match format {
                OutputFormat::Json => print_json(&json!({ "checkpoint": id }))?,
                OutputFormat::Text => println!("Checkpoint {id} written to {}", display_path(cfg, &cfg.state_dir)),
            }
        }
        ContextCommands::Restore { id } => {
            if !context.restore_checkpoint(&id)? {
                return Err(anyhow::anyhow!("checkpoint '{id}' not found"));
            }
            let persisted = context.persist_all()?;
            match format {
                OutputFormat::Json => {
                    print_json(&json!({ "restored": id, "checkpoint": persisted }))?
                }
                OutputFormat::Text => {
                    println!("Context restored from checkpoint {id} (saved as {persisted})")
                }
            }
        }
        ContextCommands::Identity => {
            let identity = context.identity();
            match format {
                OutputFormat::Json => print_json(&identity)?,
                OutputFormat::Text => {
                    println!("Id: {}", identity.id);
                    println!("Frequency: {}", identity.frequency);
                    println!("Session: {}", identity.session);
                    println!("Mission: {}", identity.mission);
                }
            }
        }
        ContextCommands::Search { query, limit } => {
            let matches = context.search(&query.join(" "), limit);
            match format {
                OutputFormat::Json => print_json(&matches)?,
                OutputFormat::Text => {
                    if matches.is_empty() {
                        println!("No matching snapshots.");
                    }
                    for found in matches {
                        println!(
                            "- {} workflow={} step={} score={}",
                            found.id,
                            found.workflow_id,
                            found.step_id.as_deref().unwrap_or("-"),
                            found.score
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_pairs_override_context_json_and_keep_types() {
        let context = parse_context_args(
            &[
                "topic=Release notes".to_string(),
                "retries=3".to_string(),
                "draft=true".to_string(),
            ],
            Some(r#"{"topic":"old","backup_id":"b-1"}"#),
        )
        .expect("context should parse");

        assert_eq!(context["topic"], json!("Release notes"));
        assert_eq!(context["retries"], json!(3));
        assert_eq!(context["draft"], json!(true));
        assert_eq!(context["backup_id"], json!("b-1"));
    }

    #[test]
    fn set_pair_without_equals_is_rejected() {
        let err = parse_context_args(&["topic".to_string()], None).expect_err("should fail");
        assert!(err.to_string().contains("expected KEY=VALUE"));
    }

    #[test]
    fn context_json_must_be_an_object() {
        let err = parse_context_args(&[], Some("[1,2]")).expect_err("should fail");
        assert!(err.to_string().contains("must be a JSON object"));
    }
}
