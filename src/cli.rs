use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommands {
    #[command(about = "List registered agents with status and load counters")]
    List,
    #[command(about = "Show one agent definition and its runtime state")]
    Show {
        #[arg(long)]
        id: String,
    },
    #[command(about = "Run health checks on every agent and print the registry status")]
    Health,
}

#[derive(Debug, Subcommand)]
pub enum WorkflowCommands {
    #[command(about = "List built-in and catalog workflow templates")]
    Templates,
    #[command(about = "Create a workflow, run it to completion, and print its status")]
    Run {
        kind: String,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        #[arg(long)]
        context_json: Option<String>,
    },
    #[command(about = "Show the status of a stored workflow")]
    Status { id: String },
    #[command(about = "List stored workflows")]
    List,
    #[command(about = "Resume a failed, cancelled, or interrupted workflow from its checkpoint")]
    Resume { id: String },
}

#[derive(Debug, Subcommand)]
pub enum ErrorCommands {
    #[command(about = "Classify an error, generate a fix, and optionally apply it")]
    Process {
        #[arg(long)]
        message: String,
        #[arg(long)]
        file_path: Option<String>,
        #[arg(long)]
        line_number: Option<u32>,
        #[arg(long)]
        stack_trace_file: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = false)]
        auto_fix: bool,
    },
    #[command(about = "Classify an error message without running agents")]
    Classify {
        #[arg(required = true)]
        message: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ContextCommands {
    #[command(about = "Create a memory snapshot for a workflow/step key")]
    Snapshot {
        #[arg(long)]
        workflow_id: String,
        #[arg(long)]
        step_id: Option<String>,
    },
    #[command(about = "Write a checkpoint of the full context")]
    Checkpoint,
    #[command(about = "Restore the context from a checkpoint id")]
    Restore { id: String },
    #[command(about = "Print the configured identity block")]
    Identity,
    #[command(about = "Search stored snapshots by keyword overlap")]
    Search {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  galaxy-bridge agents list\n\
  galaxy-bridge agents health\n\
  galaxy-bridge workflow templates\n\
  galaxy-bridge workflow run full_document_pipeline --set topic=\"Release notes\"\n\
  galaxy-bridge workflow run emergency_fix --context-json '{\"issue\":\"db down\",\"backup_id\":\"b-17\"}'\n\
  galaxy-bridge workflow status 5b0c...\n\
  galaxy-bridge workflow resume 5b0c...\n\
  galaxy-bridge errors process --message \"KeyError: 'user'\" --file-path app.py --line-number 12\n\
  galaxy-bridge errors classify \"ModuleNotFoundError: No module named yaml\"\n\
  galaxy-bridge context checkpoint\n\
  galaxy-bridge telemetry report --limit 2000\n\
  galaxy-bridge serve --host 127.0.0.1 --port 8765\n\
\n\
Configuration:\n\
  - Profiles live in .galaxy/config.toml under [profiles.<name>].\n\
  - Agents are declared in .galaxy/agents.toml (local) or ~/.galaxy/agents.toml (global).\n\
  - Extra workflow templates are read from .galaxy/workflows.toml.";

#[derive(Debug, Parser)]
#[command(name = "galaxy-bridge")]
#[command(about = "Agent registry, workflow orchestrator, and error pipeline")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "GALAXY_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "GALAXY_CONFIG", default_value = ".galaxy/config.toml")]
    pub config_path: String,

    #[arg(long, env = "GALAXY_STATE_DIR")]
    pub state_dir: Option<String>,

    #[arg(long, env = "GALAXY_OUTPUT_DIR")]
    pub output_dir: Option<String>,

    #[arg(long, env = "GALAXY_AGENT_CATALOG")]
    pub agent_catalog: Option<String>,

    #[arg(long, env = "GALAXY_WORKFLOW_CATALOG")]
    pub workflow_catalog: Option<String>,

    #[arg(long, env = "GALAXY_PREFER_SYSTEM")]
    pub prefer_system: Option<String>,

    #[arg(long, env = "GALAXY_STEP_TIMEOUT_SECS")]
    pub step_timeout_secs: Option<u64>,

    #[arg(long, env = "GALAXY_STEP_RETRY_ATTEMPTS")]
    pub step_retry_attempts: Option<u32>,

    #[arg(long, env = "GALAXY_STEP_RETRY_DELAY_MS")]
    pub step_retry_delay_ms: Option<u64>,

    #[arg(long, env = "GALAXY_AUTO_FIX_THRESHOLD")]
    pub auto_fix_threshold: Option<f64>,

    #[arg(long, env = "GALAXY_IDENTITY_FILE")]
    pub identity_file: Option<String>,

    #[arg(long, env = "GALAXY_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "GALAXY_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "GALAXY_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Inspect the agent registry")]
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
    #[command(about = "Create, run, inspect, and resume workflows")]
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    #[command(about = "Run the error pipeline")]
    Errors {
        #[command(subcommand)]
        command: ErrorCommands,
    },
    #[command(about = "Manage context snapshots and checkpoints")]
    Context {
        #[command(subcommand)]
        command: ContextCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Validate configuration, catalogs, and state directories")]
    Doctor,
    #[command(about = "Run the integrated service: HTTP API, health checks, and autosave")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8765)]
        port: u16,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Agents { command } => match command {
            AgentCommands::List => "agents.list".to_string(),
            AgentCommands::Show { .. } => "agents.show".to_string(),
            AgentCommands::Health => "agents.health".to_string(),
        },
        Commands::Workflow { command } => match command {
            WorkflowCommands::Templates => "workflow.templates".to_string(),
            WorkflowCommands::Run { kind, .. } => format!("workflow.run.{kind}"),
            WorkflowCommands::Status { .. } => "workflow.status".to_string(),
            WorkflowCommands::List => "workflow.list".to_string(),
            WorkflowCommands::Resume { .. } => "workflow.resume".to_string(),
        },
        Commands::Errors { command } => match command {
            ErrorCommands::Process { .. } => "errors.process".to_string(),
            ErrorCommands::Classify { .. } => "errors.classify".to_string(),
        },
        Commands::Context { command } => match command {
            ContextCommands::Snapshot { .. } => "context.snapshot".to_string(),
            ContextCommands::Checkpoint => "context.checkpoint".to_string(),
            ContextCommands::Restore { .. } => "context.restore".to_string(),
            ContextCommands::Identity => "context.identity".to_string(),
            ContextCommands::Search { .. } => "context.search".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Doctor => "doctor".to_string(),
        Commands::Serve { .. } => "serve".to_string(),
    }
}
