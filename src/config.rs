use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::AgentKind;
use crate::cli::Cli;
use crate::registry::Capability;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub state_dir: String,
    pub output_dir: String,
    pub agent_catalog_path: String,
    pub global_agent_catalog_path: Option<String>,
    pub workflow_catalog_path: String,
    pub prefer_system: Option<String>,
    pub step_timeout_secs: u64,
    pub step_retry_attempts: u32,
    pub step_retry_delay_ms: u64,
    pub command_timeout_secs: u64,
    pub auto_fix_threshold: f64,
    pub identity_file: Option<String>,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub show_sensitive_config: bool,
    pub health_interval_secs: u64,
    pub autosave_interval_secs: u64,
    pub server_auth_token: Option<String>,
}

impl RuntimeConfig {
    pub fn workflows_dir(&self) -> PathBuf {
        Path::new(&self.state_dir).join("workflows")
    }

    pub fn knowledge_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("knowledge.json")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub state_dir: Option<String>,
    pub output_dir: Option<String>,
    pub agent_catalog: Option<String>,
    pub workflow_catalog: Option<String>,
    pub prefer_system: Option<String>,
    pub step_timeout_secs: Option<u64>,
    pub step_retry_attempts: Option<u32>,
    pub step_retry_delay_ms: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub auto_fix_threshold: Option<f64>,
    pub identity_file: Option<String>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
    pub health_interval_secs: Option<u64>,
    pub autosave_interval_secs: Option<u64>,
    pub server_auth_token_env: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSource {
    Implicit,
    Global,
    Local,
}

impl AgentSource {
    pub fn label(self) -> &'static str {
        match self {
            AgentSource::Implicit => "implicit",
            AgentSource::Global => "global",
            AgentSource::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentFileConfig {
    pub name: Option<String>,
    pub system: Option<String>,
    pub kind: AgentKind,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub enabled: Option<bool>,
    pub command: Option<String>,
    pub timeout_secs: Option<u64>,
    pub fail_on_reject: Option<bool>,
    pub min_score: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentCatalogFile {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentFileConfig>,
}

/// A fully resolved agent declaration, ready for the agent factory.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub system: String,
    pub kind: AgentKind,
    pub capabilities: Vec<Capability>,
    pub enabled: bool,
    pub command: Option<String>,
    pub timeout_secs: Option<u64>,
    pub fail_on_reject: bool,
    pub min_score: Option<f64>,
    pub source: AgentSource,
}

impl AgentDefinition {
    pub fn builtin(id: &str, name: &str, system: &str, kind: AgentKind, caps: &[Capability]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            system: system.to_string(),
            kind,
            capabilities: caps.to_vec(),
            enabled: true,
            command: None,
            timeout_secs: None,
            fail_on_reject: false,
            min_score: None,
            source: AgentSource::Implicit,
        }
    }

    fn from_file(id: String, config: AgentFileConfig, source: AgentSource) -> Self {
        let capabilities = if config.capabilities.is_empty() {
            config.kind.default_capabilities().to_vec()
        } else {
            config.capabilities
        };
        Self {
            name: config.name.unwrap_or_else(|| id.clone()),
            id,
            system: config.system.unwrap_or_else(|| "galaxy".to_string()),
            kind: config.kind,
            capabilities,
            enabled: config.enabled.unwrap_or(true),
            command: config.command,
            timeout_secs: config.timeout_secs,
            fail_on_reject: config.fail_on_reject.unwrap_or(false),
            min_score: config.min_score,
            source,
        }
    }
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check field names and value types.",
            path.display()
        )
    })
}

pub fn default_global_agent_catalog() -> Option<String> {
    std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .map(|home| home.join(".galaxy/agents.toml").to_string_lossy().to_string())
}

pub fn load_agent_catalog_file(path: &Path) -> Result<AgentCatalogFile> {
    if !path.exists() {
        return Ok(AgentCatalogFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read agent catalog file at '{}'", path.display()))?;
    toml::from_str::<AgentCatalogFile>(&content).with_context(|| {
        format!(
            "invalid agent catalog configuration in '{}'. Check kind/capability names and field names.",
            path.display()
        )
    })
}

/// Agent set used when no catalog declares any agent: a documents-side
/// pipeline plus the galaxy-side research/review/compose trio.
pub fn implicit_agent_definitions() -> Vec<AgentDefinition> {
    use Capability::*;
    vec![
        AgentDefinition::builtin(
            "research_agent_docs",
            "ResearchAgent",
            "documents",
            AgentKind::Research,
            &[Research],
        ),
        AgentDefinition::builtin(
            "composer_agent_docs",
            "ComposerAgent",
            "documents",
            AgentKind::Compose,
            &[Compose],
        ),
        AgentDefinition::builtin(
            "reviewer_agent_docs",
            "ReviewerAgent",
            "documents",
            AgentKind::Review,
            &[Review],
        ),
        AgentDefinition::builtin(
            "publisher_agent_docs",
            "PublisherAgent",
            "documents",
            AgentKind::Publish,
            &[Publish],
        ),
        AgentDefinition::builtin(
            "analyzer_agent_docs",
            "AnalyzerAgent",
            "documents",
            AgentKind::Analyze,
            &[Analyze],
        ),
        AgentDefinition::builtin(
            "research_agent_galaxy",
            "ResearchAgent",
            "galaxy",
            AgentKind::Research,
            &[Research],
        ),
        AgentDefinition::builtin(
            "reviewer_agent_galaxy",
            "ReviewerAgent",
            "galaxy",
            AgentKind::Review,
            &[Review],
        ),
        AgentDefinition::builtin(
            "composer_agent_galaxy",
            "ComposerAgent",
            "galaxy",
            AgentKind::Compose,
            &[Compose],
        ),
        AgentDefinition::builtin(
            "memory_agent",
            "MemoryAgent",
            "galaxy",
            AgentKind::Memory,
            &[Memory],
        ),
    ]
}

/// Resolve agent definitions: global catalog first, local catalog entries
/// replace global ones with the same id. Falls back to the implicit set when
/// neither catalog declares an agent.
pub fn load_agent_definitions(cfg: &RuntimeConfig) -> Result<Vec<AgentDefinition>> {
    let mut resolved = BTreeMap::<String, AgentDefinition>::new();

    if let Some(global_path) = cfg.global_agent_catalog_path.as_ref() {
        let global = load_agent_catalog_file(Path::new(global_path))?;
        for (id, config) in global.agents {
            resolved.insert(
                id.clone(),
                AgentDefinition::from_file(id, config, AgentSource::Global),
            );
        }
    }

    let local = load_agent_catalog_file(Path::new(&cfg.agent_catalog_path))?;
    for (id, config) in local.agents {
        resolved.insert(
            id.clone(),
            AgentDefinition::from_file(id, config, AgentSource::Local),
        );
    }

    if resolved.is_empty() {
        return Ok(implicit_agent_definitions());
    }

    for definition in resolved.values() {
        if definition.kind == AgentKind::Command && definition.command.is_none() {
            return Err(anyhow::anyhow!(
                "agent '{}' has kind 'command' but no command configured",
                definition.id
            ));
        }
        if definition.capabilities.is_empty() {
            return Err(anyhow::anyhow!(
                "agent '{}' declares no capabilities in the agent catalog",
                definition.id
            ));
        }
    }

    Ok(resolved.into_values().collect())
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let auto_fix_threshold = cli
        .auto_fix_threshold
        .or(profile.auto_fix_threshold)
        .unwrap_or(0.7);
    if !(0.0..=1.0).contains(&auto_fix_threshold) {
        return Err(anyhow::anyhow!(
            "invalid value for auto_fix_threshold: {auto_fix_threshold} (expected 0.0..=1.0)"
        ));
    }

    let token_env = profile
        .server_auth_token_env
        .clone()
        .unwrap_or_else(|| "GALAXY_SERVER_TOKEN".to_string());
    let server_auth_token = std::env::var(&token_env)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let state_dir = cli
        .state_dir
        .clone()
        .or(profile.state_dir)
        .unwrap_or_else(|| ".galaxy/state".to_string());

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        output_dir: cli
            .output_dir
            .clone()
            .or(profile.output_dir)
            .unwrap_or_else(|| ".galaxy/output".to_string()),
        agent_catalog_path: cli
            .agent_catalog
            .clone()
            .or(profile.agent_catalog)
            .unwrap_or_else(|| ".galaxy/agents.toml".to_string()),
        global_agent_catalog_path: default_global_agent_catalog(),
        workflow_catalog_path: cli
            .workflow_catalog
            .clone()
            .or(profile.workflow_catalog)
            .unwrap_or_else(|| ".galaxy/workflows.toml".to_string()),
        prefer_system: cli
            .prefer_system
            .clone()
            .or(profile.prefer_system)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        step_timeout_secs: cli
            .step_timeout_secs
            .or(profile.step_timeout_secs)
            .unwrap_or(120)
            .max(1),
        step_retry_attempts: cli
            .step_retry_attempts
            .or(profile.step_retry_attempts)
            .unwrap_or(2)
            .max(1),
        step_retry_delay_ms: cli
            .step_retry_delay_ms
            .or(profile.step_retry_delay_ms)
            .unwrap_or(500),
        command_timeout_secs: profile.command_timeout_secs.unwrap_or(60).max(1),
        auto_fix_threshold,
        identity_file: cli.identity_file.clone().or(profile.identity_file),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".galaxy/telemetry/events.jsonl".to_string()),
        show_sensitive_config: cli.show_sensitive_config,
        health_interval_secs: profile.health_interval_secs.unwrap_or(30).max(1),
        autosave_interval_secs: profile.autosave_interval_secs.unwrap_or(300).max(1),
        server_auth_token,
        state_dir,
    })
}

pub fn display_path(cfg: &RuntimeConfig, path: &str) -> String {
    if cfg.show_sensitive_config {
        path.to_string()
    } else {
        crate::error::redact_home_paths(path)
    }
}
