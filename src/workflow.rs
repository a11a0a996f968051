use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::registry::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Rollback,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Rollback => "rollback",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    RolledBack,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub capability: Capability,
    pub task: Map<String, Value>,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub rollback_task: Option<Map<String, Value>>,
    #[serde(default)]
    pub attempts: u32,
}

impl WorkflowStep {
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        self.attempts = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub results: Map<String, Value>,
}

impl Workflow {
    /// A dependency is satisfied only by a step that finished successfully.
    pub fn dependencies_met(&self, step: &WorkflowStep) -> bool {
        step.dependencies.iter().all(|dep| {
            self.steps
                .iter()
                .any(|candidate| candidate.id == *dep && candidate.status == StepStatus::Success)
        })
    }

    pub fn status_report(&self) -> WorkflowStatusReport {
        WorkflowStatusReport {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            status: self.status,
            created_at: self.created_at.to_rfc3339(),
            started_at: self.started_at.map(|ts| ts.to_rfc3339()),
            completed_at: self.completed_at.map(|ts| ts.to_rfc3339()),
            steps: self
                .steps
                .iter()
                .map(|step| StepReport {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    status: step.status,
                    error: step.error.clone(),
                    attempts: step.attempts,
                })
                .collect(),
            results: self.results.clone(),
            error: self.error.clone(),
        }
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            status: self.status,
            created_at: self.created_at.to_rfc3339(),
            steps_done: self
                .steps
                .iter()
                .filter(|step| step.status == StepStatus::Success)
                .count(),
            steps_total: self.steps.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusReport {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub status: WorkflowStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub steps: Vec<StepReport>,
    pub results: Map<String, Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub status: WorkflowStatus,
    pub created_at: String,
    pub steps_done: usize,
    pub steps_total: usize,
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepTemplate {
    pub id: String,
    pub name: Option<String>,
    pub capability: Capability,
    #[serde(default)]
    pub task: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub rollback_task: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowTemplate {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Values used for `{key}` placeholders the workflow context leaves unset.
    #[serde(default)]
    pub defaults: Map<String, Value>,
    pub steps: Vec<StepTemplate>,
    #[serde(skip)]
    pub builtin: bool,
}

/// Replace whole-string `{key}` placeholders with context values (falling
/// back to template defaults, then null). Other strings are left alone.
fn render_value(value: &Value, context: &Map<String, Value>, defaults: &Map<String, Value>) -> Value {
    match value {
        Value::String(text) => {
            let key = text
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .filter(|key| !key.is_empty() && !key.contains(['{', '}', ' ']));
            match key {
                Some(key) => context
                    .get(key)
                    .filter(|value| !value.is_null())
                    .or_else(|| defaults.get(key))
                    .cloned()
                    .unwrap_or(Value::Null),
                None => value.clone(),
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, context, defaults))
                .collect(),
        ),
        Value::Object(map) => Value::Object(render_map(map, context, defaults)),
        other => other.clone(),
    }
}

fn render_map(
    map: &Map<String, Value>,
    context: &Map<String, Value>,
    defaults: &Map<String, Value>,
) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), render_value(value, context, defaults)))
        .collect()
}

impl WorkflowTemplate {
    pub fn instantiate(&self, mut context: Map<String, Value>) -> Workflow {
        let steps = self
            .steps
            .iter()
            .map(|step| WorkflowStep {
                id: step.id.clone(),
                name: step.name.clone().unwrap_or_else(|| step.id.clone()),
                capability: step.capability,
                task: render_map(&step.task, &context, &self.defaults),
                status: StepStatus::Pending,
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
                dependencies: step.dependencies.clone(),
                rollback_task: step
                    .rollback_task
                    .as_ref()
                    .map(|task| render_map(task, &context, &self.defaults)),
                attempts: 0,
            })
            .collect();

        for (key, value) in &self.defaults {
            context.entry(key.clone()).or_insert_with(|| value.clone());
        }

        Workflow {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            status: WorkflowStatus::Pending,
            steps,
            context,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            results: Map::new(),
        }
    }

    /// Step ids are unique and every dependency names an earlier step, which
    /// also rules out cycles.
    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(anyhow::anyhow!("workflow template kind cannot be empty"));
        }
        if self.steps.is_empty() {
            return Err(anyhow::anyhow!(
                "workflow template '{}' declares no steps",
                self.kind
            ));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(anyhow::anyhow!(
                        "workflow template '{}': step '{}' depends on '{}', which is not an earlier step",
                        self.kind,
                        step.id,
                        dep
                    ));
                }
            }
            if !seen.insert(step.id.as_str()) {
                return Err(anyhow::anyhow!(
                    "workflow template '{}': duplicate step id '{}'",
                    self.kind,
                    step.id
                ));
            }
        }
        Ok(())
    }
}

fn step(
    id: &str,
    name: &str,
    capability: Capability,
    task: Value,
    dependencies: &[&str],
) -> StepTemplate {
    StepTemplate {
        id: id.to_string(),
        name: Some(name.to_string()),
        capability,
        task: task.as_object().cloned().unwrap_or_default(),
        dependencies: dependencies.iter().map(|dep| dep.to_string()).collect(),
        rollback_task: None,
    }
}

fn builtin(kind: &str, name: &str, description: &str, defaults: Value, steps: Vec<StepTemplate>) -> WorkflowTemplate {
    WorkflowTemplate {
        kind: kind.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        defaults: defaults.as_object().cloned().unwrap_or_default(),
        steps,
        builtin: true,
    }
}

pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    use Capability::*;

    let mut quick_fix = step(
        "quick_fix",
        "Apply Quick Fix",
        Compose,
        json!({ "type": "compose", "template": "emergency_fix" }),
        &["emergency_analysis"],
    );
    quick_fix.rollback_task = json!({ "type": "rollback", "restore_point": "{backup_id}" })
        .as_object()
        .cloned();

    vec![
        builtin(
            "full_document_pipeline",
            "Full Document Pipeline",
            "Research a topic, compose a document, review it, and publish it",
            json!({
                "topic": "Documentation topic",
                "template": "default",
                "standards": ["ISO27001"],
                "channels": ["local"],
            }),
            vec![
                step(
                    "research",
                    "Research Topic",
                    Research,
                    json!({ "type": "research", "query": "{topic}" }),
                    &[],
                ),
                step(
                    "compose",
                    "Compose Document",
                    Compose,
                    json!({ "type": "compose", "template": "{template}" }),
                    &["research"],
                ),
                step(
                    "review",
                    "Review Document",
                    Review,
                    json!({ "type": "review", "standards": "{standards}" }),
                    &["compose"],
                ),
                step(
                    "publish",
                    "Publish Document",
                    Publish,
                    json!({ "type": "publish", "channels": "{channels}" }),
                    &["review"],
                ),
            ],
        ),
        builtin(
            "error_analysis_and_fix",
            "Error Analysis and Fix",
            "Analyze an error, research a fix, compose it, and review it",
            json!({}),
            vec![
                step(
                    "analyze_error",
                    "Analyze Error",
                    Analyze,
                    json!({ "type": "analyze", "error": "{error}", "file_path": "{file_path}" }),
                    &[],
                ),
                step(
                    "research_fix",
                    "Research Fix",
                    Research,
                    json!({ "type": "research", "query": "fix for error" }),
                    &["analyze_error"],
                ),
                step(
                    "compose_fix",
                    "Compose Fix",
                    Compose,
                    json!({ "type": "compose", "template": "code_fix" }),
                    &["research_fix"],
                ),
                step(
                    "review_fix",
                    "Review Fix",
                    Review,
                    json!({ "type": "review", "check_type": "code_quality" }),
                    &["compose_fix"],
                ),
            ],
        ),
        builtin(
            "code_review_and_improve",
            "Code Review and Improve",
            "Analyze a file, review it for security, and compose improvements",
            json!({}),
            vec![
                step(
                    "analyze_code",
                    "Analyze Code",
                    Analyze,
                    json!({ "type": "analyze", "file_path": "{file_path}", "analysis_type": "quality" }),
                    &[],
                ),
                step(
                    "review_security",
                    "Security Review",
                    Review,
                    json!({ "type": "review", "check_type": "security" }),
                    &["analyze_code"],
                ),
                step(
                    "compose_improvements",
                    "Compose Improvements",
                    Compose,
                    json!({ "type": "compose", "template": "code_improvements" }),
                    &["review_security"],
                ),
            ],
        ),
        builtin(
            "monitoring_to_docs",
            "Monitoring to Documentation",
            "Summarize metrics into a report and publish it",
            json!({}),
            vec![
                step(
                    "analyze_metrics",
                    "Analyze Metrics",
                    Analyze,
                    json!({ "type": "analyze", "metrics": "{metrics}", "analysis_type": "performance" }),
                    &[],
                ),
                step(
                    "compose_report",
                    "Compose Report",
                    Compose,
                    json!({ "type": "compose", "template": "monitoring_report" }),
                    &["analyze_metrics"],
                ),
                step(
                    "publish_report",
                    "Publish Report",
                    Publish,
                    json!({ "type": "publish", "channels": ["git", "slack"] }),
                    &["compose_report"],
                ),
            ],
        ),
        builtin(
            "emergency_fix",
            "Emergency Fix",
            "Critical analysis followed by a quick fix with rollback",
            json!({}),
            vec![
                step(
                    "emergency_analysis",
                    "Emergency Analysis",
                    Analyze,
                    json!({ "type": "analyze", "priority": "critical", "issue": "{issue}" }),
                    &[],
                ),
                quick_fix,
            ],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowCatalogFile {
    #[serde(default)]
    pub workflows: Vec<WorkflowTemplate>,
}

pub fn parse_workflow_catalog(content: &str, origin: &str) -> Result<Vec<WorkflowTemplate>> {
    let catalog = toml::from_str::<WorkflowCatalogFile>(content).with_context(|| {
        format!(
            "invalid workflow catalog in '{origin}'. Check step fields and capability names."
        )
    })?;
    for template in &catalog.workflows {
        template
            .validate()
            .with_context(|| format!("invalid workflow catalog in '{origin}'"))?;
    }
    Ok(catalog.workflows)
}

/// Built-in templates plus any catalog templates. Catalog kinds must not
/// collide with built-ins or with each other.
pub fn load_templates(catalog_path: &Path) -> Result<BTreeMap<String, WorkflowTemplate>> {
    let mut templates = builtin_templates()
        .into_iter()
        .map(|template| (template.kind.clone(), template))
        .collect::<BTreeMap<_, _>>();

    if !catalog_path.exists() {
        return Ok(templates);
    }

    let content = std::fs::read_to_string(catalog_path).with_context(|| {
        format!(
            "failed to read workflow catalog at '{}'",
            catalog_path.display()
        )
    })?;
    for template in parse_workflow_catalog(&content, &catalog_path.display().to_string())? {
        if templates.contains_key(&template.kind) {
            return Err(anyhow::anyhow!(
                "workflow catalog '{}' redefines workflow kind '{}'",
                catalog_path.display(),
                template.kind
            ));
        }
        templates.insert(template.kind.clone(), template);
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(kind: &str) -> WorkflowTemplate {
        builtin_templates()
            .into_iter()
            .find(|template| template.kind == kind)
            .unwrap()
    }

    #[test]
    fn builtins_are_valid() {
        let templates = builtin_templates();
        assert_eq!(templates.len(), 5);
        for template in &templates {
            template.validate().unwrap();
        }
    }

    #[test]
    fn document_pipeline_applies_defaults() {
        let workflow = template("full_document_pipeline").instantiate(Map::new());
        assert_eq!(workflow.status, WorkflowStatus::Pending);
        assert_eq!(workflow.steps[0].task["query"], json!("Documentation topic"));
        assert_eq!(workflow.steps[1].task["template"], json!("default"));
        assert_eq!(workflow.steps[2].task["standards"], json!(["ISO27001"]));
        assert_eq!(workflow.steps[3].task["channels"], json!(["local"]));
        assert_eq!(workflow.context["topic"], json!("Documentation topic"));
        assert!(uuid::Uuid::parse_str(&workflow.id).is_ok());
    }

    #[test]
    fn context_overrides_defaults() {
        let mut context = Map::new();
        context.insert("topic".to_string(), json!("Release notes"));
        context.insert("channels".to_string(), json!(["local", "git"]));
        let workflow = template("full_document_pipeline").instantiate(context);
        assert_eq!(workflow.steps[0].task["query"], json!("Release notes"));
        assert_eq!(workflow.steps[3].task["channels"], json!(["local", "git"]));
    }

    #[test]
    fn emergency_fix_renders_rollback_restore_point() {
        let mut context = Map::new();
        context.insert("backup_id".to_string(), json!("b-17"));
        let workflow = template("emergency_fix").instantiate(context);
        let rollback = workflow.steps[1].rollback_task.as_ref().unwrap();
        assert_eq!(rollback["type"], json!("rollback"));
        assert_eq!(rollback["restore_point"], json!("b-17"));

        let bare = template("emergency_fix").instantiate(Map::new());
        assert_eq!(
            bare.steps[1].rollback_task.as_ref().unwrap()["restore_point"],
            Value::Null
        );
    }

    #[test]
    fn dependencies_require_success() {
        let mut workflow = template("emergency_fix").instantiate(Map::new());
        assert!(workflow.dependencies_met(&workflow.steps[0]));
        assert!(!workflow.dependencies_met(&workflow.steps[1]));
        workflow.steps[0].status = StepStatus::Skipped;
        assert!(!workflow.dependencies_met(&workflow.steps[1]));
        workflow.steps[0].status = StepStatus::Success;
        assert!(workflow.dependencies_met(&workflow.steps[1]));
    }

    #[test]
    fn catalog_parses_and_validates() {
        let catalog = r#"
[[workflows]]
kind = "nightly_docs"
name = "Nightly docs"

[workflows.defaults]
topic = "Nightly"

[[workflows.steps]]
id = "research"
capability = "research"
task = { type = "research", query = "{topic}" }

[[workflows.steps]]
id = "compose"
capability = "compose"
task = { type = "compose" }
dependencies = ["research"]
"#;
        let templates = parse_workflow_catalog(catalog, "inline").unwrap();
        assert_eq!(templates.len(), 1);
        let workflow = templates[0].instantiate(Map::new());
        assert_eq!(workflow.steps[0].task["query"], json!("Nightly"));
        assert_eq!(workflow.steps[1].name, "compose");
    }

    #[test]
    fn catalog_rejects_forward_dependencies_and_unknown_capabilities() {
        let forward = r#"
[[workflows]]
kind = "loop"
name = "Loop"
[[workflows.steps]]
id = "a"
capability = "research"
dependencies = ["b"]
[[workflows.steps]]
id = "b"
capability = "review"
dependencies = ["a"]
"#;
        let err = parse_workflow_catalog(forward, "inline").unwrap_err();
        assert!(format!("{err:#}").contains("not an earlier step"));

        let unknown = r#"
[[workflows]]
kind = "deploy"
name = "Deploy"
[[workflows.steps]]
id = "ship"
capability = "deploy"
"#;
        assert!(parse_workflow_catalog(unknown, "inline").is_err());

        let duplicate = r#"
[[workflows]]
kind = "dup"
name = "Dup"
[[workflows.steps]]
id = "a"
capability = "research"
[[workflows.steps]]
id = "a"
capability = "review"
"#;
        let err = parse_workflow_catalog(duplicate, "inline").unwrap_err();
        assert!(format!("{err:#}").contains("duplicate step id"));
    }

    #[test]
    fn catalog_cannot_redefine_builtins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("workflows.toml");
        std::fs::write(
            &path,
            "[[workflows]]\nkind = \"emergency_fix\"\nname = \"Mine\"\n[[workflows.steps]]\nid = \"a\"\ncapability = \"analyze\"\n",
        )
        .unwrap();
        let err = load_templates(&path).unwrap_err();
        assert!(err.to_string().contains("redefines"));

        let missing = load_templates(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.len(), 5);
    }
}
