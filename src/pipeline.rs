use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use similar::TextDiff;
use tokio::sync::Mutex;

use crate::context::ContextManager;
use crate::registry::{AgentRegistry, Capability, TaskOutcome, TaskRequest};
use crate::taxonomy::{ErrorSeverity, ErrorType, assess_severity, detect_error_type, location_from_trace};
use crate::telemetry::TelemetrySink;

const SIMILARITY_THRESHOLD: f64 = 0.7;
const MAX_SIMILAR_FIXES: usize = 3;

/// An error as reported by a caller.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ErrorReport {
    pub message: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub additional_info: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    #[serde(rename = "error_message")]
    pub message: String,
    pub stack_trace: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source_system: String,
    #[serde(default)]
    pub additional_info: Map<String, Value>,
}

impl ErrorContext {
    pub fn from_report(report: &ErrorReport) -> Self {
        let message = if report.message.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            report.message.clone()
        };
        let error_type = detect_error_type(&message);
        let (file_path, line_number) = extract_location(report);
        Self {
            error_type,
            severity: assess_severity(error_type, &message),
            file_path,
            line_number,
            message,
            stack_trace: report.stack_trace.clone(),
            timestamp: Utc::now(),
            source_system: report.source.clone().unwrap_or_else(|| "unknown".to_string()),
            additional_info: report.additional_info.clone(),
        }
    }
}

/// Explicit location fields win; otherwise the first frame of the trace.
pub fn extract_location(report: &ErrorReport) -> (Option<String>, Option<u32>) {
    if report.file_path.is_some() {
        return (report.file_path.clone(), report.line_number);
    }
    match report.stack_trace.as_deref().and_then(location_from_trace) {
        Some((file, line)) => (Some(file), Some(line)),
        None => (None, report.line_number),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePatch {
    pub file: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreFile {
    pub original: String,
    /// `None` when the patch created the file; restoring removes it.
    pub backup: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    #[serde(default)]
    pub restore_files: Vec<RestoreFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFix {
    #[serde(alias = "type")]
    pub fix_type: String,
    pub description: String,
    #[serde(default)]
    pub code_changes: Option<Value>,
    #[serde(default)]
    pub file_patches: Option<Vec<FilePatch>>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_impact", alias = "impact")]
    pub estimated_impact: String,
    #[serde(default)]
    pub rollback_plan: Option<RollbackPlan>,
}

fn default_confidence() -> f64 {
    0.5
}

fn default_impact() -> String {
    "unknown".to_string()
}

impl ErrorFix {
    pub fn manual() -> Self {
        Self {
            fix_type: "manual".to_string(),
            description: "Manual intervention required".to_string(),
            code_changes: None,
            file_patches: None,
            confidence: 0.0,
            estimated_impact: "unknown".to_string(),
            rollback_plan: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedError {
    pub error_context: ErrorContext,
    pub analysis: Value,
    pub fix: ErrorFix,
    pub applied: bool,
    pub snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub total_fixes: usize,
    pub successful_fixes: usize,
    pub fix_success_rate: f64,
    pub errors_by_type: BTreeMap<String, usize>,
    pub errors_by_severity: BTreeMap<String, usize>,
}

/// Result of applying a fix: whether it stuck, and what the patched files
/// held before.
#[derive(Debug, Clone, Default)]
pub struct FixApplication {
    pub applied: bool,
    pub previous: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct FixRecord {
    context: ErrorContext,
    fix: ErrorFix,
    applied: bool,
}

#[derive(Debug, Default)]
struct PipelineHistory {
    errors: Vec<ErrorContext>,
    fixes: Vec<FixRecord>,
}

fn words(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// 0.3 for the same type, 0.2 for the same file, plus half the Jaccard index
/// of the message words. Capped at 1.0.
pub fn similarity(a: &ErrorContext, b: &ErrorContext) -> f64 {
    let mut score = 0.0;
    if a.error_type == b.error_type {
        score += 0.3;
    }
    if a.file_path == b.file_path {
        score += 0.2;
    }
    let left = words(&a.message);
    let right = words(&b.message);
    if !left.is_empty() && !right.is_empty() {
        let shared = left.intersection(&right).count() as f64;
        let total = left.union(&right).count() as f64;
        score += 0.5 * shared / total;
    }
    score.min(1.0)
}

pub fn render_fix_report(
    context: &ErrorContext,
    fix: &ErrorFix,
    previous: &BTreeMap<String, String>,
) -> String {
    let mut report = String::new();
    let _ = writeln!(report, "## Error Fix Report\n");
    let _ = writeln!(report, "**Date:** {}", context.timestamp.to_rfc3339());
    let _ = writeln!(report, "**Error Type:** {}", context.error_type);
    let _ = writeln!(report, "**Severity:** {}\n", context.severity);
    let _ = writeln!(report, "### Error Details");
    let _ = writeln!(report, "- **Message:** {}", context.message);
    let _ = writeln!(
        report,
        "- **File:** {}",
        context.file_path.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(
        report,
        "- **Line:** {}\n",
        context
            .line_number
            .map(|line| line.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    let _ = writeln!(report, "### Fix Applied");
    let _ = writeln!(report, "- **Type:** {}", fix.fix_type);
    let _ = writeln!(report, "- **Description:** {}", fix.description);
    let _ = writeln!(report, "- **Confidence:** {:.2}", fix.confidence);
    let _ = writeln!(report, "- **Impact:** {}", fix.estimated_impact);

    for patch in fix.file_patches.iter().flatten() {
        let old = previous.get(&patch.file).map(String::as_str).unwrap_or("");
        let diff = TextDiff::from_lines(old, patch.content.as_str());
        let _ = writeln!(report, "\n### Changes to `{}`\n", patch.file);
        let _ = writeln!(report, "```diff");
        let _ = write!(
            report,
            "{}",
            diff.unified_diff()
                .context_radius(3)
                .header(&format!("a/{}", patch.file), &format!("b/{}", patch.file))
        );
        let _ = writeln!(report, "```");
    }
    report
}

fn restore(files: &[RestoreFile]) {
    for entry in files.iter().rev() {
        let original = Path::new(&entry.original);
        let outcome = match &entry.backup {
            Some(backup) if Path::new(backup).exists() => std::fs::copy(backup, original).map(|_| ()),
            Some(_) => Ok(()),
            None if original.exists() => std::fs::remove_file(original),
            None => Ok(()),
        };
        match outcome {
            Ok(()) => tracing::info!(file = %entry.original, "restored file"),
            Err(err) => tracing::error!(file = %entry.original, error = %err, "failed to restore file"),
        }
    }
}

pub struct ErrorPipeline {
    registry: AgentRegistry,
    context: Option<Arc<ContextManager>>,
    telemetry: TelemetrySink,
    auto_fix_threshold: f64,
    task_timeout: Duration,
    prefer_system: Option<String>,
    history: Mutex<PipelineHistory>,
}

impl ErrorPipeline {
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry,
            context: None,
            telemetry: TelemetrySink::disabled(),
            auto_fix_threshold: 0.7,
            task_timeout: Duration::from_secs(120),
            prefer_system: None,
            history: Mutex::new(PipelineHistory::default()),
        }
    }

    pub fn with_context(mut self, context: Arc<ContextManager>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_auto_fix_threshold(mut self, threshold: f64) -> Self {
        self.auto_fix_threshold = threshold;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_prefer_system(mut self, system: Option<String>) -> Self {
        self.prefer_system = system;
        self
    }

    async fn run(&self, capability: Capability, task: Value) -> TaskOutcome {
        self.registry
            .execute_task_within(
                capability,
                &TaskRequest::from_value(task),
                self.prefer_system.as_deref(),
                self.task_timeout,
            )
            .await
    }

    pub async fn process_error(&self, report: &ErrorReport, auto_fix: bool) -> Result<ProcessedError> {
        let context = ErrorContext::from_report(report);
        tracing::info!(
            error_type = %context.error_type,
            severity = %context.severity,
            source = %context.source_system,
            "processing error"
        );
        self.history.lock().await.errors.push(context.clone());

        let snapshot_id = match &self.context {
            Some(manager) => Some(
                manager
                    .create_snapshot(
                        &format!("error_{}", context.error_type),
                        Some(&format!("severity_{}", context.severity)),
                    )
                    .context("failed to snapshot context for error")?
                    .id,
            ),
            None => None,
        };

        let analysis = self.analyze(&context).await;
        let similar = self.find_similar_fixes(&context).await;
        let fix = self.generate_fix(&context, &analysis, &similar).await;

        let application = if auto_fix && fix.confidence > self.auto_fix_threshold {
            self.apply_fix(&context, &fix).await
        } else {
            tracing::info!(
                auto_fix,
                confidence = fix.confidence,
                threshold = self.auto_fix_threshold,
                "fix not applied"
            );
            FixApplication::default()
        };

        self.history.lock().await.fixes.push(FixRecord {
            context: context.clone(),
            fix: fix.clone(),
            applied: application.applied,
        });

        let report = if application.applied {
            let rendered = render_fix_report(&context, &fix, &application.previous);
            self.publish_report(&rendered).await;
            Some(rendered)
        } else {
            None
        };

        self.telemetry.emit(
            "error.processed",
            json!({
                "error_type": context.error_type,
                "severity": context.severity,
                "fix_type": fix.fix_type,
                "confidence": fix.confidence,
                "applied": application.applied,
            }),
        );

        Ok(ProcessedError {
            error_context: context,
            analysis,
            fix,
            applied: application.applied,
            snapshot_id,
            report,
        })
    }

    async fn analyze(&self, context: &ErrorContext) -> Value {
        let outcome = self
            .run(
                Capability::Analyze,
                json!({
                    "type": "analyze",
                    "error_type": context.error_type,
                    "error_message": context.message,
                    "file_path": context.file_path,
                    "line_number": context.line_number,
                    "stack_trace": context.stack_trace,
                }),
            )
            .await;
        match outcome.result {
            Some(Value::Object(mut analysis)) if outcome.success => {
                analysis.remove("context_update");
                Value::Object(analysis)
            }
            _ => {
                tracing::warn!(error = ?outcome.error, "analysis unavailable; using fallback");
                json!({
                    "cause": "Unable to determine exact cause",
                    "impact": "Unknown impact",
                    "suggestions": ["Manual review required"],
                })
            }
        }
    }

    /// Successful past fixes for the same error type that look alike.
    pub async fn find_similar_fixes(&self, context: &ErrorContext) -> Vec<ErrorFix> {
        let history = self.history.lock().await;
        history
            .fixes
            .iter()
            .filter(|record| record.applied && record.context.error_type == context.error_type)
            .filter(|record| similarity(&record.context, context) > SIMILARITY_THRESHOLD)
            .take(MAX_SIMILAR_FIXES)
            .map(|record| record.fix.clone())
            .collect()
    }

    async fn generate_fix(&self, context: &ErrorContext, analysis: &Value, similar: &[ErrorFix]) -> ErrorFix {
        let outcome = self
            .run(
                Capability::Compose,
                json!({
                    "type": "compose",
                    "template": "error_fix",
                    "error_context": context,
                    "analysis": analysis,
                    "similar_fixes": similar,
                }),
            )
            .await;
        let proposed = outcome
            .result
            .as_ref()
            .filter(|_| outcome.success)
            .and_then(|result| result.get("fix"))
            .cloned()
            .and_then(|fix| serde_json::from_value::<ErrorFix>(fix).ok());
        match proposed {
            Some(mut fix) => {
                fix.confidence = fix.confidence.clamp(0.0, 1.0);
                fix
            }
            None => {
                tracing::warn!(error = ?outcome.error, "no fix proposal; falling back to manual");
                ErrorFix::manual()
            }
        }
    }

    /// Write the fix, then have a reviewer validate it. Any write failure or
    /// rejection restores the backups taken so far.
    pub async fn apply_fix(&self, context: &ErrorContext, fix: &ErrorFix) -> FixApplication {
        tracing::info!(fix_type = %fix.fix_type, description = %fix.description, "applying fix");
        let mut restore_files = Vec::new();
        let mut previous = BTreeMap::new();

        if let Err(err) = write_changes(fix, &mut restore_files, &mut previous) {
            tracing::error!(error = %format!("{err:#}"), "failed to apply fix");
            self.roll_back(fix, &restore_files);
            return FixApplication::default();
        }

        let review = self
            .run(
                Capability::Review,
                json!({
                    "type": "review",
                    "check_type": "fix_validation",
                    "fix_applied": true,
                    "error_context": context,
                    "fix": fix,
                }),
            )
            .await;
        let approved = review.success
            && review
                .result
                .as_ref()
                .and_then(|result| result.get("approved"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
        if !approved {
            tracing::warn!(error = ?review.error, "fix failed validation; rolling back");
            self.roll_back(fix, &restore_files);
            return FixApplication::default();
        }

        tracing::info!("fix applied and validated");
        FixApplication {
            applied: true,
            previous,
        }
    }

    fn roll_back(&self, fix: &ErrorFix, restore_files: &[RestoreFile]) {
        restore(restore_files);
        if let Some(plan) = &fix.rollback_plan {
            restore(&plan.restore_files);
        }
    }

    async fn publish_report(&self, report: &str) {
        let outcome = self
            .run(
                Capability::Publish,
                json!({
                    "type": "publish",
                    "content": report,
                    "filename": format!("error_fix_{}.md", Local::now().format("%Y%m%d_%H%M%S")),
                    "channels": ["local", "git"],
                }),
            )
            .await;
        if !outcome.success {
            tracing::warn!(error = ?outcome.error, "failed to publish fix report");
        }
    }

    pub async fn statistics(&self) -> ErrorStatistics {
        let history = self.history.lock().await;
        let mut stats = ErrorStatistics {
            total_errors: history.errors.len(),
            total_fixes: history.fixes.len(),
            successful_fixes: history.fixes.iter().filter(|record| record.applied).count(),
            ..ErrorStatistics::default()
        };
        if stats.total_fixes > 0 {
            stats.fix_success_rate = stats.successful_fixes as f64 / stats.total_fixes as f64;
        }
        for error in &history.errors {
            *stats
                .errors_by_type
                .entry(error.error_type.to_string())
                .or_default() += 1;
            *stats
                .errors_by_severity
                .entry(error.severity.to_string())
                .or_default() += 1;
        }
        stats
    }
}

/// First free `<file>.backup.<timestamp>[.<n>]` name.
fn backup_path(file: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S_%6f");
    let base = format!("{file}.backup.{stamp}");
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{n}"));
        n += 1;
    }
    candidate
}

fn write_changes(
    fix: &ErrorFix,
    restore_files: &mut Vec<RestoreFile>,
    previous: &mut BTreeMap<String, String>,
) -> Result<()> {
    match fix.fix_type.as_str() {
        "code" => {
            for patch in fix.file_patches.iter().flatten() {
                let target = Path::new(&patch.file);
                // only the first patch to a file sees its original content
                let first_seen = !previous.contains_key(&patch.file);
                if first_seen && target.exists() {
                    let old = std::fs::read_to_string(target)
                        .with_context(|| format!("failed to read '{}'", patch.file))?;
                    let backup = backup_path(&patch.file);
                    std::fs::copy(target, &backup).with_context(|| {
                        format!("failed to back up '{}' to '{}'", patch.file, backup.display())
                    })?;
                    restore_files.push(RestoreFile {
                        original: patch.file.clone(),
                        backup: Some(backup.display().to_string()),
                    });
                    previous.insert(patch.file.clone(), old);
                } else if first_seen {
                    restore_files.push(RestoreFile {
                        original: patch.file.clone(),
                        backup: None,
                    });
                    previous.insert(patch.file.clone(), String::new());
                }
                std::fs::write(target, &patch.content)
                    .with_context(|| format!("failed to write patch to '{}'", patch.file))?;
                tracing::info!(file = %patch.file, "patched file");
            }
        }
        "config" => {
            if let Some(changes) = fix.code_changes.as_ref().and_then(Value::as_object) {
                for (key, value) in changes {
                    tracing::info!(key = %key, value = %value, "config update");
                }
            }
        }
        other => tracing::debug!(fix_type = %other, "fix has no automatic changes"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;
    use crate::agents::{analyze::AnalyzeAgent, compose::ComposeAgent, review::ReviewAgent};
    use crate::registry::{AgentHandler, AgentRecord, AgentStatus};
    use async_trait::async_trait;

    /// Proposes a fixed code patch.
    struct Patcher {
        file: String,
        confidence: f64,
    }

    #[async_trait]
    impl AgentHandler for Patcher {
        async fn handle(&self, _task: &TaskRequest) -> Result<Value> {
            Ok(json!({
                "fix": {
                    "type": "code",
                    "description": "Guard the key lookup",
                    "file_patches": [{ "file": self.file, "content": "value = data.get('user')\n" }],
                    "confidence": self.confidence,
                    "impact": "High impact"
                }
            }))
        }
    }

    async fn register(registry: &AgentRegistry, id: &str, cap: Capability, handler: Arc<dyn AgentHandler>) {
        let mut record = AgentRecord::new(id, id, "test", AgentKind::Research, &[cap]);
        record.status = AgentStatus::Available;
        registry.register(record, Some(handler)).await;
    }

    fn context(message: &str, file: Option<&str>) -> ErrorContext {
        ErrorContext::from_report(&ErrorReport {
            message: message.to_string(),
            file_path: file.map(str::to_string),
            ..ErrorReport::default()
        })
    }

    #[test]
    fn location_prefers_explicit_fields() {
        let trace = "Traceback:\n  File \"/srv/app.py\", line 42, in main\n";
        let from_trace = ErrorReport {
            message: "KeyError: 'x'".to_string(),
            stack_trace: Some(trace.to_string()),
            ..ErrorReport::default()
        };
        assert_eq!(
            extract_location(&from_trace),
            (Some("/srv/app.py".to_string()), Some(42))
        );

        let explicit = ErrorReport {
            file_path: Some("main.py".to_string()),
            line_number: Some(3),
            ..from_trace
        };
        assert_eq!(extract_location(&explicit), (Some("main.py".to_string()), Some(3)));
    }

    #[test]
    fn similarity_weights_type_file_and_words() {
        let a = context("KeyError: 'user' in handler", Some("app.py"));
        let b = context("KeyError: 'user' in handler", Some("app.py"));
        assert!((similarity(&a, &b) - 1.0).abs() < 1e-9);

        let c = context("KeyError: 'user' in handler", Some("other.py"));
        assert!((similarity(&a, &c) - 0.8).abs() < 1e-9);

        let d = context("SyntaxError: invalid syntax", None);
        assert!(similarity(&a, &d) < 0.1);
    }

    #[test]
    fn fix_report_includes_diff() {
        let ctx = context("KeyError: 'user'", Some("app.py"));
        let fix = ErrorFix {
            fix_type: "code".to_string(),
            description: "Guard lookup".to_string(),
            code_changes: None,
            file_patches: Some(vec![FilePatch {
                file: "app.py".to_string(),
                content: "value = data.get('user')\n".to_string(),
            }]),
            confidence: 0.8,
            estimated_impact: "High impact".to_string(),
            rollback_plan: None,
        };
        let mut previous = BTreeMap::new();
        previous.insert("app.py".to_string(), "value = data['user']\n".to_string());
        let report = render_fix_report(&ctx, &fix, &previous);
        assert!(report.contains("**Error Type:** runtime"));
        assert!(report.contains("**Confidence:** 0.80"));
        assert!(report.contains("-value = data['user']"));
        assert!(report.contains("+value = data.get('user')"));
    }

    #[tokio::test]
    async fn without_agents_falls_back_to_manual() {
        let pipeline = ErrorPipeline::new(AgentRegistry::new());
        let report = ErrorReport {
            message: "SyntaxError: unexpected EOF while parsing".to_string(),
            ..ErrorReport::default()
        };
        let processed = pipeline.process_error(&report, true).await.unwrap();
        assert_eq!(processed.error_context.error_type, ErrorType::Syntax);
        assert_eq!(processed.analysis["cause"], json!("Unable to determine exact cause"));
        assert_eq!(processed.fix, ErrorFix::manual());
        assert!(!processed.applied);
        assert!(processed.snapshot_id.is_none());

        let stats = pipeline.statistics().await;
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.total_fixes, 1);
        assert_eq!(stats.fix_success_rate, 0.0);
        assert_eq!(stats.errors_by_type["syntax"], 1);
    }

    #[tokio::test]
    async fn builtin_agents_classify_and_propose() {
        let registry = AgentRegistry::new();
        register(&registry, "analyze", Capability::Analyze, Arc::new(AnalyzeAgent)).await;
        register(&registry, "compose", Capability::Compose, Arc::new(ComposeAgent)).await;
        let pipeline = ErrorPipeline::new(registry);
        let report = ErrorReport {
            message: "ModuleNotFoundError: No module named 'yaml'".to_string(),
            ..ErrorReport::default()
        };
        let processed = pipeline.process_error(&report, false).await.unwrap();
        assert_eq!(processed.analysis["error_type"], json!("import"));
        assert!(processed.analysis.get("context_update").is_none());
        assert_eq!(processed.fix.fix_type, "dependency");
        assert!(!processed.applied);
    }

    #[tokio::test]
    async fn auto_fix_patches_and_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("app.py");
        std::fs::write(&file, "value = data['user']\n").unwrap();
        let file = file.display().to_string();

        let registry = AgentRegistry::new();
        register(&registry, "compose", Capability::Compose, Arc::new(Patcher { file: file.clone(), confidence: 0.9 })).await;
        register(&registry, "review", Capability::Review, Arc::new(ReviewAgent::new(false, None))).await;
        let pipeline = ErrorPipeline::new(registry);

        let report = ErrorReport {
            message: "KeyError: 'user'".to_string(),
            file_path: Some(file.clone()),
            ..ErrorReport::default()
        };
        let processed = pipeline.process_error(&report, true).await.unwrap();
        assert!(processed.applied);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "value = data.get('user')\n");
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("app.py.backup."))
            .count();
        assert_eq!(backups, 1);
        assert!(processed.report.unwrap().contains("+value = data.get('user')"));

        // the applied fix is now history for the same error
        let similar = pipeline.find_similar_fixes(&processed.error_context).await;
        assert_eq!(similar.len(), 1);
        assert_eq!(pipeline.statistics().await.successful_fixes, 1);
    }

    #[tokio::test]
    async fn rejected_fix_is_rolled_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("app.py");
        std::fs::write(&file, "original\n").unwrap();
        let file = file.display().to_string();

        let registry = AgentRegistry::new();
        register(&registry, "compose", Capability::Compose, Arc::new(Patcher { file: file.clone(), confidence: 0.9 })).await;
        // fail_on_reject turns a rejection into a failed task; a 0.95 floor rejects everything
        let strict = ReviewAgent::new(true, Some(0.95));
        register(&registry, "review", Capability::Review, Arc::new(strict)).await;
        let pipeline = ErrorPipeline::new(registry);

        let ctx = context("KeyError: 'user'", Some(&file));
        let fix = ErrorFix {
            fix_type: "code".to_string(),
            description: String::new(),
            code_changes: None,
            file_patches: Some(vec![FilePatch { file: file.clone(), content: "patched\n".to_string() }]),
            confidence: 0.9,
            estimated_impact: "unknown".to_string(),
            rollback_plan: None,
        };
        let application = pipeline.apply_fix(&ctx, &fix).await;
        assert!(!application.applied);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original\n");
    }

    #[tokio::test]
    async fn rollback_restores_original_when_a_file_is_patched_twice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("app.py");
        std::fs::write(&file, "original\n").unwrap();
        let file = file.display().to_string();

        // no reviewer registered, so validation fails and the fix is rolled back
        let pipeline = ErrorPipeline::new(AgentRegistry::new());
        let ctx = context("KeyError: 'user'", Some(&file));
        let fix = ErrorFix {
            fix_type: "code".to_string(),
            description: String::new(),
            code_changes: None,
            file_patches: Some(vec![
                FilePatch { file: file.clone(), content: "stage one\n".to_string() },
                FilePatch { file: file.clone(), content: "stage two\n".to_string() },
            ]),
            confidence: 0.9,
            estimated_impact: "unknown".to_string(),
            rollback_plan: None,
        };
        let application = pipeline.apply_fix(&ctx, &fix).await;
        assert!(!application.applied);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original\n");

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("app.py.backup."))
            .map(|entry| std::fs::read_to_string(entry.path()).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(backups, vec!["original\n".to_string()]);
    }

    #[test]
    fn backup_names_never_reuse_an_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("app.py").display().to_string();
        let first = backup_path(&file);
        std::fs::write(&first, "taken").unwrap();
        let second = backup_path(&file);
        assert_ne!(first, second);
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn low_confidence_is_not_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("app.py");
        std::fs::write(&file, "original\n").unwrap();
        let file = file.display().to_string();

        let registry = AgentRegistry::new();
        register(&registry, "compose", Capability::Compose, Arc::new(Patcher { file: file.clone(), confidence: 0.7 })).await;
        let pipeline = ErrorPipeline::new(registry);
        let report = ErrorReport {
            message: "KeyError: 'user'".to_string(),
            ..ErrorReport::default()
        };
        let processed = pipeline.process_error(&report, true).await.unwrap();
        assert!(!processed.applied);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original\n");
    }
}
