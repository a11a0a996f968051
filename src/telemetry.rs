//! JSONL event stream for commands, workflows, and the error pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;

#[derive(Serialize)]
struct EventLine<'a> {
    ts_unix_ms: i64,
    event: &'a str,
    run_id: &'a str,
    command: &'a str,
    profile: &'a str,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

/// Cheap to clone; clones share the file lock so concurrent workflow tasks
/// never interleave partial lines.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub command: String,
    pub profile: String,
    write_lock: Arc<Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        Self {
            enabled: cfg.telemetry_enabled,
            path: PathBuf::from(&cfg.telemetry_path),
            run_id: format!("run-{}-{}", Utc::now().timestamp_millis(), std::process::id()),
            command,
            profile: cfg.profile.clone(),
            write_lock: Arc::default(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            run_id: String::new(),
            command: String::new(),
            profile: String::new(),
            write_lock: Arc::default(),
        }
    }

    /// Object payload fields are flattened into the event line; anything else
    /// is dropped. Write failures are logged, never returned.
    pub fn emit(&self, event: &str, payload: Value) {
        if !self.enabled {
            return;
        }
        let line = EventLine {
            ts_unix_ms: Utc::now().timestamp_millis(),
            event,
            run_id: &self.run_id,
            command: &self.command,
            profile: &self.profile,
            payload: match payload {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        };
        if let Err(err) = self.write_line(&line) {
            tracing::warn!(event, path = %self.path.display(), error = %format!("{err:#}"), "telemetry write failed");
        }
    }

    fn write_line(&self, line: &EventLine<'_>) -> Result<()> {
        let mut encoded = serde_json::to_vec(line).context("failed to encode telemetry event")?;
        encoded.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create telemetry directory '{}'", parent.display()))?;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&encoded))
            .with_context(|| format!("failed to write telemetry to '{}'", self.path.display()))
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub runs: BTreeSet<String>,
    pub commands: BTreeMap<String, usize>,
    /// Count per event name (`workflow.failed`, `step.rolled_back`, ...).
    pub events: BTreeMap<String, usize>,
    pub error_types: BTreeMap<String, usize>,
    pub last_event_ts_unix_ms: Option<i64>,
}

impl TelemetrySummary {
    pub fn count(&self, event: &str) -> usize {
        self.events.get(event).copied().unwrap_or(0)
    }

    fn record(&mut self, event: &Value) {
        let text = |key: &str| {
            event
                .get(key)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
        };

        self.parsed_events += 1;
        if let Some(run_id) = text("run_id") {
            self.runs.insert(run_id.to_string());
        }
        if let Some(command) = text("command") {
            *self.commands.entry(command.to_string()).or_default() += 1;
        }
        if let Some(ts) = event.get("ts_unix_ms").and_then(Value::as_i64) {
            self.last_event_ts_unix_ms = self.last_event_ts_unix_ms.max(Some(ts));
        }
        let Some(name) = text("event") else {
            return;
        };
        *self.events.entry(name.to_string()).or_default() += 1;
        if name == "error.processed"
            && let Some(kind) = text("error_type")
        {
            *self.error_types.entry(kind.to_string()).or_default() += 1;
        }
    }
}

/// Summarise the newest `limit` lines (at least one).
pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary {
        total_lines: lines.len(),
        ..TelemetrySummary::default()
    };

    for line in lines.iter().rev().take(limit.max(1)) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(event) => summary.record(&event),
            Err(_) => summary.parse_errors += 1,
        }
    }
    summary
}

fn ranked(counts: &BTreeMap<String, usize>) -> Vec<(&String, &usize)> {
    let mut ranked = counts.iter().collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    ranked
}

pub fn render_telemetry_report(path: &Path, summary: &TelemetrySummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Telemetry report");
    let _ = writeln!(out, "Path: {}", path.display());
    let _ = writeln!(
        out,
        "Events: {} of {} lines (parse_errors={}, runs={})",
        summary.parsed_events,
        summary.total_lines,
        summary.parse_errors,
        summary.runs.len()
    );
    let _ = writeln!(
        out,
        "Commands: completed={} failed={}",
        summary.count("command.completed"),
        summary.count("command.failed")
    );
    let _ = writeln!(
        out,
        "Workflows: created={} started={} completed={} failed={} cancelled={}",
        summary.count("workflow.created"),
        summary.count("workflow.started"),
        summary.count("workflow.completed"),
        summary.count("workflow.failed"),
        summary.count("workflow.cancelled")
    );
    let _ = writeln!(
        out,
        "Steps: succeeded={} failed={} skipped={} rolled_back={}",
        summary.count("step.succeeded"),
        summary.count("step.failed"),
        summary.count("step.skipped"),
        summary.count("step.rolled_back")
    );
    let _ = writeln!(out, "Errors processed: {}", summary.count("error.processed"));

    for (title, counts) in [("Error types", &summary.error_types), ("Top commands", &summary.commands)] {
        if counts.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{title}:");
        for (name, count) in ranked(counts).into_iter().take(5) {
            let _ = writeln!(out, "- {name}: {count}");
        }
    }

    if let Some(ts) = summary.last_event_ts_unix_ms {
        let _ = writeln!(out, "Last event ts_unix_ms: {ts}");
    }
    out
}

pub fn run_telemetry_report(cfg: &RuntimeConfig, path_override: Option<String>, limit: usize) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;
    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<String>>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    print!("{}", render_telemetry_report(&path, &summarize_telemetry_lines(lines, limit)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn summary_counts_workflow_and_error_events() {
        let lines = vec![
            r#"{"ts_unix_ms":10,"event":"workflow.started","run_id":"r1","command":"workflow.run.emergency_fix"}"#.to_string(),
            r#"{"ts_unix_ms":11,"event":"step.rolled_back","run_id":"r1","command":"workflow.run.emergency_fix"}"#.to_string(),
            r#"{"ts_unix_ms":12,"event":"workflow.failed","run_id":"r1","command":"workflow.run.emergency_fix"}"#.to_string(),
            r#"{"ts_unix_ms":20,"event":"error.processed","error_type":"import","run_id":"r2","command":"errors.process"}"#.to_string(),
            "not json".to_string(),
        ];

        let summary = summarize_telemetry_lines(lines, 100);
        assert_eq!(summary.parsed_events, 4);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.runs.len(), 2);
        assert_eq!(summary.count("workflow.started"), 1);
        assert_eq!(summary.count("workflow.failed"), 1);
        assert_eq!(summary.count("step.rolled_back"), 1);
        assert_eq!(summary.error_types.get("import"), Some(&1));
        assert_eq!(summary.commands.get("workflow.run.emergency_fix"), Some(&3));
        assert_eq!(summary.last_event_ts_unix_ms, Some(20));

        let report = render_telemetry_report(Path::new("events.jsonl"), &summary);
        assert!(report.contains("Workflows: created=0 started=1 completed=0 failed=1 cancelled=0"));
        assert!(report.contains("- workflow.run.emergency_fix: 3"));
    }

    #[test]
    fn summary_limit_keeps_newest_lines() {
        let lines = vec![
            r#"{"event":"command.failed","run_id":"old"}"#.to_string(),
            r#"{"event":"command.completed","run_id":"new"}"#.to_string(),
        ];
        let summary = summarize_telemetry_lines(lines, 1);
        assert_eq!(summary.count("command.completed"), 1);
        assert_eq!(summary.count("command.failed"), 0);
        assert_eq!(summary.total_lines, 2);
    }

    #[test]
    fn emitted_events_flatten_payload_into_one_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = TelemetrySink::disabled();
        sink.enabled = true;
        sink.path = dir.path().join("nested/events.jsonl");
        sink.run_id = "run-1".to_string();
        sink.command = "workflow.run.emergency_fix".to_string();

        sink.emit("workflow.started", json!({ "workflow_id": "wf-1" }));
        sink.emit("workflow.completed", json!("ignored"));

        let content = std::fs::read_to_string(&sink.path).expect("events written");
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("valid json");
        assert_eq!(first["event"], "workflow.started");
        assert_eq!(first["workflow_id"], "wf-1");
        assert_eq!(first["run_id"], "run-1");
    }

    #[test]
    fn disabled_sink_never_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = TelemetrySink::disabled();
        sink.path = dir.path().join("events.jsonl");
        sink.emit("workflow.started", json!({}));
        assert!(!sink.path.exists());
    }
}
