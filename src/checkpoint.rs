//! Durable JSON state on disk.
//!
//! Every write goes to a sibling `.tmp` file first and is renamed into place,
//! so a crash never leaves a half-written document behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::workflow::{StepStatus, Workflow, WorkflowStatus};

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state directory '{}'", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(value).context("failed to serialize state")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)
        .with_context(|| format!("failed to write '{}'", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move state into '{}'", path.display()))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("corrupt state file '{}'", path.display()))
}

/// One JSON document per workflow under the workflows directory.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    dir: PathBuf,
}

impl WorkflowStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            return Err(anyhow::anyhow!("invalid workflow id '{id}'"));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    pub fn save(&self, workflow: &Workflow) -> Result<()> {
        write_json_atomic(&self.path_for(&workflow.id)?, workflow)
    }

    pub fn load(&self, id: &str) -> Result<Option<Workflow>> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Load every stored workflow. Workflows that were running when the
    /// process stopped come back as failed with error `interrupted`; corrupt
    /// files are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<Workflow>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list '{}'", self.dir.display()))?;

        let mut workflows = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let mut workflow = match read_json::<Workflow>(&path) {
                Ok(workflow) => workflow,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable workflow file");
                    continue;
                }
            };
            if workflow.status == WorkflowStatus::Running {
                mark_interrupted(&mut workflow);
                self.save(&workflow)?;
            }
            workflows.push(workflow);
        }
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }
}

fn mark_interrupted(workflow: &mut Workflow) {
    let now = Utc::now();
    workflow.status = WorkflowStatus::Failed;
    workflow.error = Some("interrupted".to_string());
    workflow.completed_at = Some(now);
    for step in &mut workflow.steps {
        if step.status == StepStatus::Running {
            step.status = StepStatus::Failed;
            step.error = Some("interrupted".to_string());
            step.completed_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::builtin_templates;
    use serde_json::Map;

    fn sample() -> Workflow {
        builtin_templates()[0].instantiate(Map::new())
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/state.json");
        write_json_atomic(&path, &serde_json::json!({ "a": 1 })).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn save_and_load_workflow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkflowStore::new(dir.path().to_path_buf());
        let workflow = sample();
        store.save(&workflow).unwrap();
        assert_eq!(store.load(&workflow.id).unwrap(), Some(workflow));
        assert_eq!(store.load("missing").unwrap(), None);
        assert!(store.load("../etc/passwd").is_err());
    }

    #[test]
    fn running_workflows_reload_as_interrupted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkflowStore::new(dir.path().to_path_buf());
        let mut workflow = sample();
        workflow.status = WorkflowStatus::Running;
        workflow.steps[0].status = StepStatus::Running;
        store.save(&workflow).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, WorkflowStatus::Failed);
        assert_eq!(loaded[0].error.as_deref(), Some("interrupted"));
        assert_eq!(loaded[0].steps[0].status, StepStatus::Failed);

        let persisted = store.load(&workflow.id).unwrap().unwrap();
        assert_eq!(persisted.status, WorkflowStatus::Failed);
    }
}
