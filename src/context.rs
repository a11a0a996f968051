//! Session context and long-term knowledge.
//!
//! Knowledge is a key/value store with importance ranks persisted to
//! `<state_dir>/knowledge.json`. Snapshots capture the live session context
//! plus the knowledge relevant to a workflow; checkpoints capture the whole
//! session context and can be restored on the next boot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::checkpoint::write_json_atomic;

pub const SNAPSHOT_IMPORTANCE: u8 = 8;
pub const WORKFLOW_IMPORTANCE: u8 = 7;
pub const CONTEXT_IMPORTANCE: u8 = 6;
pub const CHECKPOINT_IMPORTANCE: u8 = 10;
const RELEVANT_KNOWLEDGE_LIMIT: usize = 10;
const PERSISTED_CONTEXT_KEYS: [&str; 2] = ["session_id", "active_workflows"];

/// Records the manager writes about itself. They embed session state, so
/// they never count as relevant knowledge for a new snapshot.
fn is_bookkeeping_key(key: &str) -> bool {
    key.starts_with("snapshot_") || key.starts_with("checkpoint_") || key == "last_session"
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub value: Value,
    pub importance: u8,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub key: String,
    pub value: Value,
    pub importance: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub identity_id: String,
    pub frequency: String,
    #[serde(default)]
    pub active_workflows: BTreeMap<String, Value>,
    #[serde(default)]
    pub memory_snapshots: BTreeMap<String, Snapshot>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl SessionContext {
    fn fresh() -> Self {
        Self {
            session_id: format!("session_{}", Local::now().format("%Y%m%d_%H%M%S")),
            identity_id: "galaxy-bridge".to_string(),
            frequency: "0000".to_string(),
            ..Self::default()
        }
    }

    fn without_snapshots(&self) -> Self {
        Self {
            memory_snapshots: BTreeMap::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub workflow_id: String,
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub context: Box<SessionContext>,
    pub knowledge: Vec<KnowledgeHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCheckpoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub full_context: SessionContext,
    pub memory_stats: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: String,
    pub frequency: String,
    pub session: String,
    pub mission: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMatch {
    pub id: String,
    pub workflow_id: String,
    pub step_id: Option<String>,
    pub score: usize,
}

struct ContextState {
    knowledge: BTreeMap<String, KnowledgeEntry>,
    current: SessionContext,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ContextManager {
    state_dir: PathBuf,
    state: Mutex<ContextState>,
}

fn short_id(seed: &str) -> String {
    let digest = format!("{:x}", md5::compute(seed.as_bytes()));
    digest[..8].to_string()
}

fn words(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric() && ch != '_')
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

impl ContextManager {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let knowledge_path = state_dir.join("knowledge.json");
        let knowledge = if knowledge_path.exists() {
            let content = std::fs::read_to_string(&knowledge_path).with_context(|| {
                format!("failed to read knowledge store '{}'", knowledge_path.display())
            })?;
            serde_json::from_str(&content).with_context(|| {
                format!("knowledge store '{}' is not valid JSON", knowledge_path.display())
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            state: Mutex::new(ContextState {
                knowledge,
                current: SessionContext::fresh(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn knowledge_path(&self) -> PathBuf {
        self.state_dir.join("knowledge.json")
    }

    fn save_knowledge(&self, state: &ContextState) -> Result<()> {
        write_json_atomic(&self.knowledge_path(), &state.knowledge)
    }

    fn insert_knowledge(state: &mut ContextState, key: &str, value: Value, importance: u8) {
        state.knowledge.insert(
            key.to_string(),
            KnowledgeEntry {
                value,
                importance,
                last_updated: Utc::now(),
            },
        );
    }

    // -- knowledge ----------------------------------------------------------

    pub fn remember(&self, key: &str, value: Value, importance: u8) -> Result<()> {
        let mut state = self.lock();
        Self::insert_knowledge(&mut state, key, value, importance);
        self.save_knowledge(&state)
    }

    pub fn recall(&self, key: &str) -> Option<KnowledgeEntry> {
        self.lock().knowledge.get(key).cloned()
    }

    /// Knowledge whose key or serialized value contains `needle`, most
    /// important first, then most recent. Snapshot and checkpoint records are
    /// never returned.
    pub fn relevant_knowledge(&self, needle: &str, limit: usize) -> Vec<KnowledgeHit> {
        Self::relevant_from(&self.lock(), needle, limit)
    }

    fn relevant_from(state: &ContextState, needle: &str, limit: usize) -> Vec<KnowledgeHit> {
        let mut hits = state
            .knowledge
            .iter()
            .filter(|(key, _)| !is_bookkeeping_key(key))
            .filter(|(key, entry)| {
                key.contains(needle) || entry.value.to_string().contains(needle)
            })
            .collect::<Vec<_>>();
        hits.sort_by(|(_, a), (_, b)| {
            b.importance
                .cmp(&a.importance)
                .then(b.last_updated.cmp(&a.last_updated))
        });
        hits.into_iter()
            .take(limit)
            .map(|(key, entry)| KnowledgeHit {
                key: key.clone(),
                value: entry.value.clone(),
                importance: entry.importance,
            })
            .collect()
    }

    // -- snapshots ----------------------------------------------------------

    pub fn create_snapshot(&self, workflow_id: &str, step_id: Option<&str>) -> Result<Snapshot> {
        let now = Utc::now();
        let id = short_id(&format!(
            "{workflow_id}_{}_{}",
            step_id.unwrap_or("None"),
            now.to_rfc3339()
        ));

        let mut state = self.lock();
        let knowledge = Self::relevant_from(&state, workflow_id, RELEVANT_KNOWLEDGE_LIMIT);
        let snapshot = Snapshot {
            id: id.clone(),
            workflow_id: workflow_id.to_string(),
            step_id: step_id.map(str::to_string),
            timestamp: now,
            context: Box::new(state.current.without_snapshots()),
            knowledge,
        };

        let value = serde_json::to_value(&snapshot).context("failed to serialize snapshot")?;
        Self::insert_knowledge(&mut state, &format!("snapshot_{id}"), value, SNAPSHOT_IMPORTANCE);
        state
            .current
            .memory_snapshots
            .insert(id.clone(), snapshot.clone());
        self.save_knowledge(&state)?;

        tracing::info!(snapshot = %id, workflow_id = %workflow_id, "memory snapshot created");
        Ok(snapshot)
    }

    pub fn restore_snapshot(&self, id: &str) -> Option<Snapshot> {
        let mut state = self.lock();
        if let Some(snapshot) = state.current.memory_snapshots.get(id) {
            return Some(snapshot.clone());
        }

        let stored = state.knowledge.get(&format!("snapshot_{id}"))?.value.clone();
        match serde_json::from_value::<Snapshot>(stored) {
            Ok(snapshot) => {
                state
                    .current
                    .memory_snapshots
                    .insert(id.to_string(), snapshot.clone());
                tracing::info!(snapshot = %id, "memory snapshot restored");
                Some(snapshot)
            }
            Err(err) => {
                tracing::warn!(snapshot = %id, error = %err, "stored snapshot is unreadable");
                None
            }
        }
    }

    /// Rank snapshots by how many query words they share.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SnapshotMatch> {
        let query_words = words(query);
        if query_words.is_empty() {
            return Vec::new();
        }

        let state = self.lock();
        let mut snapshots = state.current.memory_snapshots.values().cloned().collect::<Vec<_>>();
        for (key, entry) in &state.knowledge {
            if key.starts_with("snapshot_")
                && let Ok(snapshot) = serde_json::from_value::<Snapshot>(entry.value.clone())
                && !state.current.memory_snapshots.contains_key(&snapshot.id)
            {
                snapshots.push(snapshot);
            }
        }

        let mut matches = snapshots
            .into_iter()
            .filter_map(|snapshot| {
                let text = serde_json::to_string(&snapshot).unwrap_or_default();
                let score = words(&text).intersection(&query_words).count();
                (score > 0).then(|| SnapshotMatch {
                    id: snapshot.id,
                    workflow_id: snapshot.workflow_id,
                    step_id: snapshot.step_id,
                    score,
                })
            })
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| b.score.cmp(&a.score).then(a.id.cmp(&b.id)));
        matches.truncate(limit);
        matches
    }

    // -- workflow context ---------------------------------------------------

    pub fn save_workflow_context(&self, workflow_id: &str, context: &Map<String, Value>) -> Result<()> {
        let mut state = self.lock();
        let value = Value::Object(context.clone());
        state
            .current
            .active_workflows
            .insert(workflow_id.to_string(), value.clone());
        Self::insert_knowledge(
            &mut state,
            &format!("workflow_{workflow_id}"),
            value,
            WORKFLOW_IMPORTANCE,
        );
        self.save_knowledge(&state)
    }

    pub fn workflow_context(&self, workflow_id: &str) -> Option<Value> {
        let state = self.lock();
        state
            .current
            .active_workflows
            .get(workflow_id)
            .cloned()
            .or_else(|| {
                state
                    .knowledge
                    .get(&format!("workflow_{workflow_id}"))
                    .map(|entry| entry.value.clone())
            })
    }

    /// Merge updates into the session context. Identity keys (`forge_*`),
    /// the session id, and the active workflow map are also persisted.
    pub fn update_context(&self, updates: Map<String, Value>) -> Result<()> {
        let mut state = self.lock();
        let mut persist = false;
        for (key, value) in updates {
            match key.as_str() {
                "session_id" => {
                    if let Some(session) = value.as_str() {
                        state.current.session_id = session.to_string();
                    }
                }
                "active_workflows" => {
                    if let Some(map) = value.as_object() {
                        for (id, ctx) in map {
                            state.current.active_workflows.insert(id.clone(), ctx.clone());
                        }
                    }
                }
                _ => {
                    state.current.extra.insert(key.clone(), value.clone());
                }
            }

            if key.starts_with("forge_") || PERSISTED_CONTEXT_KEYS.contains(&key.as_str()) {
                Self::insert_knowledge(&mut state, &format!("context_{key}"), value, CONTEXT_IMPORTANCE);
                persist = true;
            }
        }
        if persist {
            self.save_knowledge(&state)?;
        }
        Ok(())
    }

    pub fn current(&self) -> SessionContext {
        self.lock().current.clone()
    }

    // -- checkpoints --------------------------------------------------------

    fn checkpoint_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("checkpoint_{id}.json"))
    }

    pub fn create_checkpoint(&self) -> Result<String> {
        let now = Utc::now();
        let id = short_id(&format!("checkpoint_{}", now.to_rfc3339()));

        let mut state = self.lock();
        let checkpoint = ContextCheckpoint {
            id: id.clone(),
            timestamp: now,
            // Snapshots already live in the knowledge store under `snapshot_<id>`.
            full_context: state.current.without_snapshots(),
            memory_stats: json!({
                "snapshots": state.current.memory_snapshots.len(),
                "workflows": state.current.active_workflows.len(),
                "knowledge": state.knowledge.len(),
            }),
        };

        write_json_atomic(&self.checkpoint_path(&id), &checkpoint)?;
        let value = serde_json::to_value(&checkpoint).context("failed to serialize checkpoint")?;
        Self::insert_knowledge(&mut state, &format!("checkpoint_{id}"), value, CHECKPOINT_IMPORTANCE);
        self.save_knowledge(&state)?;

        tracing::info!(checkpoint = %id, "context checkpoint created");
        Ok(id)
    }

    pub fn restore_checkpoint(&self, id: &str) -> Result<bool> {
        let path = self.checkpoint_path(id);
        let checkpoint = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read checkpoint '{}'", path.display()))?;
            Some(
                serde_json::from_str::<ContextCheckpoint>(&content)
                    .with_context(|| format!("checkpoint '{}' is not valid", path.display()))?,
            )
        } else {
            let state = self.lock();
            state
                .knowledge
                .get(&format!("checkpoint_{id}"))
                .and_then(|entry| serde_json::from_value(entry.value.clone()).ok())
        };

        let Some(checkpoint) = checkpoint else {
            tracing::warn!(checkpoint = %id, "checkpoint not found");
            return Ok(false);
        };
        self.lock().current = checkpoint.full_context;
        tracing::info!(checkpoint = %id, "context restored from checkpoint");
        Ok(true)
    }

    /// Checkpoint the session and record it as the last session.
    pub fn persist_all(&self) -> Result<String> {
        let checkpoint_id = self.create_checkpoint()?;
        let session_id = self.lock().current.session_id.clone();
        self.remember(
            "last_session",
            json!({
                "session_id": session_id,
                "checkpoint_id": checkpoint_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            CHECKPOINT_IMPORTANCE,
        )?;
        tracing::info!(checkpoint = %checkpoint_id, "context persisted");
        Ok(checkpoint_id)
    }

    pub fn restore_last_session(&self) -> Result<bool> {
        let Some(entry) = self.recall("last_session") else {
            return Ok(false);
        };
        let Some(checkpoint_id) = entry.value.get("checkpoint_id").and_then(Value::as_str) else {
            return Ok(false);
        };
        self.restore_checkpoint(checkpoint_id)
    }

    // -- identity -----------------------------------------------------------

    /// Load `export KEY=value` lines into `forge_<key>` context entries.
    pub fn load_identity_file(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read identity file '{}'", path.display()))?;

        let mut updates = Map::new();
        for line in content.lines() {
            let Some(assignment) = line.trim().strip_prefix("export ") else {
                continue;
            };
            let Some((key, value)) = assignment.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            updates.insert(
                format!("forge_{}", key.trim().to_lowercase()),
                Value::String(value.to_string()),
            );
        }

        let count = updates.len();
        self.update_context(updates)?;
        tracing::info!(path = %path.display(), entries = count, "identity file loaded");
        Ok(count)
    }

    pub fn identity(&self) -> Identity {
        let state = self.lock();
        let extra = |key: &str| {
            state
                .current
                .extra
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Identity {
            id: extra("forge_id").unwrap_or_else(|| state.current.identity_id.clone()),
            frequency: extra("forge_frequency").unwrap_or_else(|| state.current.frequency.clone()),
            session: state.current.session_id.clone(),
            mission: extra("forge_mission")
                .unwrap_or_else(|| "Coordinate agents, workflows, and memory.".to_string()),
        }
    }
}
