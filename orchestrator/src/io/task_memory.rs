//! Task Memory: the durable per-node, per-stage audit trail.
//!
//! Layout under the root:
//!
//! ```text
//! <node_id>/journal.jsonl
//! <node_id>/<stage_key>/task.json
//! <node_id>/<stage_key>/log.txt
//! <node_id>/<stage_key>/artifact_path.txt
//! <node_id>/<stage_key>/{reflection_insights,reflections,distilled_dataset,metrics}.json
//! ```
//!
//! Readers treat missing files as absent: workers write alongside the
//! orchestrator and a file may not exist yet.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::invariants::is_safe_node_id;
use crate::core::stage::{StageKey, StageKind};
use crate::core::types::NodeState;
use crate::io::context_builder::SourceFiles;
use crate::messages::{ResultMessage, TaskMessage};

pub const JOURNAL_FILE: &str = "journal.jsonl";

/// One line of a node's journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl JournalEntry {
    pub fn now(state: NodeState, stage: Option<StageKey>, note: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            state,
            stage,
            note,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagePaths {
    pub dir: PathBuf,
    pub task_path: PathBuf,
    pub log_path: PathBuf,
    pub artifact_path_path: PathBuf,
}

impl StagePaths {
    pub fn new(root: &Path, node_id: &str, stage: StageKey) -> Self {
        let dir = root.join(node_id).join(stage.to_string());
        Self {
            task_path: dir.join("task.json"),
            log_path: dir.join("log.txt"),
            artifact_path_path: dir.join("artifact_path.txt"),
            dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskMemory {
    root: PathBuf,
}

impl TaskMemory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_dir(&self, node_id: &str) -> PathBuf {
        self.root.join(node_id)
    }

    pub fn stage_paths(&self, node_id: &str, stage: StageKey) -> StagePaths {
        StagePaths::new(&self.root, node_id, stage)
    }

    /// Persist the published task so the trail shows exactly what was asked.
    pub fn record_task(&self, node_id: &str, stage: StageKey, task: &TaskMessage) -> Result<()> {
        let paths = self.ensure_stage(node_id, stage)?;
        write_json(&paths.task_path, task)
    }

    /// Persist every part of a result into its stage directory.
    pub fn record_result(
        &self,
        node_id: &str,
        stage: StageKey,
        result: &ResultMessage,
    ) -> Result<StagePaths> {
        debug!(node_id, stage = %stage, status = ?result.status, "recording result");
        let paths = self.ensure_stage(node_id, stage)?;
        write_text(&paths.log_path, &result.log_output)?;
        if let Some(artifact) = result.artifacts_path.as_deref() {
            write_text(&paths.artifact_path_path, artifact)?;
        }
        if let Some(insights) = &result.reflection_insights {
            write_json(&paths.dir.join("reflection_insights.json"), insights)?;
        }
        if let Some(reflections) = result.reflections.as_deref() {
            let value = serde_json::from_str::<Value>(reflections)
                .unwrap_or_else(|_| Value::String(reflections.to_string()));
            write_json(&paths.dir.join("reflections.json"), &value)?;
        }
        if let Some(dataset) = &result.distilled_dataset {
            write_json(&paths.dir.join("distilled_dataset.json"), dataset)?;
        }
        if let Some(metrics) = &result.metrics {
            write_json(&paths.dir.join("metrics.json"), metrics)?;
        }
        if let Some(touched) = &result.touched_files {
            write_json(&paths.dir.join("touched_files.json"), touched)?;
        }
        Ok(paths)
    }

    /// Copy RTL (and optionally the testbench) into the stage directory.
    ///
    /// Missing sources are skipped.
    pub fn snapshot_sources(
        &self,
        node_id: &str,
        stage: StageKey,
        sources: &SourceFiles,
        include_tb: bool,
    ) -> Result<Vec<PathBuf>> {
        let paths = self.ensure_stage(node_id, stage)?;
        let tb = include_tb.then_some(&sources.tb);
        let mut copied = Vec::new();
        for source in sources.rtl.iter().chain(tb) {
            let Some(name) = source.file_name() else {
                continue;
            };
            if !source.is_file() {
                continue;
            }
            let target = paths.dir.join(name);
            fs::copy(source, &target).with_context(|| {
                format!("copy {} to {}", source.display(), target.display())
            })?;
            copied.push(target);
        }
        Ok(copied)
    }

    pub fn append_journal(&self, node_id: &str, entry: &JournalEntry) -> Result<()> {
        let dir = self.writable_node_dir(node_id)?;
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(JOURNAL_FILE);
        let mut line = serde_json::to_string(entry).context("serialize journal entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))
    }

    pub fn read_journal(&self, node_id: &str) -> Result<Vec<JournalEntry>> {
        let path = self.node_dir(node_id).join(JOURNAL_FILE);
        let Some(contents) = read_optional(&path)? else {
            return Ok(Vec::new());
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
            })
            .collect()
    }

    /// Persisted stage keys of a node in structural order.
    pub fn stages(&self, node_id: &str) -> Result<Vec<StageKey>> {
        let dir = self.node_dir(node_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
        };
        let mut stages = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", dir.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(stage) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<StageKey>().ok())
            {
                stages.push(stage);
            }
        }
        stages.sort();
        Ok(stages)
    }

    pub fn read_log(&self, node_id: &str, stage: StageKey) -> Result<Option<String>> {
        read_optional(&self.stage_paths(node_id, stage).log_path)
    }

    pub fn read_artifact_path(&self, node_id: &str, stage: StageKey) -> Result<Option<String>> {
        Ok(read_optional(&self.stage_paths(node_id, stage).artifact_path_path)?
            .map(|text| text.trim().to_string()))
    }

    pub fn read_json(&self, node_id: &str, stage: StageKey, name: &str) -> Result<Option<Value>> {
        let path = self.stage_paths(node_id, stage).dir.join(name);
        read_optional(&path)?
            .map(|text| {
                serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
            })
            .transpose()
    }

    /// Directory for `kind` at `attempt`: the exact attempt, else the highest
    /// persisted attempt not above it, else the unattempted directory.
    pub fn latest_stage_dir(
        &self,
        node_id: &str,
        kind: StageKind,
        attempt: Option<u32>,
    ) -> Result<PathBuf> {
        let bare = self.stage_paths(node_id, StageKey::bare(kind)).dir;
        let Some(attempt) = attempt else {
            return Ok(bare);
        };
        let exact = self.stage_paths(node_id, StageKey::attempted(kind, attempt)).dir;
        if exact.is_dir() {
            return Ok(exact);
        }
        let best = self
            .stages(node_id)?
            .into_iter()
            .filter(|stage| stage.kind == kind)
            .filter_map(|stage| stage.attempt)
            .filter(|n| *n <= attempt)
            .max();
        Ok(match best {
            Some(n) => self.stage_paths(node_id, StageKey::attempted(kind, n)).dir,
            None => bare,
        })
    }

    /// Writes stay under the root: unsafe ids are refused.
    fn writable_node_dir(&self, node_id: &str) -> Result<PathBuf> {
        if !is_safe_node_id(node_id) {
            bail!("refusing to write Task Memory for node id '{node_id}'");
        }
        Ok(self.node_dir(node_id))
    }

    fn ensure_stage(&self, node_id: &str, stage: StageKey) -> Result<StagePaths> {
        self.writable_node_dir(node_id)?;
        let paths = self.stage_paths(node_id, stage);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create stage dir {}", paths.dir.display()))?;
        Ok(paths)
    }
}

/// Read a text file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}
