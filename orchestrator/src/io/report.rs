//! Human-readable audit trail of one node, rendered from Task Memory.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::io::task_memory::TaskMemory;

const TRAIL_TEMPLATE: &str = include_str!("../../templates/trail.md");

/// Logs longer than this are cut from the front; the tail is what matters.
const MAX_LOG_CHARS: usize = 4000;

const PAYLOAD_FILES: [&str; 5] = [
    "reflection_insights.json",
    "reflections.json",
    "distilled_dataset.json",
    "metrics.json",
    "touched_files.json",
];

#[derive(Debug, Serialize)]
struct JournalRow {
    at: String,
    state: String,
    stage: Option<String>,
    note: Option<String>,
}

#[derive(Debug, Serialize)]
struct StageSection {
    key: String,
    artifact_path: Option<String>,
    extras: Vec<&'static str>,
    log: Option<String>,
}

pub fn render_trail(memory: &TaskMemory, node_id: &str) -> Result<String> {
    let journal = memory
        .read_journal(node_id)
        .with_context(|| format!("read journal of {node_id}"))?;
    let final_state = journal.last().map(|entry| entry.state.to_string());
    let rows: Vec<JournalRow> = journal
        .into_iter()
        .map(|entry| JournalRow {
            at: entry.at.format("%Y-%m-%d %H:%M:%S").to_string(),
            state: entry.state.to_string(),
            stage: entry.stage.map(|s| s.to_string()),
            note: entry.note,
        })
        .collect();

    let mut stages = Vec::new();
    for stage in memory.stages(node_id)? {
        let dir = memory.stage_paths(node_id, stage).dir;
        let extras = PAYLOAD_FILES
            .into_iter()
            .filter(|name| dir.join(name).is_file())
            .collect();
        stages.push(StageSection {
            key: stage.to_string(),
            artifact_path: memory.read_artifact_path(node_id, stage)?,
            extras,
            log: memory
                .read_log(node_id, stage)?
                .map(|log| tail(log.trim_end(), MAX_LOG_CHARS))
                .filter(|log| !log.is_empty()),
        });
    }
    debug!(node_id, stages = stages.len(), "rendering trail");

    let mut env = Environment::new();
    env.add_template("trail", TRAIL_TEMPLATE)
        .context("load trail template")?;
    let template = env.get_template("trail")?;
    let rendered = template.render(context! {
        node_id => node_id,
        final_state => final_state,
        journal => rows,
        stages => stages,
    })?;
    Ok(rendered)
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max_chars).collect();
    format!("...\n{skipped}")
}
