//! Loading of the static run inputs: the DAG and the design context.
//!
//! Both documents are validated against embedded JSON Schemas before they are
//! deserialized. Semantic graph checks live in `core::invariants`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::acceptance::AcceptanceCriteria;
use crate::core::graph::DagNode;
use crate::io::hashing::hash_json;

const DAG_SCHEMA: &str = include_str!("../../schemas/dag.schema.json");
const DESIGN_CONTEXT_SCHEMA: &str = include_str!("../../schemas/design_context.schema.json");

/// `{"nodes": [{"id": .., "deps": [..]}]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagDocument {
    pub nodes: Vec<DagNode>,
}

/// Frozen per-run description of every design node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignContext {
    /// Always populated after [`load_design_context`]; derived when absent.
    #[serde(default)]
    pub design_context_hash: String,
    #[serde(default)]
    pub top_module: Option<String>,
    pub nodes: BTreeMap<String, DesignNode>,
    #[serde(default)]
    pub connections: Vec<Value>,
    #[serde(default)]
    pub standard_library: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignNode {
    pub rtl_file: String,
    #[serde(default)]
    pub rtl_files: Vec<String>,
    #[serde(default)]
    pub testbench_file: Option<String>,
    pub interface: Value,
    #[serde(default)]
    pub coverage_goals: Map<String, Value>,
    #[serde(default)]
    pub clocking: Map<String, Value>,
    #[serde(default)]
    pub verification_scope: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub connections: Option<Vec<Value>>,
    /// Keys such as `acceptance` and `verification`, forwarded verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DesignNode {
    /// Parsed `acceptance` block; absent means no criteria.
    pub fn acceptance(&self) -> Result<AcceptanceCriteria> {
        match self.extra.get("acceptance") {
            Some(raw) => serde_json::from_value(raw.clone()).context("parse acceptance criteria"),
            None => Ok(AcceptanceCriteria::default()),
        }
    }
}

impl DesignContext {
    pub fn node(&self, node_id: &str) -> Option<&DesignNode> {
        self.nodes.get(node_id)
    }
}

/// Load and schema-validate the DAG document.
pub fn load_dag(path: &Path) -> Result<DagDocument> {
    debug!(path = %path.display(), "loading dag");
    let value = read_json(path)?;
    validate_schema("dag", DAG_SCHEMA, &value)?;
    serde_json::from_value(value).with_context(|| format!("deserialize dag {}", path.display()))
}

/// Load and schema-validate the design context, deriving its hash if absent.
pub fn load_design_context(path: &Path) -> Result<DesignContext> {
    debug!(path = %path.display(), "loading design context");
    let value = read_json(path)?;
    validate_schema("design context", DESIGN_CONTEXT_SCHEMA, &value)?;
    let derived = value.get("nodes").map(hash_json).unwrap_or_default();
    let mut ctx: DesignContext = serde_json::from_value(value)
        .with_context(|| format!("deserialize design context {}", path.display()))?;
    if ctx.design_context_hash.is_empty() {
        debug!(hash = %derived, "derived design context hash");
        ctx.design_context_hash = derived;
    }
    Ok(ctx)
}

/// DAG nodes that the design context does not describe.
pub fn missing_design_nodes(dag: &DagDocument, design: &DesignContext) -> Vec<String> {
    dag.nodes
        .iter()
        .filter(|node| !design.nodes.contains_key(&node.id))
        .map(|node| node.id.clone())
        .collect()
}

fn read_json(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn validate_schema(label: &str, schema: &str, instance: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(schema).with_context(|| format!("parse {label} schema"))?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid {label} schema: {err}"))?;
    if !compiled.is_valid(instance) {
        let messages = compiled
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "{label} schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}
