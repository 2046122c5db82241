//! Assembling an engine for a new run.
//!
//! A run is one pass over a DAG against a frozen design context, identified by
//! a `run_id` that tags every event the run emits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::graph::NodeRegistry;
use crate::core::invariants::validate_invariants;
use crate::engine::{Engine, EngineSettings};
use crate::io::config::OrchestratorConfig;
use crate::io::context_builder::ContextBuilder;
use crate::io::design::{
    DagDocument, DesignContext, load_dag, load_design_context, missing_design_nodes,
};
use crate::io::observer::{FanoutObserver, JsonlObserver, StateObserver};
use crate::io::task_memory::TaskMemory;
use crate::io::transport::Transport;

/// The static inputs of a run.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub dag: DagDocument,
    pub design: DesignContext,
    pub rtl_root: PathBuf,
}

impl RunInputs {
    /// Load and schema-validate both documents.
    pub fn load(dag_path: &Path, design_path: &Path, rtl_root: impl Into<PathBuf>) -> Result<Self> {
        let dag = load_dag(dag_path)?;
        let design = load_design_context(design_path)?;
        Ok(Self {
            dag,
            design,
            rtl_root: rtl_root.into(),
        })
    }

    /// Semantic problems that survive schema validation, all at once.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = validate_invariants(&self.dag.nodes);
        if !self.dag.nodes.is_empty() && self.dag.nodes.iter().all(|node| !node.deps.is_empty()) {
            problems.push("graph has no root nodes".to_string());
        }
        problems.extend(
            missing_design_nodes(&self.dag, &self.design)
                .into_iter()
                .map(|id| format!("node '{id}' is missing from the design context")),
        );
        problems
    }
}

pub struct PreparedRun<T: Transport + ?Sized> {
    pub run_id: String,
    pub engine: Engine<T>,
}

/// Build the engine for a run. Fails on any input problem.
///
/// `observers` receive every notification; a JSONL observer is added when
/// `events_path` is configured.
pub fn prepare_run<T: Transport + ?Sized>(
    cfg: &OrchestratorConfig,
    inputs: RunInputs,
    transport: Arc<T>,
    mut observers: Vec<Arc<dyn StateObserver>>,
) -> Result<PreparedRun<T>> {
    let problems = inputs.problems();
    if !problems.is_empty() {
        return Err(anyhow!("invalid run inputs:\n- {}", problems.join("\n- ")));
    }
    let run_id = format!("run-{}", Uuid::new_v4().simple());
    let registry = NodeRegistry::from_dag(&inputs.dag.nodes).context("build node registry")?;
    debug!(run_id = %run_id, roots = ?registry.roots(), "registry built");

    if let Some(path) = &cfg.events_path {
        observers.push(Arc::new(JsonlObserver::new(path, run_id.clone())));
    }
    let contexts = ContextBuilder::new(inputs.design, inputs.rtl_root);
    let memory = TaskMemory::new(&cfg.task_memory_root);
    let mut engine = Engine::new(
        registry,
        contexts,
        memory,
        transport,
        EngineSettings::from_config(cfg),
    );
    match observers.len() {
        0 => {}
        1 => {
            if let Some(only) = observers.pop() {
                engine = engine.with_observer(only);
            }
        }
        _ => engine = engine.with_observer(Arc::new(FanoutObserver::new(observers))),
    }
    info!(run_id = %run_id, nodes = engine.registry().len(), "run prepared");
    Ok(PreparedRun { run_id, engine })
}
