//! Test-only fixtures: a throwaway design on disk and a scripted harness that
//! plays the worker side against the in-memory broker.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::graph::{DagNode, NodeRegistry};
use crate::core::stage::StageKind;
use crate::core::types::TaskStatus;
use crate::engine::{Dispatch, Engine, EngineSettings};
use crate::io::context_builder::ContextBuilder;
use crate::io::design::{DagDocument, DesignContext};
use crate::io::task_memory::TaskMemory;
use crate::io::transport::{AGENT_QUEUE, InMemoryBroker, PROCESS_QUEUE, SIMULATION_QUEUE, Transport};
use crate::messages::{ResultMessage, TaskMessage};

/// A design with one RTL file per node under a temp `rtl/` root.
pub struct DesignFixture {
    temp: TempDir,
    dag: Vec<DagNode>,
    design: BTreeMap<String, Value>,
    hidden: BTreeSet<String>,
}

impl Default for DesignFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl DesignFixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("rtl")).expect("create rtl root");
        Self {
            temp,
            dag: Vec::new(),
            design: BTreeMap::new(),
            hidden: BTreeSet::new(),
        }
    }

    /// Add a node with full verification scope and a stub module on disk.
    pub fn node(mut self, id: &str, deps: &[&str]) -> Self {
        self.dag.push(DagNode {
            id: id.to_string(),
            deps: deps.iter().map(|dep| dep.to_string()).collect(),
        });
        self.design.insert(
            id.to_string(),
            json!({
                "rtl_file": format!("{id}.sv"),
                "interface": {"signals": [{"name": "clk", "direction": "input"}]},
            }),
        );
        self.write_rtl(id, &format!("module {id}; endmodule\n"));
        self
    }

    pub fn scope(self, id: &str, scope: &str) -> Self {
        self.with_key(id, "verification_scope", json!(scope))
    }

    pub fn acceptance(self, id: &str, block: Value) -> Self {
        self.with_key(id, "acceptance", block)
    }

    /// Keep `id` in the DAG but drop it from the design context.
    pub fn without_design(mut self, id: &str) -> Self {
        self.hidden.insert(id.to_string());
        self
    }

    fn with_key(mut self, id: &str, key: &str, value: Value) -> Self {
        let entry = self.design.get_mut(id).expect("node added first");
        entry[key] = value;
        self
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn rtl_root(&self) -> PathBuf {
        self.temp.path().join("rtl")
    }

    pub fn memory_root(&self) -> PathBuf {
        self.temp.path().join("memory")
    }

    pub fn rtl_path(&self, id: &str) -> PathBuf {
        self.rtl_root().join(format!("{id}.sv"))
    }

    pub fn tb_path(&self, id: &str) -> PathBuf {
        self.rtl_root().join(format!("{id}_tb.sv"))
    }

    pub fn write_rtl(&self, id: &str, contents: &str) {
        fs::write(self.rtl_path(id), contents).expect("write rtl");
    }

    pub fn write_tb(&self, id: &str, contents: &str) {
        fs::write(self.tb_path(id), contents).expect("write tb");
    }

    pub fn dag(&self) -> DagDocument {
        DagDocument {
            nodes: self.dag.clone(),
        }
    }

    pub fn design_json(&self) -> Value {
        let nodes: serde_json::Map<String, Value> = self
            .design
            .iter()
            .filter(|(id, _)| !self.hidden.contains(*id))
            .map(|(id, node)| (id.clone(), node.clone()))
            .collect();
        json!({
            "design_context_hash": "fixture",
            "top_module": self.dag.first().map(|node| node.id.clone()),
            "nodes": nodes,
        })
    }

    pub fn design(&self) -> DesignContext {
        serde_json::from_value(self.design_json()).expect("fixture design context")
    }

    /// Write `dag.json` and `design_context.json` next to the RTL root.
    pub fn write_inputs(&self) -> (PathBuf, PathBuf) {
        let dag_path = self.root().join("dag.json");
        let design_path = self.root().join("design_context.json");
        let dag = serde_json::to_string_pretty(&self.dag()).expect("serialize dag");
        fs::write(&dag_path, dag).expect("write dag");
        let design = serde_json::to_string_pretty(&self.design_json()).expect("serialize design");
        fs::write(&design_path, design).expect("write design");
        (dag_path, design_path)
    }

    pub fn engine<T: Transport + ?Sized>(
        &self,
        transport: Arc<T>,
        settings: EngineSettings,
    ) -> Engine<T> {
        let registry = NodeRegistry::from_dag(&self.dag).expect("fixture dag");
        let contexts = ContextBuilder::new(self.design(), self.rtl_root());
        Engine::new(
            registry,
            contexts,
            TaskMemory::new(self.memory_root()),
            transport,
            settings,
        )
    }
}

/// Engine plus broker, with the test playing every worker by hand.
pub struct Harness {
    pub fixture: DesignFixture,
    pub broker: Arc<InMemoryBroker>,
    pub engine: Engine<InMemoryBroker>,
}

impl Harness {
    pub async fn start(fixture: DesignFixture, settings: EngineSettings) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let mut engine = fixture.engine(Arc::clone(&broker), settings);
        engine.start().await.expect("start engine");
        Self {
            fixture,
            broker,
            engine,
        }
    }

    /// Pop the next published task from any worker queue.
    pub fn next_task(&self) -> Option<TaskMessage> {
        [AGENT_QUEUE, PROCESS_QUEUE, SIMULATION_QUEUE]
            .into_iter()
            .find_map(|queue| self.broker.try_take_task(queue).expect("decode task"))
    }

    pub async fn reply(&mut self, result: ResultMessage) -> Dispatch {
        self.engine.dispatch(result).await
    }

    /// Answer the next task with `status` and return it.
    pub async fn reply_next(&mut self, status: TaskStatus) -> TaskMessage {
        let task = self.next_task().expect("a published task");
        let log = format!("scripted {status:?}");
        let result = match status {
            TaskStatus::Success => ResultMessage::success(&task, log),
            TaskStatus::Failure => ResultMessage::failure(&task, log),
        };
        self.reply(result).await;
        task
    }

    /// Every task published for `node_id`, in publish order.
    pub fn published_for(&self, node_id: &str) -> Vec<TaskMessage> {
        self.broker
            .published()
            .into_iter()
            .filter(|task| task.context.node_id == node_id)
            .collect()
    }

    pub fn stages_for(&self, node_id: &str) -> Vec<StageKind> {
        self.published_for(node_id)
            .iter()
            .map(|task| StageKind::from_task_type(task.task_type))
            .collect()
    }
}
