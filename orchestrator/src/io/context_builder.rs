//! Builds the per-node task context from the frozen design context.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::io::design::{DesignContext, DesignNode};
use crate::messages::{FULL_SCOPE, TaskContext};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("node '{0}' is not described by the design context")]
    UnknownNode(String),
}

/// Source files a node's workers read and the debug agent rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFiles {
    pub rtl: Vec<PathBuf>,
    pub tb: PathBuf,
}

/// Resolves design-context entries into task contexts. Read-only.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    design: DesignContext,
    rtl_root: PathBuf,
}

impl ContextBuilder {
    pub fn new(design: DesignContext, rtl_root: impl Into<PathBuf>) -> Self {
        Self {
            design,
            rtl_root: rtl_root.into(),
        }
    }

    pub fn design(&self) -> &DesignContext {
        &self.design
    }

    pub fn rtl_root(&self) -> &Path {
        &self.rtl_root
    }

    /// Declared verification scope; `full` when unset.
    pub fn verification_scope(&self, node_id: &str) -> Result<&str, ContextError> {
        let node = self.node(node_id)?;
        Ok(node.verification_scope.as_deref().unwrap_or(FULL_SCOPE))
    }

    pub fn source_files(&self, node_id: &str) -> Result<SourceFiles, ContextError> {
        let node = self.node(node_id)?;
        let primary = self.rtl_root.join(&node.rtl_file);
        let rtl = if node.rtl_files.is_empty() {
            vec![primary.clone()]
        } else {
            node.rtl_files
                .iter()
                .map(|file| self.rtl_root.join(file))
                .collect()
        };
        let tb = match node.testbench_file.as_deref().filter(|f| !f.is_empty()) {
            Some(file) => self.rtl_root.join(file),
            None => primary.with_file_name(format!("{node_id}_tb.sv")),
        };
        Ok(SourceFiles { rtl, tb })
    }

    /// Task context for `node_id`; stage keys such as `attempt` are left unset.
    pub fn build(&self, node_id: &str) -> Result<TaskContext, ContextError> {
        let node = self.node(node_id)?;
        let sources = self.source_files(node_id)?;

        let mut ctx = TaskContext::new(node_id);
        ctx.rtl_path = path_string(&self.rtl_root.join(&node.rtl_file));
        ctx.rtl_paths = sources.rtl.iter().map(|path| path_string(path)).collect();
        ctx.tb_path = path_string(&sources.tb);
        ctx.interface = node.interface.clone();
        ctx.design_context_hash = self.design.design_context_hash.clone();
        ctx.verification_scope = Some(self.verification_scope(node_id)?.to_string());

        let mut extra = node.extra.clone();
        extra.insert(
            "coverage_goals".to_string(),
            Value::Object(node.coverage_goals.clone()),
        );
        extra.insert("clocking".to_string(), Value::Object(node.clocking.clone()));
        extra.insert(
            "children".to_string(),
            Value::from(node.children.clone()),
        );
        extra.insert(
            "child_interfaces".to_string(),
            Value::Object(self.child_interfaces(node)),
        );
        let connections = node
            .connections
            .clone()
            .unwrap_or_else(|| self.design.connections.clone());
        extra.insert("connections".to_string(), Value::Array(connections));
        extra.insert(
            "library_refs".to_string(),
            Value::Object(self.design.standard_library.clone()),
        );
        extra.insert(
            "top_module".to_string(),
            self.design
                .top_module
                .clone()
                .map_or(Value::Null, Value::String),
        );
        ctx.extra = extra;
        Ok(ctx)
    }

    fn child_interfaces(&self, node: &DesignNode) -> Map<String, Value> {
        node.children
            .iter()
            .filter_map(|child| {
                self.design
                    .node(child)
                    .map(|child_node| (child.clone(), child_node.interface.clone()))
            })
            .collect()
    }

    fn node(&self, node_id: &str) -> Result<&DesignNode, ContextError> {
        self.design
            .node(node_id)
            .ok_or_else(|| ContextError::UnknownNode(node_id.to_string()))
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
