//! Dependency graph and per-node lifecycle state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::invariants::validate_invariants;
use crate::core::types::NodeState;

/// One DAG entry as it appears in the input document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNode {
    pub id: String,
    #[serde(default)]
    pub deps: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph has no root nodes (every node has dependencies)")]
    NoRoots,
    #[error("invalid graph:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("node '{node}' is already {state}")]
    AlreadyTerminal { node: String, state: NodeState },
}

#[derive(Debug, Clone)]
struct NodeEntry {
    deps: BTreeSet<String>,
    state: NodeState,
}

/// Node registry: the DAG plus each node's current state.
///
/// Iteration order is by node id so scheduling is deterministic.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, NodeEntry>,
}

impl NodeRegistry {
    /// Build a registry with every node `PENDING`.
    pub fn from_dag(nodes: &[DagNode]) -> Result<Self, GraphError> {
        if !nodes.is_empty() && nodes.iter().all(|node| !node.deps.is_empty()) {
            return Err(GraphError::NoRoots);
        }
        let errors = validate_invariants(nodes);
        if !errors.is_empty() {
            return Err(GraphError::Invalid(errors));
        }
        let nodes = nodes
            .iter()
            .map(|node| {
                let entry = NodeEntry {
                    deps: node.deps.iter().cloned().collect(),
                    state: NodeState::Pending,
                };
                (node.id.clone(), entry)
            })
            .collect();
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.get(node_id).map(|entry| entry.state)
    }

    pub fn deps(&self, node_id: &str) -> Option<&BTreeSet<String>> {
        self.nodes.get(node_id).map(|entry| &entry.deps)
    }

    /// Move a node to `state`. Terminal states are final.
    pub fn set_state(&mut self, node_id: &str, state: NodeState) -> Result<(), GraphError> {
        let entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))?;
        if entry.state.is_terminal() {
            return Err(GraphError::AlreadyTerminal {
                node: node_id.to_string(),
                state: entry.state,
            });
        }
        entry.state = state;
        Ok(())
    }

    /// Nodes with no dependencies at all.
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, entry)| entry.deps.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pending nodes whose every dependency is `DONE`.
    pub fn ready(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, entry)| entry.state == NodeState::Pending)
            .filter(|(_, entry)| {
                entry
                    .deps
                    .iter()
                    .all(|dep| self.state(dep) == Some(NodeState::Done))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pending nodes that list `node_id` as a direct dependency.
    pub fn pending_dependents(&self, node_id: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, entry)| entry.state == NodeState::Pending && entry.deps.contains(node_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|entry| entry.state.is_terminal())
    }

    pub fn non_terminal(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, entry)| !entry.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Snapshot of every node's state, ordered by id.
    pub fn states(&self) -> BTreeMap<String, NodeState> {
        self.nodes
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: &[&str]) -> DagNode {
        DagNode {
            id: id.to_string(),
            deps: deps.iter().map(|dep| (*dep).to_string()).collect(),
        }
    }

    fn chain() -> NodeRegistry {
        NodeRegistry::from_dag(&[node("a", &[]), node("b", &["a"]), node("c", &["b"])])
            .expect("valid dag")
    }

    #[test]
    fn rejects_graph_without_roots() {
        let err = NodeRegistry::from_dag(&[node("a", &["b"]), node("b", &["a"])])
            .expect_err("no roots");
        assert_eq!(err, GraphError::NoRoots);
    }

    #[test]
    fn empty_graph_is_valid_and_complete() {
        let registry = NodeRegistry::from_dag(&[]).expect("empty");
        assert!(registry.is_empty());
        assert!(registry.all_terminal());
        assert!(registry.ready().is_empty());
    }

    #[test]
    fn readiness_requires_done_dependencies() {
        let mut registry = chain();
        assert_eq!(registry.ready(), vec!["a".to_string()]);
        registry.set_state("a", NodeState::Implementing).expect("set");
        assert!(registry.ready().is_empty());
        registry.set_state("a", NodeState::Done).expect("set");
        assert_eq!(registry.ready(), vec!["b".to_string()]);
    }

    #[test]
    fn failed_dependency_never_makes_dependents_ready() {
        let mut registry = chain();
        registry.set_state("a", NodeState::Failed).expect("set");
        assert!(registry.ready().is_empty());
        assert_eq!(registry.pending_dependents("a"), vec!["b".to_string()]);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut registry = chain();
        registry.set_state("a", NodeState::Done).expect("set");
        let err = registry
            .set_state("a", NodeState::Linting)
            .expect_err("terminal");
        assert!(matches!(err, GraphError::AlreadyTerminal { .. }));
        assert!(matches!(
            registry.set_state("zzz", NodeState::Done),
            Err(GraphError::UnknownNode(_))
        ));
    }

    #[test]
    fn non_terminal_lists_stragglers() {
        let mut registry = chain();
        registry.set_state("a", NodeState::Done).expect("set");
        registry.set_state("b", NodeState::Failed).expect("set");
        assert_eq!(registry.non_terminal(), vec!["c".to_string()]);
        assert!(!registry.all_terminal());
        assert_eq!(registry.roots(), vec!["a".to_string()]);
    }
}
