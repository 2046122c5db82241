//! Semantic invariants of the design DAG not expressible via JSON Schema.

use std::collections::{BTreeMap, HashSet};

use crate::core::graph::DagNode;

/// Node ids name directories under Task Memory: one path segment of
/// `[A-Za-z0-9_][A-Za-z0-9_.-]*`, so never `.`, `..` or a nested path.
pub fn is_safe_node_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Check semantic invariants not expressible in JSON Schema:
/// - Non-empty, unique, path-safe ids
/// - No self dependencies
/// - Every dependency names a declared node
/// - The graph is acyclic
pub fn validate_invariants(nodes: &[DagNode]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for node in nodes {
        if node.id.trim().is_empty() {
            errors.push("node id must be non-empty".to_string());
        } else if !is_safe_node_id(&node.id) {
            errors.push(format!(
                "node id '{}' must be a single path segment of letters, digits, '_', '.' or '-'",
                node.id
            ));
        }
        if !seen.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
    }

    for node in nodes {
        for dep in &node.deps {
            if dep == &node.id {
                errors.push(format!("{}: depends on itself", node.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!("{}: unknown dependency '{}'", node.id, dep));
            }
        }
    }

    if errors.is_empty() {
        let stuck = unresolvable_nodes(nodes);
        if !stuck.is_empty() {
            errors.push(format!("dependency cycle through: {}", stuck.join(", ")));
        }
    }
    errors
}

/// Nodes left over after repeatedly peeling off nodes whose deps are peeled.
fn unresolvable_nodes(nodes: &[DagNode]) -> Vec<String> {
    let mut remaining: BTreeMap<&str, HashSet<&str>> = nodes
        .iter()
        .map(|node| {
            let deps = node.deps.iter().map(String::as_str).collect();
            (node.id.as_str(), deps)
        })
        .collect();

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|dep| !remaining.contains_key(dep)))
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            remaining.remove(id);
        }
    }

    remaining.keys().map(|id| (*id).to_string()).collect()
}
