//! Attempt and retry bookkeeping per node.
//!
//! The ledger owns three things for each node: the current attempt number,
//! per-failure-reason debug counters, and the pre-debug content fingerprint
//! used by the no-progress guard.

use std::collections::{BTreeMap, HashMap};

use crate::core::types::FailureReason;

/// Content hashes of a node's RTL and testbench sources.
///
/// A missing file hashes to the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fingerprint {
    pub rtl: String,
    pub tb: String,
}

/// Snapshot taken when a debug task is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugPending {
    pub before: Fingerprint,
    pub from_attempt: u32,
    pub reason: FailureReason,
}

/// Which sources a debug round actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentChange {
    pub rtl_changed: bool,
    pub tb_changed: bool,
}

impl DebugPending {
    pub fn compare(&self, after: &Fingerprint) -> ContentChange {
        ContentChange {
            rtl_changed: self.before.rtl != after.rtl,
            tb_changed: self.before.tb != after.tb,
        }
    }
}

#[derive(Debug, Default)]
struct NodeLedger {
    attempt: u32,
    retries: BTreeMap<FailureReason, u32>,
    pending: Option<DebugPending>,
}

/// Retry ledger for all nodes of one run.
#[derive(Debug)]
pub struct RetryLedger {
    max_debug_retries: u32,
    nodes: HashMap<String, NodeLedger>,
}

impl RetryLedger {
    pub fn new(max_debug_retries: u32) -> Self {
        Self {
            max_debug_retries,
            nodes: HashMap::new(),
        }
    }

    pub fn max_debug_retries(&self) -> u32 {
        self.max_debug_retries
    }

    /// Start a node fresh: attempt 1, no counters, no pending snapshot.
    pub fn reset_node(&mut self, node_id: &str) {
        self.nodes.insert(
            node_id.to_string(),
            NodeLedger {
                attempt: 1,
                ..NodeLedger::default()
            },
        );
    }

    pub fn attempt(&self, node_id: &str) -> u32 {
        self.nodes.get(node_id).map_or(1, |entry| entry.attempt)
    }

    pub fn set_attempt(&mut self, node_id: &str, attempt: u32) {
        self.entry(node_id).attempt = attempt;
    }

    pub fn retries(&self, node_id: &str, reason: FailureReason) -> u32 {
        self.nodes
            .get(node_id)
            .and_then(|entry| entry.retries.get(&reason).copied())
            .unwrap_or(0)
    }

    /// True while another debug round for `reason` fits in the budget.
    pub fn can_debug(&self, node_id: &str, reason: FailureReason) -> bool {
        self.retries(node_id, reason) < self.max_debug_retries
    }

    /// Count one debug round for `reason`, returning the new total.
    pub fn note_debug_round(&mut self, node_id: &str, reason: FailureReason) -> u32 {
        let counter = self.entry(node_id).retries.entry(reason).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Forgive prior failures of `reason` after a clean stage pass.
    pub fn clear(&mut self, node_id: &str, reason: FailureReason) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            entry.retries.remove(&reason);
        }
    }

    pub fn record_pending(&mut self, node_id: &str, pending: DebugPending) {
        self.entry(node_id).pending = Some(pending);
    }

    pub fn take_pending(&mut self, node_id: &str) -> Option<DebugPending> {
        self.nodes
            .get_mut(node_id)
            .and_then(|entry| entry.pending.take())
    }

    fn entry(&mut self, node_id: &str) -> &mut NodeLedger {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeLedger {
                attempt: 1,
                ..NodeLedger::default()
            })
    }
}
