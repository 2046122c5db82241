//! Best-effort observers of node state changes and run events.
//!
//! Observers are notified through [`notify_state`] and [`notify_event`], which
//! swallow both errors and panics. An observer can never block or fail a
//! transition.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::core::stage::StageKey;
use crate::core::types::{FailureReason, NodeState, TaskStatus, TaskType};

/// Structured run event for external sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum RunEvent {
    TaskPublished {
        node_id: String,
        stage: StageKey,
        task_id: Uuid,
        task_type: TaskType,
    },
    ResultReceived {
        node_id: String,
        stage: StageKey,
        task_id: Uuid,
        status: TaskStatus,
    },
    StateTransition {
        node_id: String,
        state: NodeState,
    },
    RetryDecision {
        node_id: String,
        reason: FailureReason,
        retries: u32,
        max: u32,
        allowed: bool,
    },
}

pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, _node_id: &str, _state: NodeState) -> Result<()> {
        Ok(())
    }

    fn on_event(&self, _event: &RunEvent) -> Result<()> {
        Ok(())
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StateObserver for NoopObserver {}

/// Appends one JSON object per line: `{ts, run_id, runtime, event_type, payload}`.
#[derive(Debug, Clone)]
pub struct JsonlObserver {
    path: PathBuf,
    run_id: String,
}

#[derive(Serialize)]
struct EventRecord<'a> {
    ts: DateTime<Utc>,
    run_id: &'a str,
    runtime: &'static str,
    #[serde(flatten)]
    event: &'a RunEvent,
}

impl JsonlObserver {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            run_id: run_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &RunEvent) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let record = EventRecord {
            ts: Utc::now(),
            run_id: &self.run_id,
            runtime: "orchestrator",
            event,
        };
        let mut line = serde_json::to_string(&record).context("serialize run event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

impl StateObserver for JsonlObserver {
    fn on_state_change(&self, node_id: &str, state: NodeState) -> Result<()> {
        self.append(&RunEvent::StateTransition {
            node_id: node_id.to_string(),
            state,
        })
    }

    fn on_event(&self, event: &RunEvent) -> Result<()> {
        if matches!(event, RunEvent::StateTransition { .. }) {
            return Ok(());
        }
        self.append(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub node_id: String,
    pub state: NodeState,
}

/// Forwards state changes to a broadcast channel, e.g. for a live UI.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: broadcast::Sender<StateChange>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<StateChange>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }
}

impl StateObserver for ChannelObserver {
    fn on_state_change(&self, node_id: &str, state: NodeState) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(StateChange {
            node_id: node_id.to_string(),
            state,
        });
        Ok(())
    }
}

/// Fans every notification out to several observers.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn StateObserver>>,
}

impl FanoutObserver {
    pub fn new(observers: Vec<Arc<dyn StateObserver>>) -> Self {
        Self { observers }
    }
}

impl StateObserver for FanoutObserver {
    fn on_state_change(&self, node_id: &str, state: NodeState) -> Result<()> {
        for observer in &self.observers {
            notify_state(observer.as_ref(), node_id, state);
        }
        Ok(())
    }

    fn on_event(&self, event: &RunEvent) -> Result<()> {
        for observer in &self.observers {
            notify_event(observer.as_ref(), event);
        }
        Ok(())
    }
}

pub fn notify_state(observer: &dyn StateObserver, node_id: &str, state: NodeState) {
    match catch_unwind(AssertUnwindSafe(|| observer.on_state_change(node_id, state))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(node_id, state = %state, error = %err, "state observer failed"),
        Err(_) => warn!(node_id, state = %state, "state observer panicked"),
    }
}

pub fn notify_event(observer: &dyn StateObserver, event: &RunEvent) {
    match catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "event observer failed"),
        Err(_) => warn!("event observer panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::Value;

    struct Failing;

    impl StateObserver for Failing {
        fn on_state_change(&self, _node_id: &str, _state: NodeState) -> Result<()> {
            Err(anyhow!("ui offline"))
        }
    }

    struct Panicking;

    impl StateObserver for Panicking {
        fn on_state_change(&self, _node_id: &str, _state: NodeState) -> Result<()> {
            panic!("observer bug");
        }

        fn on_event(&self, _event: &RunEvent) -> Result<()> {
            panic!("observer bug");
        }
    }

    #[test]
    fn failures_and_panics_are_swallowed() {
        notify_state(&Failing, "alu", NodeState::Linting);
        notify_state(&Panicking, "alu", NodeState::Linting);
        notify_event(
            &Panicking,
            &RunEvent::StateTransition {
                node_id: "alu".to_string(),
                state: NodeState::Done,
            },
        );
    }

    #[test]
    fn jsonl_observer_writes_tagged_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events").join("run.jsonl");
        let observer = JsonlObserver::new(&path, "run-1");
        notify_state(&observer, "alu", NodeState::Simulating);
        notify_event(
            &observer,
            &RunEvent::RetryDecision {
                node_id: "alu".to_string(),
                reason: FailureReason::Sim,
                retries: 1,
                max: 2,
                allowed: true,
            },
        );

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "state_transition");
        assert_eq!(lines[0]["payload"]["state"], "SIMULATING");
        assert_eq!(lines[0]["run_id"], "run-1");
        assert_eq!(lines[1]["event_type"], "retry_decision");
        assert_eq!(lines[1]["payload"]["reason"], "sim");
    }

    #[test]
    fn channel_observer_forwards_state_changes() {
        let (observer, mut rx) = ChannelObserver::new(8);
        notify_state(&observer, "alu", NodeState::Done);
        let change = rx.try_recv().expect("change");
        assert_eq!(
            change,
            StateChange {
                node_id: "alu".to_string(),
                state: NodeState::Done,
            }
        );
    }

    #[test]
    fn fanout_isolates_bad_observers() {
        let (channel, mut rx) = ChannelObserver::new(8);
        let fanout = FanoutObserver::new(vec![Arc::new(Panicking), Arc::new(channel)]);
        notify_state(&fanout, "alu", NodeState::Failed);
        assert_eq!(rx.try_recv().expect("change").state, NodeState::Failed);
    }
}
