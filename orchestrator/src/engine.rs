//! The state-machine engine.
//!
//! The engine owns the node registry, the retry ledger and the per-node
//! outstanding-task maps. It is driven by one control loop and never shares
//! mutable state, so nothing here takes a lock. Each call to
//! [`Engine::dispatch`] resolves one result to `(node, stage)`, persists it,
//! applies the transition table and publishes whatever comes next.
//!
//! Processing errors never escape `dispatch`: they fail the owning node and
//! the rest of the graph keeps going.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::graph::{GraphError, NodeRegistry};
use crate::core::ledger::{DebugPending, Fingerprint, RetryLedger};
use crate::core::stage::{StageKey, StageKind};
use crate::core::transitions::{
    Finish, NodeFacts, Outcome, Transition, cleared_reason, debug_produced_patch,
    next_transition, route_after_debug,
};
use crate::core::types::{FailCause, FailureReason, NodeState};
use crate::io::config::OrchestratorConfig;
use crate::io::context_builder::ContextBuilder;
use crate::io::hashing::{hash_file, hash_files};
use crate::io::observer::{NoopObserver, RunEvent, StateObserver, notify_event, notify_state};
use crate::io::task_memory::{JournalEntry, TaskMemory};
use crate::io::transport::Transport;
use crate::messages::{ResultMessage, TaskMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_debug_retries: u32,
    pub snapshot_failure_sources: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_debug_retries: cfg.max_debug_retries,
            snapshot_failure_sources: cfg.snapshot_failure_sources,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("stage {stage} of node '{node_id}' was already issued")]
    StageKeyReused { node_id: String, stage: StageKey },
    #[error("node '{0}' has not been started")]
    NotStarted(String),
}

/// What [`Engine::dispatch`] did with a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Applied { node_id: String, stage: StageKey },
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No node was started with this correlation id.
    UnknownCorrelation,
    /// The task id was never issued for the node.
    UnknownTask,
    /// The task was already resolved by an earlier delivery.
    Duplicate,
    /// The node finalized before this result arrived.
    NodeTerminal,
}

#[derive(Debug)]
struct NodeRun {
    correlation_id: Uuid,
    issued: BTreeMap<StageKey, TaskMessage>,
    resolved: HashSet<Uuid>,
    tb_generated: bool,
    resume_after_lint: Option<StageKind>,
}

impl NodeRun {
    fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            issued: BTreeMap::new(),
            resolved: HashSet::new(),
            tb_generated: false,
            resume_after_lint: None,
        }
    }

    fn is_outstanding(&self, task: &TaskMessage) -> bool {
        !self.resolved.contains(&task.task_id)
    }

    /// Resolve `task_id` against this node's outstanding tasks.
    fn resolve(&mut self, task_id: Uuid) -> Result<(StageKey, TaskMessage), IgnoreReason> {
        if self.resolved.contains(&task_id) {
            return Err(IgnoreReason::Duplicate);
        }
        let (stage, task) = self
            .issued
            .iter()
            .find(|(_, task)| task.task_id == task_id)
            .ok_or(IgnoreReason::UnknownTask)?;
        let found = (*stage, task.clone());
        self.resolved.insert(task_id);
        Ok(found)
    }
}

pub struct Engine<T: Transport + ?Sized> {
    registry: NodeRegistry,
    ledger: RetryLedger,
    contexts: ContextBuilder,
    memory: TaskMemory,
    transport: Arc<T>,
    observer: Arc<dyn StateObserver>,
    snapshot_failure_sources: bool,
    runs: BTreeMap<String, NodeRun>,
    by_correlation: HashMap<Uuid, String>,
    published: usize,
}

impl<T: Transport + ?Sized> Engine<T> {
    pub fn new(
        registry: NodeRegistry,
        contexts: ContextBuilder,
        memory: TaskMemory,
        transport: Arc<T>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            ledger: RetryLedger::new(settings.max_debug_retries),
            contexts,
            memory,
            transport,
            observer: Arc::new(NoopObserver),
            snapshot_failure_sources: settings.snapshot_failure_sources,
            runs: BTreeMap::new(),
            by_correlation: HashMap::new(),
            published: 0,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn transport(&self) -> Arc<T> {
        Arc::clone(&self.transport)
    }

    pub fn memory(&self) -> &TaskMemory {
        &self.memory
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.registry.state(node_id)
    }

    pub fn states(&self) -> BTreeMap<String, NodeState> {
        self.registry.states()
    }

    pub fn is_complete(&self) -> bool {
        self.registry.all_terminal()
    }

    /// Tasks published since the run started, across all nodes.
    pub fn published_count(&self) -> usize {
        self.published
    }

    pub fn attempt(&self, node_id: &str) -> u32 {
        self.ledger.attempt(node_id)
    }

    pub fn retries(&self, node_id: &str, reason: FailureReason) -> u32 {
        self.ledger.retries(node_id, reason)
    }

    /// Stage keys of a node's unresolved tasks.
    pub fn outstanding(&self, node_id: &str) -> Vec<StageKey> {
        self.runs
            .get(node_id)
            .map(|run| {
                run.issued
                    .iter()
                    .filter(|(_, task)| run.is_outstanding(task))
                    .map(|(stage, _)| *stage)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Start every root node. An empty graph starts nothing.
    pub async fn start(&mut self) -> Result<()> {
        if self.registry.is_empty() {
            info!("empty graph; nothing to schedule");
            return Ok(());
        }
        if self.registry.roots().is_empty() {
            return Err(GraphError::NoRoots.into());
        }
        info!(nodes = self.registry.len(), "starting run");
        self.start_ready().await;
        Ok(())
    }

    /// Apply one result. Never fails; problems fail the owning node.
    pub async fn dispatch(&mut self, result: ResultMessage) -> Dispatch {
        let Some(node_id) = self.by_correlation.get(&result.correlation_id).cloned() else {
            debug!(task_id = %result.task_id, "result for unknown correlation id");
            return Dispatch::Ignored(IgnoreReason::UnknownCorrelation);
        };
        let Some(run) = self.runs.get_mut(&node_id) else {
            return Dispatch::Ignored(IgnoreReason::UnknownCorrelation);
        };
        let (stage, task) = match run.resolve(result.task_id) {
            Ok(found) => found,
            Err(reason) => {
                debug!(node_id = %node_id, task_id = %result.task_id, ?reason, "ignoring result");
                return Dispatch::Ignored(reason);
            }
        };
        if self.registry.state(&node_id).is_none_or(NodeState::is_terminal) {
            debug!(node_id = %node_id, stage = %stage, "result for finalized node");
            return Dispatch::Ignored(IgnoreReason::NodeTerminal);
        }

        info!(node_id = %node_id, stage = %stage, status = ?result.status, "result received");
        notify_event(
            self.observer.as_ref(),
            &RunEvent::ResultReceived {
                node_id: node_id.clone(),
                stage,
                task_id: result.task_id,
                status: result.status,
            },
        );
        if let Err(err) = self.apply(&node_id, stage, &task, &result).await {
            let msg = format!("{err:#}");
            error!(node_id = %node_id, stage = %stage, error = %msg, "result processing failed");
            self.fail_node(&node_id, FailCause::Internal(msg));
        }
        Dispatch::Applied { node_id, stage }
    }

    async fn apply(
        &mut self,
        node_id: &str,
        stage: StageKey,
        task: &TaskMessage,
        result: &ResultMessage,
    ) -> Result<()> {
        let outcome = Outcome::from(result.status);
        self.memory
            .record_result(node_id, stage, result)
            .with_context(|| format!("persist {stage} result of {node_id}"))?;
        if outcome == Outcome::Failure {
            self.snapshot_failure(node_id, stage);
        }

        let run = self.run_mut(node_id)?;
        if outcome == Outcome::Success && stage.kind == StageKind::Tb {
            run.tb_generated = true;
        }
        let facts = NodeFacts {
            full_scope: task.context.is_full_scope(),
            tb_generated: run.tb_generated,
            resume_after_lint: run.resume_after_lint,
        };
        if outcome == Outcome::Success && stage.kind == StageKind::Lint {
            run.resume_after_lint = None;
        }
        if let (Outcome::Success, Some(reason)) = (outcome, cleared_reason(stage.kind)) {
            if self.ledger.retries(node_id, reason) > 0 {
                debug!(node_id, reason = %reason, "retry counter cleared");
            }
            self.ledger.clear(node_id, reason);
        }

        if stage.kind == StageKind::Sim && outcome == Outcome::Failure && stage.attempt.is_none() {
            warn!(node_id, "simulation failed without an attempt number");
            self.fail_node(node_id, FailCause::MissingAttempt(stage.kind.to_string()));
            return Ok(());
        }

        match next_transition(stage.kind, outcome, facts) {
            Transition::Advance(kind) => self.advance(node_id, kind, None).await,
            Transition::Debug(reason) => self.request_debug(node_id, reason).await,
            Transition::ResolveDebug => self.resolve_debug(node_id, outcome, result).await,
            Transition::Finish(Finish::Done) => self.finish_done(node_id).await,
            Transition::Finish(Finish::Failed(cause)) => {
                self.fail_node(node_id, cause);
                Ok(())
            }
        }
    }

    async fn request_debug(&mut self, node_id: &str, reason: FailureReason) -> Result<()> {
        let retries = self.ledger.retries(node_id, reason);
        let max = self.ledger.max_debug_retries();
        let allowed = self.ledger.can_debug(node_id, reason);
        notify_event(
            self.observer.as_ref(),
            &RunEvent::RetryDecision {
                node_id: node_id.to_string(),
                reason,
                retries,
                max,
                allowed,
            },
        );
        let verdict = if allowed { "debugging" } else { "exhausted" };
        self.journal(
            node_id,
            None,
            format!("retry decision {reason}: {retries}/{max} used, {verdict}"),
        );
        if !allowed {
            warn!(node_id, reason = %reason, max, "debug retries exhausted");
            self.fail_node(node_id, FailCause::RetriesExhausted { reason, max });
            return Ok(());
        }

        let before = self.fingerprint(node_id)?;
        let round = self.ledger.note_debug_round(node_id, reason);
        let from_attempt = self.ledger.attempt(node_id);
        self.ledger.record_pending(
            node_id,
            DebugPending {
                before,
                from_attempt,
                reason,
            },
        );
        info!(node_id, reason = %reason, round, max, attempt = from_attempt, "requesting debug round");
        self.advance(node_id, StageKind::Debug, Some(reason)).await
    }

    async fn resolve_debug(
        &mut self,
        node_id: &str,
        outcome: Outcome,
        result: &ResultMessage,
    ) -> Result<()> {
        let pending = self.ledger.take_pending(node_id);
        if !debug_produced_patch(outcome, result.touched_files.as_deref()) {
            warn!(node_id, "debug round produced no patch");
            self.fail_node(node_id, FailCause::NoPatch);
            return Ok(());
        }
        let Some(pending) = pending else {
            self.fail_node(node_id, FailCause::MissingDebugSnapshot);
            return Ok(());
        };
        let change = pending.compare(&self.fingerprint(node_id)?);
        let Some(route) = route_after_debug(change) else {
            warn!(node_id, reason = %pending.reason, "debug round changed no sources");
            self.fail_node(node_id, FailCause::NoProgress);
            return Ok(());
        };

        let attempt = pending.from_attempt + 1;
        self.ledger.set_attempt(node_id, attempt);
        self.run_mut(node_id)?.resume_after_lint = route.resume_after_lint;
        info!(
            node_id,
            attempt,
            rtl_changed = change.rtl_changed,
            tb_changed = change.tb_changed,
            next = %route.next,
            "debug round applied"
        );
        self.advance(node_id, route.next, None).await
    }

    /// Publish a task of `kind` at the node's current attempt.
    async fn advance(
        &mut self,
        node_id: &str,
        kind: StageKind,
        debug_reason: Option<FailureReason>,
    ) -> Result<()> {
        let attempt = self.ledger.attempt(node_id);
        let stage = StageKey::for_attempt(kind, attempt);
        let run = self.run_mut(node_id)?;
        if run.issued.contains_key(&stage) {
            return Err(EngineError::StageKeyReused {
                node_id: node_id.to_string(),
                stage,
            }
            .into());
        }
        let correlation_id = run.correlation_id;

        let mut context = self.contexts.build(node_id)?;
        context.attempt = Some(attempt);
        context.debug_reason = debug_reason;
        let entity_type = kind.entity_type();
        let task = TaskMessage::new(correlation_id, entity_type, kind.task_type(), context);
        self.memory
            .record_task(node_id, stage, &task)
            .with_context(|| format!("persist {stage} task of {node_id}"))?;

        let note = debug_reason.map(|reason| format!("debug reason {reason}"));
        self.transition(node_id, kind.active_state(), Some(stage), note)?;
        self.run_mut(node_id)?.issued.insert(stage, task.clone());
        self.transport
            .publish(entity_type.routing_key(), &task)
            .await
            .with_context(|| format!("publish {stage} task of {node_id}"))?;
        self.published += 1;
        debug!(node_id, stage = %stage, task_id = %task.task_id, "task published");
        notify_event(
            self.observer.as_ref(),
            &RunEvent::TaskPublished {
                node_id: node_id.to_string(),
                stage,
                task_id: task.task_id,
                task_type: task.task_type,
            },
        );
        Ok(())
    }

    async fn finish_done(&mut self, node_id: &str) -> Result<()> {
        self.transition(
            node_id,
            NodeState::Done,
            None,
            Some("all stages passed".to_string()),
        )?;
        self.start_ready().await;
        Ok(())
    }

    /// Finalize `node_id` as failed and cascade to pending dependents,
    /// transitively.
    fn fail_node(&mut self, node_id: &str, cause: FailCause) {
        let mut queue = VecDeque::from([(node_id.to_string(), cause)]);
        while let Some((id, cause)) = queue.pop_front() {
            if self.registry.state(&id).is_none_or(NodeState::is_terminal) {
                continue;
            }
            warn!(node_id = %id, cause = %cause, "node failed");
            if let Err(err) = self.transition(&id, NodeState::Failed, None, Some(cause.to_string())) {
                error!(node_id = %id, error = %err, "could not finalize node");
                continue;
            }
            self.ledger.take_pending(&id);
            for dependent in self.registry.pending_dependents(&id) {
                queue.push_back((dependent, FailCause::DependencyFailed(id.clone())));
            }
        }
    }

    async fn start_ready(&mut self) {
        for node_id in self.registry.ready() {
            if self.runs.contains_key(&node_id) {
                continue;
            }
            self.start_node(&node_id).await;
        }
    }

    async fn start_node(&mut self, node_id: &str) {
        self.ledger.reset_node(node_id);
        let run = NodeRun::new();
        self.by_correlation
            .insert(run.correlation_id, node_id.to_string());
        self.runs.insert(node_id.to_string(), run);
        info!(node_id, "starting node");
        if let Err(err) = self.advance(node_id, StageKind::Impl, None).await {
            let msg = format!("{err:#}");
            error!(node_id, error = %msg, "could not start node");
            self.fail_node(node_id, FailCause::Internal(msg));
        }
    }

    /// Move a node to `state`, then log, journal and notify.
    ///
    /// Journal and observer failures are logged and otherwise ignored.
    fn transition(
        &mut self,
        node_id: &str,
        state: NodeState,
        stage: Option<StageKey>,
        note: Option<String>,
    ) -> Result<()> {
        self.registry.set_state(node_id, state)?;
        match stage {
            Some(stage) => info!(node_id, state = %state, stage = %stage, "transition"),
            None => info!(node_id, state = %state, "transition"),
        }
        self.append_journal(node_id, &JournalEntry::now(state, stage, note));
        notify_state(self.observer.as_ref(), node_id, state);
        Ok(())
    }

    /// Journal a note against the node's current state.
    fn journal(&self, node_id: &str, stage: Option<StageKey>, note: String) {
        let Some(state) = self.registry.state(node_id) else {
            return;
        };
        self.append_journal(node_id, &JournalEntry::now(state, stage, Some(note)));
    }

    fn append_journal(&self, node_id: &str, entry: &JournalEntry) {
        if let Err(err) = self.memory.append_journal(node_id, entry) {
            let msg = format!("{err:#}");
            warn!(node_id, error = %msg, "journal write failed");
        }
    }

    fn fingerprint(&self, node_id: &str) -> Result<Fingerprint> {
        let sources = self.contexts.source_files(node_id)?;
        let rtl: Vec<&Path> = sources.rtl.iter().map(PathBuf::as_path).collect();
        Ok(Fingerprint {
            rtl: hash_files(&rtl)?,
            tb: hash_file(&sources.tb)?,
        })
    }

    /// Best-effort copy of the sources a failed stage looked at.
    fn snapshot_failure(&self, node_id: &str, stage: StageKey) {
        if !self.snapshot_failure_sources {
            return;
        }
        let include_tb = match stage.kind {
            StageKind::Lint => false,
            StageKind::TbLint | StageKind::Sim | StageKind::Debug => true,
            _ => return,
        };
        let snapshot = self
            .contexts
            .source_files(node_id)
            .map_err(anyhow::Error::from)
            .and_then(|sources| {
                self.memory
                    .snapshot_sources(node_id, stage, &sources, include_tb)
            });
        match snapshot {
            Ok(copied) => {
                debug!(node_id, stage = %stage, files = copied.len(), "sources snapshotted");
            }
            Err(err) => {
                let msg = format!("{err:#}");
                warn!(node_id, stage = %stage, error = %msg, "source snapshot failed");
            }
        }
    }

    fn run_mut(&mut self, node_id: &str) -> Result<&mut NodeRun, EngineError> {
        self.runs
            .get_mut(node_id)
            .ok_or_else(|| EngineError::NotStarted(node_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::test_support::{DesignFixture, Harness};

    #[tokio::test]
    async fn start_publishes_impl_for_roots_only() {
        let fixture = DesignFixture::new()
            .node("a", &[])
            .node("b", &["a"])
            .node("c", &[]);
        let harness = Harness::start(fixture, EngineSettings::default()).await;
        assert_eq!(harness.engine.published_count(), 2);
        assert_eq!(harness.engine.state("a"), Some(NodeState::Implementing));
        assert_eq!(harness.engine.state("b"), Some(NodeState::Pending));
        assert_eq!(
            harness.engine.outstanding("a"),
            vec![StageKey::bare(StageKind::Impl)]
        );
        let task = harness.next_task().expect("task");
        assert_eq!(task.context.attempt, Some(1));
    }

    #[tokio::test]
    async fn duplicate_and_foreign_results_are_ignored() {
        let fixture = DesignFixture::new().node("a", &[]);
        let mut harness = Harness::start(fixture, EngineSettings::default()).await;
        let task = harness.next_task().expect("impl task");
        let result = ResultMessage::success(&task, "ok");
        assert!(matches!(
            harness.engine.dispatch(result.clone()).await,
            Dispatch::Applied { .. }
        ));
        assert_eq!(
            harness.engine.dispatch(result).await,
            Dispatch::Ignored(IgnoreReason::Duplicate)
        );

        let mut stray = ResultMessage::success(&task, "ok");
        stray.task_id = Uuid::new_v4();
        assert_eq!(
            harness.engine.dispatch(stray).await,
            Dispatch::Ignored(IgnoreReason::UnknownTask)
        );
        stray = ResultMessage::success(&task, "ok");
        stray.correlation_id = Uuid::new_v4();
        assert_eq!(
            harness.engine.dispatch(stray).await,
            Dispatch::Ignored(IgnoreReason::UnknownCorrelation)
        );
        assert_eq!(harness.engine.published_count(), 2);
    }

    #[tokio::test]
    async fn results_are_persisted_and_journaled() {
        let fixture = DesignFixture::new().node("a", &[]);
        let mut harness = Harness::start(fixture, EngineSettings::default()).await;
        let task = harness.next_task().expect("impl task");
        harness
            .engine
            .dispatch(ResultMessage::failure(&task, "agent gave up"))
            .await;
        assert_eq!(harness.engine.state("a"), Some(NodeState::Failed));

        let memory = harness.engine.memory();
        let stage = StageKey::bare(StageKind::Impl);
        assert_eq!(
            memory.read_log("a", stage).expect("log").as_deref(),
            Some("agent gave up")
        );
        assert!(memory.stage_paths("a", stage).task_path.is_file());
        let journal = memory.read_journal("a").expect("journal");
        let last = journal.last().expect("entry");
        assert_eq!(last.state, NodeState::Failed);
        assert_eq!(last.note.as_deref(), Some("stage impl failed"));
    }

    #[tokio::test]
    async fn debug_task_carries_reason_and_attempt() {
        let fixture = DesignFixture::new().node("a", &[]);
        let mut harness = Harness::start(fixture, EngineSettings::default()).await;
        harness.reply_next(TaskStatus::Success).await;
        let lint = harness.reply_next(TaskStatus::Failure).await;
        assert_eq!(lint.context.attempt, Some(1));

        let debug = harness.next_task().expect("debug task");
        assert_eq!(StageKind::from_task_type(debug.task_type), StageKind::Debug);
        assert_eq!(debug.context.debug_reason, Some(FailureReason::RtlLint));
        assert_eq!(debug.context.attempt, Some(1));
        assert_eq!(harness.engine.retries("a", FailureReason::RtlLint), 1);
        assert_eq!(harness.engine.state("a"), Some(NodeState::Debugging));

        let memory = harness.engine.memory();
        let lint_dir = memory
            .stage_paths("a", StageKey::attempted(StageKind::Lint, 1))
            .dir;
        assert!(lint_dir.join("a.sv").is_file(), "failing RTL is snapshotted");
    }

    #[tokio::test]
    async fn failing_start_fails_only_that_node() {
        let fixture = DesignFixture::new().node("a", &[]).node("b", &[]);
        let fixture = fixture.without_design("b");
        let harness = Harness::start(fixture, EngineSettings::default()).await;
        assert_eq!(harness.engine.state("b"), Some(NodeState::Failed));
        assert_eq!(harness.engine.state("a"), Some(NodeState::Implementing));
        assert!(harness.next_task().is_some());
    }
}
