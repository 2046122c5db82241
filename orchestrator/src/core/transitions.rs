//! The per-node transition table.
//!
//! Pure functions only: given the stage that finished, its outcome and a few
//! facts about the node, decide what happens next. The engine owns every side
//! effect (hashing, publishing, persisting).

use crate::core::ledger::ContentChange;
use crate::core::stage::StageKind;
use crate::core::types::{FailCause, FailureReason, TaskStatus};

/// Success or failure of one finished stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl From<TaskStatus> for Outcome {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Success => Outcome::Success,
            TaskStatus::Failure => Outcome::Failure,
        }
    }
}

/// Node facts the table needs beyond the finished stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFacts {
    /// Verification scope is `full`.
    pub full_scope: bool,
    /// A testbench task has already succeeded for this node.
    pub tb_generated: bool,
    /// Stage to resume after a post-debug lint pass, if a debug round set one.
    pub resume_after_lint: Option<StageKind>,
}

/// Terminal decision for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish {
    Done,
    Failed(FailCause),
}

/// Next step for a node after a stage finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Publish a task of this kind at the node's current attempt.
    Advance(StageKind),
    /// Enter a debug round for this failure class, budget permitting.
    Debug(FailureReason),
    /// Compare post-debug content against the pre-debug snapshot.
    ResolveDebug,
    Finish(Finish),
}

/// Apply the transition table to one finished stage.
pub fn next_transition(kind: StageKind, outcome: Outcome, facts: NodeFacts) -> Transition {
    match (kind, outcome) {
        (StageKind::Debug, _) => Transition::ResolveDebug,

        (StageKind::Impl, Outcome::Success) => Transition::Advance(StageKind::Lint),
        (StageKind::Lint, Outcome::Success) => {
            if !facts.full_scope {
                Transition::Finish(Finish::Done)
            } else if !facts.tb_generated {
                Transition::Advance(StageKind::Tb)
            } else {
                Transition::Advance(facts.resume_after_lint.unwrap_or(StageKind::Sim))
            }
        }
        (StageKind::Tb, Outcome::Success) => Transition::Advance(StageKind::TbLint),
        (StageKind::TbLint, Outcome::Success) => Transition::Advance(StageKind::Sim),
        (StageKind::Sim, Outcome::Success) => Transition::Advance(StageKind::Acceptance),
        (StageKind::Acceptance, Outcome::Success) => Transition::Finish(Finish::Done),
        (StageKind::Distill, Outcome::Success) => Transition::Advance(StageKind::Reflect),
        (StageKind::Reflect, Outcome::Success) => Transition::Debug(FailureReason::Sim),

        (StageKind::Lint, Outcome::Failure) => Transition::Debug(FailureReason::RtlLint),
        (StageKind::TbLint, Outcome::Failure) => Transition::Debug(FailureReason::TbLint),
        (StageKind::Sim, Outcome::Failure) => Transition::Advance(StageKind::Distill),
        (kind, Outcome::Failure) => {
            Transition::Finish(Finish::Failed(FailCause::StageFailed(kind.to_string())))
        }
    }
}

/// Failure class whose counter a clean pass of `kind` resets.
pub fn cleared_reason(kind: StageKind) -> Option<FailureReason> {
    match kind {
        StageKind::Lint => Some(FailureReason::RtlLint),
        StageKind::TbLint => Some(FailureReason::TbLint),
        StageKind::Sim => Some(FailureReason::Sim),
        _ => None,
    }
}

/// Where a productive debug round re-enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRoute {
    pub next: StageKind,
    pub resume_after_lint: Option<StageKind>,
}

/// Route after a debug round; `None` when nothing changed.
pub fn route_after_debug(change: ContentChange) -> Option<DebugRoute> {
    match (change.rtl_changed, change.tb_changed) {
        (true, tb_changed) => Some(DebugRoute {
            next: StageKind::Lint,
            resume_after_lint: Some(if tb_changed {
                StageKind::TbLint
            } else {
                StageKind::Sim
            }),
        }),
        (false, true) => Some(DebugRoute {
            next: StageKind::TbLint,
            resume_after_lint: None,
        }),
        (false, false) => None,
    }
}

/// Whether a debug result counts as a patch attempt.
///
/// An explicit touched-files list decides on its own, so an empty list fails
/// the round even when the worker reported success.
pub fn debug_produced_patch(outcome: Outcome, touched_files: Option<&[String]>) -> bool {
    match touched_files {
        Some(files) => !files.is_empty(),
        None => outcome == Outcome::Success,
    }
}
