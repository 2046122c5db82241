//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between the engine, the transport and
//! the persisted audit trail. Their serialized names are part of the wire
//! format and must not change.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a design node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Implementing,
    Linting,
    Testbenching,
    TbLinting,
    Simulating,
    Accepting,
    Distilling,
    Reflecting,
    Debugging,
    Done,
    Failed,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Pending => "PENDING",
            NodeState::Implementing => "IMPLEMENTING",
            NodeState::Linting => "LINTING",
            NodeState::Testbenching => "TESTBENCHING",
            NodeState::TbLinting => "TB_LINTING",
            NodeState::Simulating => "SIMULATING",
            NodeState::Accepting => "ACCEPTING",
            NodeState::Distilling => "DISTILLING",
            NodeState::Reflecting => "REFLECTING",
            NodeState::Debugging => "DEBUGGING",
            NodeState::Done => "DONE",
            NodeState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Failed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing class of a task; selects the queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Reasoning,
    LightDeterministic,
    HeavyDeterministic,
}

impl EntityType {
    /// Routing key used on the task exchange.
    pub fn routing_key(self) -> &'static str {
        match self {
            EntityType::Reasoning => "REASONING",
            EntityType::LightDeterministic => "LIGHT_DETERMINISTIC",
            EntityType::HeavyDeterministic => "HEAVY_DETERMINISTIC",
        }
    }
}

/// Specific agent or worker kind a task is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "ImplementationAgent")]
    Implementation,
    #[serde(rename = "TestbenchAgent")]
    Testbench,
    #[serde(rename = "ReflectionAgent")]
    Reflection,
    #[serde(rename = "DebugAgent")]
    Debug,
    #[serde(rename = "LinterWorker")]
    Linter,
    #[serde(rename = "TestbenchLinterWorker")]
    TestbenchLinter,
    #[serde(rename = "SimulatorWorker")]
    Simulator,
    #[serde(rename = "DistillationWorker")]
    Distillation,
    #[serde(rename = "AcceptanceWorker")]
    Acceptance,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Implementation => "ImplementationAgent",
            TaskType::Testbench => "TestbenchAgent",
            TaskType::Reflection => "ReflectionAgent",
            TaskType::Debug => "DebugAgent",
            TaskType::Linter => "LinterWorker",
            TaskType::TestbenchLinter => "TestbenchLinterWorker",
            TaskType::Simulator => "SimulatorWorker",
            TaskType::Distillation => "DistillationWorker",
            TaskType::Acceptance => "AcceptanceWorker",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported by a worker for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failure,
}

/// Task priority, serialized as its integer level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 2,
            TaskPriority::High => 3,
        }
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TaskPriority::Low),
            2 => Ok(TaskPriority::Medium),
            3 => Ok(TaskPriority::High),
            other => Err(format!("unknown task priority {other}")),
        }
    }
}

/// Failure class that may trigger a debug round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RtlLint,
    TbLint,
    Sim,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::RtlLint => "rtl_lint",
            FailureReason::TbLint => "tb_lint",
            FailureReason::Sim => "sim",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a node was finalized as `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailCause {
    /// A stage without a repair loop reported failure.
    StageFailed(String),
    /// The debug budget for this failure class is spent.
    RetriesExhausted { reason: FailureReason, max: u32 },
    /// A debug round left RTL and testbench content unchanged.
    NoProgress,
    /// A debug round reported that it touched no files.
    NoPatch,
    /// A stage that must carry an attempt number arrived without one.
    MissingAttempt(String),
    /// A debug result arrived with no pre-debug snapshot on record.
    MissingDebugSnapshot,
    /// A dependency finalized as `FAILED` before this node started.
    DependencyFailed(String),
    /// The engine could not process a result or publish the next task.
    Internal(String),
}

impl fmt::Display for FailCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailCause::StageFailed(stage) => write!(f, "stage {stage} failed"),
            FailCause::RetriesExhausted { reason, max } => {
                write!(f, "debug retries exhausted for {reason} ({max})")
            }
            FailCause::NoProgress => f.write_str("debug produced no code changes"),
            FailCause::NoPatch => f.write_str("debug reported no touched files"),
            FailCause::MissingAttempt(stage) => {
                write!(f, "stage {stage} completed without an attempt number")
            }
            FailCause::MissingDebugSnapshot => f.write_str("no pre-debug snapshot recorded"),
            FailCause::DependencyFailed(dep) => write!(f, "dependency '{dep}' failed"),
            FailCause::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}
