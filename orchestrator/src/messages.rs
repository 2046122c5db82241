//! Wire messages exchanged between the orchestrator and workers.
//!
//! Both messages travel as JSON. `TaskContext` types the fields the
//! orchestrator itself reads and keeps every other key in `extra`, so worker
//! specific payloads survive a round trip untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::types::{EntityType, FailureReason, TaskPriority, TaskStatus, TaskType};

pub const FULL_SCOPE: &str = "full";

/// Per-task payload built from the design context plus stage keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rtl_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtl_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tb_path: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub interface: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub design_context_hash: String,
    /// Unset means `full`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_scope: Option<String>,
    /// Forward-compatible keys the orchestrator passes through unread.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskContext {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            attempt: None,
            debug_reason: None,
            rtl_path: String::new(),
            rtl_paths: Vec::new(),
            tb_path: String::new(),
            interface: Value::Null,
            design_context_hash: String::new(),
            verification_scope: None,
            extra: Map::new(),
        }
    }

    pub fn scope(&self) -> &str {
        self.verification_scope.as_deref().unwrap_or(FULL_SCOPE)
    }

    pub fn is_full_scope(&self) -> bool {
        self.scope() == FULL_SCOPE
    }
}

/// A unit of work addressed to one worker pool. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub entity_type: EntityType,
    pub task_type: TaskType,
    pub context: TaskContext,
}

impl TaskMessage {
    /// New task with a fresh `task_id`.
    pub fn new(
        correlation_id: Uuid,
        entity_type: EntityType,
        task_type: TaskType,
        context: TaskContext,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            correlation_id,
            created_at: Utc::now(),
            priority: TaskPriority::default(),
            entity_type,
            task_type,
            context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionInsights {
    pub reflection_id: String,
    #[serde(default)]
    pub hypotheses: Vec<String>,
    #[serde(default)]
    pub likely_failure_points: Vec<String>,
    #[serde(default)]
    pub recommended_probes: Vec<String>,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub analysis_notes: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistilledDataset {
    pub dataset_id: String,
    pub original_data_size: u64,
    pub distilled_data_size: u64,
    pub compression_ratio: f64,
    #[serde(default)]
    pub failure_focus_areas: Vec<String>,
    pub data_path: String,
    pub created_at: DateTime<Utc>,
}

/// Exactly one per `TaskMessage`, correlated by `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: Uuid,
    pub correlation_id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(default)]
    pub artifacts_path: Option<String>,
    #[serde(default)]
    pub log_output: String,
    #[serde(default)]
    pub reflection_insights: Option<ReflectionInsights>,
    /// Free-form reflections, usually a JSON document encoded as a string.
    #[serde(default)]
    pub reflections: Option<String>,
    #[serde(default)]
    pub distilled_dataset: Option<DistilledDataset>,
    #[serde(default)]
    pub metrics: Option<CostMetrics>,
    /// Files a debug round rewrote; `Some(vec![])` means it patched nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touched_files: Option<Vec<String>>,
}

impl ResultMessage {
    fn for_task(task: &TaskMessage, status: TaskStatus, log_output: impl Into<String>) -> Self {
        Self {
            task_id: task.task_id,
            correlation_id: task.correlation_id,
            completed_at: Utc::now(),
            status,
            artifacts_path: None,
            log_output: log_output.into(),
            reflection_insights: None,
            reflections: None,
            distilled_dataset: None,
            metrics: None,
            touched_files: None,
        }
    }

    pub fn success(task: &TaskMessage, log_output: impl Into<String>) -> Self {
        Self::for_task(task, TaskStatus::Success, log_output)
    }

    pub fn failure(task: &TaskMessage, log_output: impl Into<String>) -> Self {
        Self::for_task(task, TaskStatus::Failure, log_output)
    }

    pub fn with_artifacts_path(mut self, path: impl Into<String>) -> Self {
        self.artifacts_path = Some(path.into());
        self
    }

    pub fn with_touched_files(mut self, files: Vec<String>) -> Self {
        self.touched_files = Some(files);
        self
    }

    pub fn with_reflection_insights(mut self, insights: ReflectionInsights) -> Self {
        self.reflection_insights = Some(insights);
        self
    }

    pub fn with_reflections(mut self, reflections: impl Into<String>) -> Self {
        self.reflections = Some(reflections.into());
        self
    }

    pub fn with_distilled_dataset(mut self, dataset: DistilledDataset) -> Self {
        self.distilled_dataset = Some(dataset);
        self
    }

    pub fn with_metrics(mut self, metrics: CostMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
