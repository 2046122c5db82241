//! Acceptance gating against Task Memory, and the worker that runs it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::acceptance::{
    AcceptanceCriteria, ArtifactRef, Comparison, GateReport, MetricSource, compare_metric,
    extract_metric_from_json, extract_metric_from_text, is_coverage_artifact, is_coverage_source,
    sim_log_passed, value_text,
};
use crate::core::stage::{StageKey, StageKind};
use crate::core::types::TaskType;
use crate::io::task_memory::{TaskMemory, read_optional};
use crate::io::worker::{Worker, WorkerError};
use crate::messages::{ResultMessage, TaskContext, TaskMessage};

pub const NO_CRITERIA_LOG: &str = "No acceptance criteria; skipping gating.";

/// Paths and attempt a gate evaluates against.
#[derive(Debug, Clone)]
pub struct GateTarget {
    pub node_id: String,
    pub attempt: Option<u32>,
    pub rtl_path: Option<PathBuf>,
    pub tb_path: Option<PathBuf>,
}

impl GateTarget {
    pub fn from_task(task: &TaskMessage) -> Self {
        Self::from_context(&task.context)
    }

    pub fn from_context(ctx: &TaskContext) -> Self {
        let rtl_path = non_empty(&ctx.rtl_path)
            .or_else(|| ctx.rtl_paths.first().and_then(|p| non_empty(p)));
        Self {
            node_id: ctx.node_id.clone(),
            attempt: ctx.attempt.filter(|n| *n > 0),
            rtl_path,
            tb_path: non_empty(&ctx.tb_path),
        }
    }
}

fn non_empty(raw: &str) -> Option<PathBuf> {
    (!raw.trim().is_empty()).then(|| PathBuf::from(raw))
}

#[derive(Debug, Clone)]
pub struct AcceptanceGate {
    memory: TaskMemory,
    relax_coverage_gating: bool,
}

impl AcceptanceGate {
    pub fn new(memory: TaskMemory, relax_coverage_gating: bool) -> Self {
        Self {
            memory,
            relax_coverage_gating,
        }
    }

    pub fn evaluate(&self, target: &GateTarget, criteria: &AcceptanceCriteria) -> Result<GateReport> {
        let mut report = GateReport::default();
        let relaxed = self.relax_coverage_gating && self.sim_passed(target)?;
        debug!(node_id = %target.node_id, relaxed, "evaluating acceptance");

        for entry in &criteria.required_artifacts {
            let name = entry.name.trim();
            if name.is_empty() {
                continue;
            }
            let path = self.resolve_artifact(name, target)?;
            if path.as_deref().is_some_and(Path::exists) {
                continue;
            }
            let mut msg = format!("Missing required artifact '{name}'");
            if let Some(path) = &path {
                msg.push_str(&format!(" (expected {})", path.display()));
            }
            if relaxed && is_coverage_artifact(name) {
                report.warnings.push(format!("{msg} (coverage gating deferred)"));
            } else if entry.mandatory {
                report.failures.push(msg);
            } else {
                report.warnings.push(msg);
            }
        }

        for metric in &criteria.acceptance_metrics {
            let metric_id = metric.metric_id.trim();
            let operator = metric.operator.trim();
            if metric_id.is_empty() || operator.is_empty() {
                report.failures.push(format!(
                    "Invalid acceptance metric definition: id='{metric_id}' operator='{operator}'"
                ));
                continue;
            }
            let source = metric.metric_source.as_deref();
            if relaxed && is_coverage_source(source) {
                report.warnings.push(format!(
                    "Skipping coverage metric '{metric_id}' (coverage gating deferred until coverage is generated)."
                ));
                continue;
            }
            let Ok(op) = operator.parse::<Comparison>() else {
                report.failures.push(format!(
                    "Metric '{metric_id}' uses unsupported operator '{operator}'"
                ));
                continue;
            };
            let Some(value) = self.load_metric(metric_id, source, target)? else {
                report.failures.push(format!(
                    "Missing metric '{metric_id}' from source '{}'",
                    source.filter(|s| !s.trim().is_empty()).unwrap_or("coverage_report")
                ));
                continue;
            };
            if !compare_metric(&value, &metric.target_value, op) {
                report.failures.push(format!(
                    "Metric '{metric_id}' failed: value={} target={} operator={operator}",
                    value_text(&value),
                    value_text(&metric.target_value)
                ));
            }
        }
        Ok(report)
    }

    fn sim_passed(&self, target: &GateTarget) -> Result<bool> {
        let log = self.stage_file(target, StageKind::Sim, "log.txt")?;
        Ok(sim_log_passed(read_optional(&log)?.as_deref()))
    }

    fn stage_file(&self, target: &GateTarget, kind: StageKind, name: &str) -> Result<PathBuf> {
        Ok(self
            .memory
            .latest_stage_dir(&target.node_id, kind, target.attempt)?
            .join(name))
    }

    fn coverage_report(&self, target: &GateTarget) -> Result<(PathBuf, PathBuf)> {
        let dir = self
            .memory
            .latest_stage_dir(&target.node_id, StageKind::Sim, target.attempt)?;
        Ok((dir.join("coverage_report.json"), dir.join("coverage_report.txt")))
    }

    fn resolve_artifact(&self, name: &str, target: &GateTarget) -> Result<Option<PathBuf>> {
        let Some(artifact) = ArtifactRef::from_name(name) else {
            return Ok(None);
        };
        let path = match artifact {
            ArtifactRef::Rtl => target.rtl_path.clone(),
            ArtifactRef::Testbench => target.tb_path.clone(),
            ArtifactRef::StageLog(kind) => Some(self.stage_file(target, kind, "log.txt")?),
            ArtifactRef::TestbenchLog => Some(
                self.memory
                    .stage_paths(&target.node_id, StageKey::bare(StageKind::Tb))
                    .log_path,
            ),
            ArtifactRef::CoverageReport => {
                let (json, txt) = self.coverage_report(target)?;
                Some(if !json.exists() && txt.exists() { txt } else { json })
            }
        };
        Ok(path)
    }

    fn load_metric(
        &self,
        metric_id: &str,
        source: Option<&str>,
        target: &GateTarget,
    ) -> Result<Option<Value>> {
        match MetricSource::from_source(source) {
            MetricSource::SimLog => {
                text_metric(metric_id, &self.stage_file(target, StageKind::Sim, "log.txt")?)
            }
            MetricSource::LintLog => {
                text_metric(metric_id, &self.stage_file(target, StageKind::Lint, "log.txt")?)
            }
            MetricSource::CoverageReport => {
                let (json, txt) = self.coverage_report(target)?;
                if json.exists() {
                    json_metric(metric_id, &json)
                } else {
                    text_metric(metric_id, &txt)
                }
            }
            MetricSource::JsonFile(path) => json_metric(metric_id, Path::new(&path)),
            MetricSource::TextFile(path) => text_metric(metric_id, Path::new(&path)),
            MetricSource::Fallback => {
                let log = self
                    .memory
                    .stage_paths(&target.node_id, StageKey::bare(StageKind::Sim))
                    .log_path;
                text_metric(metric_id, &log)
            }
        }
    }
}

fn text_metric(metric_id: &str, path: &Path) -> Result<Option<Value>> {
    let Some(text) = read_optional(path)? else {
        return Ok(None);
    };
    Ok(extract_metric_from_text(metric_id, &text)?.map(Value::String))
}

/// Unreadable JSON counts as a missing metric.
fn json_metric(metric_id: &str, path: &Path) -> Result<Option<Value>> {
    let Some(text) = read_optional(path)? else {
        return Ok(None);
    };
    Ok(serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|doc| extract_metric_from_json(metric_id, &doc)))
}

/// Worker for `AcceptanceWorker` tasks.
#[derive(Debug, Clone)]
pub struct AcceptanceWorker {
    gate: AcceptanceGate,
}

impl AcceptanceWorker {
    pub fn new(gate: AcceptanceGate) -> Self {
        Self { gate }
    }

    fn criteria(task: &TaskMessage) -> Result<AcceptanceCriteria, WorkerError> {
        match task.context.extra.get("acceptance") {
            None | Some(Value::Null) => Ok(AcceptanceCriteria::default()),
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|err| WorkerError::Input(format!("invalid acceptance block: {err}"))),
        }
    }
}

#[async_trait]
impl Worker for AcceptanceWorker {
    fn name(&self) -> &str {
        "acceptance"
    }

    fn handles(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Acceptance
    }

    async fn handle(&self, task: &TaskMessage) -> Result<ResultMessage, WorkerError> {
        if task.context.node_id.trim().is_empty() {
            return Err(WorkerError::Input("missing node_id in task context".to_string()));
        }
        let criteria = Self::criteria(task)?;
        if criteria.is_empty() {
            return Ok(ResultMessage::success(task, NO_CRITERIA_LOG));
        }
        let target = GateTarget::from_task(task);
        let report = self
            .gate
            .evaluate(&target, &criteria)
            .context("evaluate acceptance")
            .map_err(|err| WorkerError::Internal(format!("{err:#}")))?;
        info!(
            node_id = %target.node_id,
            failures = report.failures.len(),
            warnings = report.warnings.len(),
            "acceptance evaluated"
        );
        let log = report.to_string();
        Ok(if report.passed() {
            ResultMessage::success(task, log)
        } else {
            ResultMessage::failure(task, log)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::acceptance::{AcceptanceMetric, RequiredArtifact};
    use crate::core::types::{EntityType, TaskStatus};
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        _temp: tempfile::TempDir,
        memory_root: PathBuf,
        rtl: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let memory_root = temp.path().join("memory");
            let rtl = temp.path().join("alu.sv");
            fs::write(&rtl, "module alu; endmodule\n").expect("write rtl");
            Self {
                _temp: temp,
                memory_root,
                rtl,
            }
        }

        fn write_stage(&self, stage: &str, name: &str, contents: &str) {
            let dir = self.memory_root.join("alu").join(stage);
            fs::create_dir_all(&dir).expect("mkdir");
            fs::write(dir.join(name), contents).expect("write");
        }

        fn gate(&self, relax: bool) -> AcceptanceGate {
            AcceptanceGate::new(TaskMemory::new(&self.memory_root), relax)
        }

        fn target(&self, attempt: Option<u32>) -> GateTarget {
            GateTarget {
                node_id: "alu".to_string(),
                attempt,
                rtl_path: Some(self.rtl.clone()),
                tb_path: Some(self.rtl.with_file_name("alu_tb.sv")),
            }
        }
    }

    fn artifact(name: &str) -> RequiredArtifact {
        RequiredArtifact {
            name: name.to_string(),
            mandatory: true,
        }
    }

    fn metric(id: &str, op: &str, target: Value, source: Option<&str>) -> AcceptanceMetric {
        AcceptanceMetric {
            metric_id: id.to_string(),
            operator: op.to_string(),
            target_value: target,
            metric_source: source.map(str::to_string),
        }
    }

    #[test]
    fn passes_when_artifacts_exist_and_metrics_hold() {
        let fx = Fixture::new();
        fx.write_stage("sim_attempt1", "log.txt", "Simulation passed.\nmismatches = 0\n");
        fx.write_stage("sim_attempt1", "coverage_report.json", r#"{"metrics": {"line": 93.0}}"#);
        let criteria = AcceptanceCriteria {
            required_artifacts: vec![artifact("rtl"), artifact("sim_log"), artifact("coverage")],
            acceptance_metrics: vec![
                metric("line", ">=", json!(90), None),
                metric("mismatches", "==", json!(0), Some("sim_log")),
            ],
        };
        let report = fx.gate(false).evaluate(&fx.target(Some(2)), &criteria).expect("eval");
        assert!(report.passed(), "{report}");
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_mandatory_artifact_fails() {
        let fx = Fixture::new();
        let criteria = AcceptanceCriteria {
            required_artifacts: vec![
                artifact("testbench"),
                RequiredArtifact {
                    name: "lint_log".to_string(),
                    mandatory: false,
                },
            ],
            acceptance_metrics: vec![],
        };
        let report = fx.gate(true).evaluate(&fx.target(Some(1)), &criteria).expect("eval");
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("Missing required artifact 'testbench'"));
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn relaxed_gating_defers_coverage_after_clean_sim() {
        let fx = Fixture::new();
        fx.write_stage("sim_attempt1", "log.txt", "Simulation passed.\n");
        let criteria = AcceptanceCriteria {
            required_artifacts: vec![artifact("coverage_report")],
            acceptance_metrics: vec![metric("line", ">=", json!(90), None)],
        };
        let relaxed = fx.gate(true).evaluate(&fx.target(Some(1)), &criteria).expect("eval");
        assert!(relaxed.passed());
        assert_eq!(relaxed.warnings.len(), 2);

        let strict = fx.gate(false).evaluate(&fx.target(Some(1)), &criteria).expect("eval");
        assert_eq!(strict.failures.len(), 2);
    }

    #[test]
    fn relaxation_needs_a_clean_sim_log() {
        let fx = Fixture::new();
        fx.write_stage("sim_attempt1", "log.txt", "ERROR: assertion failed\n");
        let criteria = AcceptanceCriteria {
            required_artifacts: vec![artifact("coverage")],
            acceptance_metrics: vec![],
        };
        let report = fx.gate(true).evaluate(&fx.target(Some(1)), &criteria).expect("eval");
        assert!(!report.passed());
    }

    #[test]
    fn metric_failures_are_reported() {
        let fx = Fixture::new();
        fx.write_stage("sim_attempt1", "coverage_report.txt", "line_coverage: 71.5\n");
        let criteria = AcceptanceCriteria {
            required_artifacts: vec![],
            acceptance_metrics: vec![
                metric("line_coverage", ">", json!("80"), Some("coverage")),
                metric("toggle", ">", json!(1), Some("sim_log")),
                metric("line_coverage", "~", json!(1), Some("coverage")),
                metric("", ">", json!(1), None),
            ],
        };
        let report = fx.gate(false).evaluate(&fx.target(Some(1)), &criteria).expect("eval");
        assert_eq!(report.failures.len(), 4);
        assert_eq!(
            report.failures[0],
            "Metric 'line_coverage' failed: value=71.5 target=80 operator=>"
        );
        assert_eq!(report.failures[1], "Missing metric 'toggle' from source 'sim_log'");
    }

    fn acceptance_task(acceptance: Option<Value>, rtl: &Path) -> TaskMessage {
        let mut ctx = TaskContext::new("alu");
        ctx.attempt = Some(1);
        ctx.rtl_path = rtl.to_string_lossy().into_owned();
        if let Some(block) = acceptance {
            ctx.extra.insert("acceptance".to_string(), block);
        }
        TaskMessage::new(
            Uuid::new_v4(),
            EntityType::LightDeterministic,
            TaskType::Acceptance,
            ctx,
        )
    }

    #[tokio::test]
    async fn worker_skips_without_criteria() {
        let fx = Fixture::new();
        let worker = AcceptanceWorker::new(fx.gate(true));
        let result = worker
            .handle(&acceptance_task(None, &fx.rtl))
            .await
            .expect("handle");
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.log_output, NO_CRITERIA_LOG);
    }

    #[tokio::test]
    async fn worker_reports_gate_failure() {
        let fx = Fixture::new();
        let worker = AcceptanceWorker::new(fx.gate(true));
        let block = json!({"required_artifacts": [{"name": "sim_log"}]});
        let result = worker
            .handle(&acceptance_task(Some(block), &fx.rtl))
            .await
            .expect("handle");
        assert_eq!(result.status, TaskStatus::Failure);
        assert!(result.log_output.starts_with("Acceptance gating failed:"));
    }

    #[tokio::test]
    async fn worker_rejects_malformed_criteria() {
        let fx = Fixture::new();
        let worker = AcceptanceWorker::new(fx.gate(true));
        let block = json!({"required_artifacts": "everything"});
        let err = worker
            .handle(&acceptance_task(Some(block), &fx.rtl))
            .await
            .expect_err("input error");
        assert!(matches!(err, WorkerError::Input(_)));
    }
}
