//! Acceptance criteria and the pure parts of acceptance gating.
//!
//! Artifact lookup lives in `io::acceptance`; everything here works on values
//! already read from disk.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::stage::StageKind;

/// Acceptance block of a design node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptanceCriteria {
    pub required_artifacts: Vec<RequiredArtifact>,
    pub acceptance_metrics: Vec<AcceptanceMetric>,
}

impl AcceptanceCriteria {
    pub fn is_empty(&self) -> bool {
        self.required_artifacts.is_empty() && self.acceptance_metrics.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredArtifact {
    pub name: String,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
}

fn default_mandatory() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceMetric {
    #[serde(default)]
    pub metric_id: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub target_value: Value,
    #[serde(default)]
    pub metric_source: Option<String>,
}

/// Well-known artifact a required-artifact name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRef {
    Rtl,
    Testbench,
    /// `log.txt` of the latest attempt of a stage.
    StageLog(StageKind),
    /// `log.txt` of the testbench generation stage.
    TestbenchLog,
    CoverageReport,
}

impl ArtifactRef {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rtl" | "rtl_file" | "rtl_source" => Some(ArtifactRef::Rtl),
            "testbench" | "tb" | "tb_file" | "testbench_file" => Some(ArtifactRef::Testbench),
            "lint_report" | "lint_log" => Some(ArtifactRef::StageLog(StageKind::Lint)),
            "tb_lint_log" | "testbench_lint_log" => Some(ArtifactRef::StageLog(StageKind::TbLint)),
            "tb_log" | "testbench_log" => Some(ArtifactRef::TestbenchLog),
            "sim_log" | "simulation_log" => Some(ArtifactRef::StageLog(StageKind::Sim)),
            "coverage_report" | "coverage" => Some(ArtifactRef::CoverageReport),
            _ => None,
        }
    }
}

/// Where a metric value is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricSource {
    SimLog,
    LintLog,
    CoverageReport,
    JsonFile(String),
    TextFile(String),
    /// Unrecognized source; falls back to the unattempted sim log.
    Fallback,
}

impl MetricSource {
    pub fn from_source(source: Option<&str>) -> Self {
        let raw = source.map(str::trim).filter(|s| !s.is_empty());
        let Some(raw) = raw else {
            return MetricSource::CoverageReport;
        };
        let lowered = raw.to_ascii_lowercase();
        match lowered.as_str() {
            "sim_log" | "simulation_log" => MetricSource::SimLog,
            "lint_log" | "lint_report" => MetricSource::LintLog,
            "coverage_report" | "coverage" => MetricSource::CoverageReport,
            _ if lowered.ends_with(".json") => MetricSource::JsonFile(raw.to_string()),
            _ if lowered.ends_with(".txt") => MetricSource::TextFile(raw.to_string()),
            _ => MetricSource::Fallback,
        }
    }
}

pub fn is_coverage_artifact(name: &str) -> bool {
    ArtifactRef::from_name(name) == Some(ArtifactRef::CoverageReport)
}

/// Coverage is the default source, so a blank source counts as coverage.
pub fn is_coverage_source(source: Option<&str>) -> bool {
    MetricSource::from_source(source) == MetricSource::CoverageReport
}

/// A simulation passed unless its log is missing or carries a failure marker.
pub fn sim_log_passed(log: Option<&str>) -> bool {
    match log {
        Some(text) => !(text.contains("FAIL") || text.contains("ERROR")),
        None => false,
    }
}

/// Find `<metric_id> [:=] <number>` in free text.
pub fn extract_metric_from_text(metric_id: &str, text: &str) -> Result<Option<String>> {
    let pattern = format!(r"{}\s*[:=]\s*([0-9]*\.?[0-9]+)", regex::escape(metric_id));
    let re = Regex::new(&pattern).map_err(|err| anyhow!("metric pattern: {err}"))?;
    Ok(re
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string()))
}

/// Look up `metric_id` at the top level, then under `metrics`, then `coverage`.
pub fn extract_metric_from_json(metric_id: &str, doc: &Value) -> Option<Value> {
    let obj = doc.as_object()?;
    if let Some(value) = obj.get(metric_id) {
        return Some(value.clone());
    }
    ["metrics", "coverage"].into_iter().find_map(|section| {
        obj.get(section)
            .and_then(Value::as_object)
            .and_then(|nested| nested.get(metric_id))
            .cloned()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl FromStr for Comparison {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            ">" => Ok(Comparison::Gt),
            ">=" => Ok(Comparison::Ge),
            "<" => Ok(Comparison::Lt),
            "<=" => Ok(Comparison::Le),
            "==" => Ok(Comparison::Eq),
            "!=" => Ok(Comparison::Ne),
            other => Err(anyhow!("unsupported operator '{other}'")),
        }
    }
}

/// Compare a measured value against a target.
///
/// Ordering operators need both sides numeric. Equality is numeric when both
/// sides parse and falls back to trimmed string comparison otherwise.
pub fn compare_metric(value: &Value, target: &Value, op: Comparison) -> bool {
    let value_num = to_number(value);
    let target_num = to_number(target);
    match op {
        Comparison::Gt | Comparison::Ge | Comparison::Lt | Comparison::Le => {
            let (Some(v), Some(t)) = (value_num, target_num) else {
                return false;
            };
            match op {
                Comparison::Gt => v > t,
                Comparison::Ge => v >= t,
                Comparison::Lt => v < t,
                _ => v <= t,
            }
        }
        Comparison::Eq | Comparison::Ne => {
            let equal = match (value_num, target_num) {
                (Some(v), Some(t)) => v == t,
                _ => value_text(value).trim() == value_text(target).trim(),
            };
            if op == Comparison::Eq { equal } else { !equal }
        }
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Render a JSON value the way it reads in a log line.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Outcome of gating one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateReport {
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for GateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::new();
        if !self.failures.is_empty() {
            lines.push("Acceptance gating failed:".to_string());
            lines.extend(self.failures.iter().map(|msg| format!("- {msg}")));
        }
        if !self.warnings.is_empty() {
            lines.push("Acceptance warnings:".to_string());
            lines.extend(self.warnings.iter().map(|msg| format!("- {msg}")));
        }
        if lines.is_empty() {
            lines.push("Acceptance gating passed.".to_string());
        }
        f.write_str(&lines.join("\n"))
    }
}
