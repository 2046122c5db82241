//! Pipeline stage kinds and structured stage keys.
//!
//! A [`StageKey`] pairs a [`StageKind`] with an optional attempt number and is
//! the unit that indexes outstanding tasks and Task Memory directories. Its
//! string form (`lint`, `lint_attempt3`) is only produced at the edges.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::types::{EntityType, NodeState, TaskType};

/// One step of the fixed verification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Impl,
    Lint,
    Tb,
    TbLint,
    Sim,
    Distill,
    Reflect,
    Debug,
    Acceptance,
}

impl StageKind {
    pub const ALL: [StageKind; 9] = [
        StageKind::Impl,
        StageKind::Lint,
        StageKind::Tb,
        StageKind::TbLint,
        StageKind::Sim,
        StageKind::Distill,
        StageKind::Reflect,
        StageKind::Debug,
        StageKind::Acceptance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Impl => "impl",
            StageKind::Lint => "lint",
            StageKind::Tb => "tb",
            StageKind::TbLint => "tb_lint",
            StageKind::Sim => "sim",
            StageKind::Distill => "distill",
            StageKind::Reflect => "reflect",
            StageKind::Debug => "debug",
            StageKind::Acceptance => "acceptance",
        }
    }

    /// Node state while a task of this kind is in flight.
    pub fn active_state(self) -> NodeState {
        match self {
            StageKind::Impl => NodeState::Implementing,
            StageKind::Lint => NodeState::Linting,
            StageKind::Tb => NodeState::Testbenching,
            StageKind::TbLint => NodeState::TbLinting,
            StageKind::Sim => NodeState::Simulating,
            StageKind::Distill => NodeState::Distilling,
            StageKind::Reflect => NodeState::Reflecting,
            StageKind::Debug => NodeState::Debugging,
            StageKind::Acceptance => NodeState::Accepting,
        }
    }

    pub fn entity_type(self) -> EntityType {
        match self {
            StageKind::Impl | StageKind::Tb | StageKind::Reflect | StageKind::Debug => {
                EntityType::Reasoning
            }
            StageKind::Lint | StageKind::TbLint | StageKind::Distill | StageKind::Acceptance => {
                EntityType::LightDeterministic
            }
            StageKind::Sim => EntityType::HeavyDeterministic,
        }
    }

    pub fn task_type(self) -> TaskType {
        match self {
            StageKind::Impl => TaskType::Implementation,
            StageKind::Lint => TaskType::Linter,
            StageKind::Tb => TaskType::Testbench,
            StageKind::TbLint => TaskType::TestbenchLinter,
            StageKind::Sim => TaskType::Simulator,
            StageKind::Distill => TaskType::Distillation,
            StageKind::Reflect => TaskType::Reflection,
            StageKind::Debug => TaskType::Debug,
            StageKind::Acceptance => TaskType::Acceptance,
        }
    }

    pub fn from_task_type(task_type: TaskType) -> StageKind {
        match task_type {
            TaskType::Implementation => StageKind::Impl,
            TaskType::Linter => StageKind::Lint,
            TaskType::Testbench => StageKind::Tb,
            TaskType::TestbenchLinter => StageKind::TbLint,
            TaskType::Simulator => StageKind::Sim,
            TaskType::Distillation => StageKind::Distill,
            TaskType::Reflection => StageKind::Reflect,
            TaskType::Debug => StageKind::Debug,
            TaskType::Acceptance => StageKind::Acceptance,
        }
    }

    /// Generation stages run once per node and carry no attempt number.
    pub fn is_attempted(self) -> bool {
        !matches!(self, StageKind::Impl | StageKind::Tb)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow!("unknown stage kind '{s}'"))
    }
}

/// Stage kind plus optional attempt; unique per node per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageKey {
    pub kind: StageKind,
    pub attempt: Option<u32>,
}

impl StageKey {
    pub fn new(kind: StageKind, attempt: Option<u32>) -> Self {
        Self { kind, attempt }
    }

    pub fn bare(kind: StageKind) -> Self {
        Self {
            kind,
            attempt: None,
        }
    }

    pub fn attempted(kind: StageKind, attempt: u32) -> Self {
        Self {
            kind,
            attempt: Some(attempt),
        }
    }

    /// Key for a new task of `kind` when the node is at `attempt`.
    pub fn for_attempt(kind: StageKind, attempt: u32) -> Self {
        if kind.is_attempted() {
            Self::attempted(kind, attempt)
        } else {
            Self::bare(kind)
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attempt {
            Some(attempt) => write!(f, "{}_attempt{}", self.kind, attempt),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl FromStr for StageKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((kind, digits)) = s.rsplit_once("_attempt") {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                bail!("invalid attempt suffix in stage key '{s}'");
            }
            let attempt: u32 = digits
                .parse()
                .map_err(|_| anyhow!("attempt out of range in stage key '{s}'"))?;
            return Ok(StageKey::attempted(kind.parse()?, attempt));
        }
        Ok(StageKey::bare(s.parse()?))
    }
}

impl Serialize for StageKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StageKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_directory_names() {
        assert_eq!(StageKey::bare(StageKind::Impl).to_string(), "impl");
        assert_eq!(
            StageKey::attempted(StageKind::TbLint, 2).to_string(),
            "tb_lint_attempt2"
        );
    }

    #[test]
    fn parses_attempted_and_bare_keys() {
        let key: StageKey = "tb_lint_attempt12".parse().expect("parse");
        assert_eq!(key, StageKey::attempted(StageKind::TbLint, 12));
        let key: StageKey = "acceptance".parse().expect("parse");
        assert_eq!(key, StageKey::bare(StageKind::Acceptance));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("lint_attempt".parse::<StageKey>().is_err());
        assert!("lint_attemptx".parse::<StageKey>().is_err());
        assert!("synth".parse::<StageKey>().is_err());
    }

    #[test]
    fn generation_stages_ignore_attempt() {
        assert_eq!(
            StageKey::for_attempt(StageKind::Tb, 3),
            StageKey::bare(StageKind::Tb)
        );
        assert_eq!(
            StageKey::for_attempt(StageKind::Sim, 3),
            StageKey::attempted(StageKind::Sim, 3)
        );
    }

    #[test]
    fn ordering_is_structural() {
        let mut keys = vec![
            StageKey::attempted(StageKind::Lint, 10),
            StageKey::attempted(StageKind::Lint, 2),
            StageKey::bare(StageKind::Lint),
            StageKey::bare(StageKind::Impl),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                StageKey::bare(StageKind::Impl),
                StageKey::bare(StageKind::Lint),
                StageKey::attempted(StageKind::Lint, 2),
                StageKey::attempted(StageKind::Lint, 10),
            ]
        );
    }

    #[test]
    fn task_type_round_trips_through_kind() {
        for kind in StageKind::ALL {
            assert_eq!(StageKind::from_task_type(kind.task_type()), kind);
        }
    }
}
