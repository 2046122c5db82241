//! The control loop: waits on results, the deadline and the stop signal.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::types::NodeState;
use crate::engine::{Dispatch, Engine};
use crate::io::config::OrchestratorConfig;
use crate::io::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Longest idle wait for one result poll.
    pub poll_interval: Duration,
    pub deadline: Option<Instant>,
}

impl LoopSettings {
    /// Settings for a run starting now.
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        let deadline = crate::core::budget::run_deadline(
            std::time::Instant::now(),
            cfg.run_timeout_secs,
        )
        .map(Instant::from_std);
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            deadline,
        }
    }
}

/// Why the loop stopped. `remaining` lists nodes still non-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Complete,
    TimedOut { remaining: Vec<String> },
    Cancelled { remaining: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub stop: StopReason,
    pub states: BTreeMap<String, NodeState>,
    pub tasks_published: usize,
    pub results_applied: usize,
}

impl RunOutcome {
    pub fn all_done(&self) -> bool {
        self.stop == StopReason::Complete
            && self.states.values().all(|state| *state == NodeState::Done)
    }
}

/// Start the engine and feed it results until every node is terminal, the
/// deadline passes, or `cancel` fires.
pub async fn run<T: Transport + ?Sized>(
    engine: &mut Engine<T>,
    settings: LoopSettings,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    engine.start().await?;
    let transport = engine.transport();
    let mut applied = 0usize;

    let stop = loop {
        if engine.is_complete() {
            break StopReason::Complete;
        }
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break StopReason::Cancelled { remaining: engine.registry().non_terminal() };
            }
            _ = wait_for(settings.deadline) => {
                break StopReason::TimedOut { remaining: engine.registry().non_terminal() };
            }
            polled = transport.next_result(settings.poll_interval) => polled,
        };
        match polled {
            Ok(Some(result)) => {
                if let Dispatch::Applied { .. } = engine.dispatch(result).await {
                    applied += 1;
                }
            }
            Ok(None) => {}
            Err(err) => {
                let msg = format!("{err:#}");
                warn!(error = %msg, "result poll failed");
                tokio::time::sleep(settings.poll_interval).await;
            }
        }
    };

    match &stop {
        StopReason::Complete => info!(applied, "run complete"),
        StopReason::TimedOut { remaining } => {
            warn!(remaining = remaining.len(), "run timed out with nodes in flight");
        }
        StopReason::Cancelled { remaining } => {
            info!(remaining = remaining.len(), "run cancelled");
        }
    }
    Ok(RunOutcome {
        stop,
        states: engine.states(),
        tasks_published: engine.published_count(),
        results_applied: applied,
    })
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::io::transport::InMemoryBroker;
    use crate::test_support::DesignFixture;
    use std::sync::Arc;

    fn settings(deadline: Option<Instant>) -> LoopSettings {
        LoopSettings {
            poll_interval: Duration::from_millis(10),
            deadline,
        }
    }

    #[tokio::test]
    async fn empty_graph_completes_immediately() {
        let fixture = DesignFixture::new();
        let mut engine = fixture.engine(Arc::new(InMemoryBroker::new()), EngineSettings::default());
        let outcome = run(&mut engine, settings(None), CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(outcome.stop, StopReason::Complete);
        assert_eq!(outcome.tasks_published, 0);
    }

    #[tokio::test]
    async fn deadline_reports_remaining_nodes() {
        let fixture = DesignFixture::new().node("a", &[]).node("b", &["a"]);
        let mut engine = fixture.engine(Arc::new(InMemoryBroker::new()), EngineSettings::default());
        let deadline = Instant::now() + Duration::from_millis(50);
        let outcome = run(&mut engine, settings(Some(deadline)), CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(
            outcome.stop,
            StopReason::TimedOut {
                remaining: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(outcome.tasks_published, 1);
        assert_eq!(outcome.states["a"], NodeState::Implementing);
    }

    #[tokio::test]
    async fn cancel_stops_the_loop() {
        let fixture = DesignFixture::new().node("a", &[]);
        let mut engine = fixture.engine(Arc::new(InMemoryBroker::new()), EngineSettings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run(&mut engine, settings(None), cancel).await.expect("run");
        assert_eq!(
            outcome.stop,
            StopReason::Cancelled {
                remaining: vec!["a".to_string()]
            }
        );
        assert!(!outcome.all_done());
    }
}
