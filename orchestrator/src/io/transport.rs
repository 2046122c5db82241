//! Message transport between the orchestrator and worker pools.
//!
//! The [`Transport`] trait is the topic-exchange contract: tasks are routed by
//! entity type to a durable queue, every result lands on one results queue,
//! and redeliveries carry an `x-retry-count` header. [`InMemoryBroker`] is the
//! in-process implementation used by the CLI demo paths and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::types::EntityType;
use crate::messages::{ResultMessage, TaskMessage};

pub const RESULTS_ROUTING_KEY: &str = "RESULTS";
pub const AGENT_QUEUE: &str = "agent_tasks";
pub const PROCESS_QUEUE: &str = "process_tasks";
pub const SIMULATION_QUEUE: &str = "simulation_tasks";
pub const RESULTS_QUEUE: &str = "results";
pub const RETRY_HEADER: &str = "x-retry-count";

/// Queue bound to a routing key on the task exchange.
pub fn queue_for(routing_key: &str) -> Option<&'static str> {
    match routing_key {
        "REASONING" => Some(AGENT_QUEUE),
        "LIGHT_DETERMINISTIC" => Some(PROCESS_QUEUE),
        "HEAVY_DETERMINISTIC" => Some(SIMULATION_QUEUE),
        RESULTS_ROUTING_KEY => Some(RESULTS_QUEUE),
        _ => None,
    }
}

pub fn queue_for_entity(entity: EntityType) -> &'static str {
    match entity {
        EntityType::Reasoning => AGENT_QUEUE,
        EntityType::LightDeterministic => PROCESS_QUEUE,
        EntityType::HeavyDeterministic => SIMULATION_QUEUE,
    }
}

/// One message as it sits on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl Delivery {
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            headers: BTreeMap::new(),
        }
    }

    /// Redeliveries so far; a missing or garbled header counts as zero.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_HEADER)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    /// Copy of this delivery for the next redelivery.
    pub fn next_retry(&self) -> Delivery {
        let mut next = self.clone();
        next.headers
            .insert(RETRY_HEADER.to_string(), (self.retry_count() + 1).to_string());
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub delivery: Delivery,
    pub reason: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a task on the exchange under `routing_key`.
    async fn publish(&self, routing_key: &str, task: &TaskMessage) -> Result<()>;

    /// Re-publish an existing delivery (transient retry).
    async fn republish(&self, delivery: Delivery) -> Result<()>;

    async fn publish_result(&self, result: &ResultMessage) -> Result<()>;

    /// Take the next delivery from `queue`, waiting at most `wait`.
    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Put a delivery back at the tail of `queue` unchanged.
    async fn requeue(&self, queue: &str, delivery: Delivery) -> Result<()>;

    async fn dead_letter(&self, queue: &str, delivery: Delivery, reason: &str) -> Result<()>;

    /// Next result from the results queue, or `None` after `wait` of idleness.
    ///
    /// Malformed results are dead-lettered and reported as idle.
    async fn next_result(&self, wait: Duration) -> Result<Option<ResultMessage>> {
        let Some(delivery) = self.consume(RESULTS_QUEUE, wait).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<ResultMessage>(&delivery.body) {
            Ok(result) => Ok(Some(result)),
            Err(err) => {
                warn!(error = %err, "dropping malformed result");
                let reason = format!("malformed result: {err}");
                self.dead_letter(RESULTS_QUEUE, delivery, &reason).await?;
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Delivery>>,
    published: Vec<TaskMessage>,
    dead_letters: Vec<DeadLetter>,
}

/// Process-local topic broker with durable-queue semantics for one run.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task ever published through [`Transport::publish`], in order.
    pub fn published(&self) -> Vec<TaskMessage> {
        self.lock().published.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Pop without waiting.
    pub fn try_consume(&self, queue: &str) -> Option<Delivery> {
        self.lock().queues.get_mut(queue).and_then(VecDeque::pop_front)
    }

    /// Pop and decode a task without waiting.
    pub fn try_take_task(&self, queue: &str) -> Result<Option<TaskMessage>> {
        self.try_consume(queue)
            .map(|delivery| {
                serde_json::from_slice(&delivery.body).context("decode task message")
            })
            .transpose()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, delivery: Delivery) -> Result<()> {
        let queue = queue_for(&delivery.routing_key)
            .ok_or_else(|| anyhow!("no queue bound to routing key '{}'", delivery.routing_key))?;
        self.push_to(queue, delivery);
        Ok(())
    }

    fn push_to(&self, queue: &str, delivery: Delivery) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(delivery);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn publish(&self, routing_key: &str, task: &TaskMessage) -> Result<()> {
        let body = serde_json::to_vec(task).context("serialize task message")?;
        self.push(Delivery::new(routing_key, body))?;
        self.lock().published.push(task.clone());
        debug!(routing_key, task_id = %task.task_id, task_type = %task.task_type, "task published");
        Ok(())
    }

    async fn republish(&self, delivery: Delivery) -> Result<()> {
        debug!(
            routing_key = %delivery.routing_key,
            retry = delivery.retry_count(),
            "task republished"
        );
        self.push(delivery)
    }

    async fn publish_result(&self, result: &ResultMessage) -> Result<()> {
        let body = serde_json::to_vec(result).context("serialize result message")?;
        self.push(Delivery::new(RESULTS_ROUTING_KEY, body))
    }

    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            // Registered before the check so a concurrent push is not missed.
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_consume(queue) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue(&self, queue: &str, delivery: Delivery) -> Result<()> {
        self.push_to(queue, delivery);
        Ok(())
    }

    async fn dead_letter(&self, queue: &str, delivery: Delivery, reason: &str) -> Result<()> {
        warn!(queue, reason, "message dead-lettered");
        self.lock().dead_letters.push(DeadLetter {
            queue: queue.to_string(),
            delivery,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::types::TaskType;
    use crate::messages::TaskContext;
    use uuid::Uuid;

    fn task(entity: EntityType, task_type: TaskType) -> TaskMessage {
        TaskMessage::new(Uuid::new_v4(), entity, task_type, TaskContext::new("alu"))
    }

    #[test]
    fn routing_keys_bind_to_queues() {
        assert_eq!(queue_for("REASONING"), Some(AGENT_QUEUE));
        assert_eq!(queue_for("HEAVY_DETERMINISTIC"), Some(SIMULATION_QUEUE));
        assert_eq!(queue_for("RESULTS"), Some(RESULTS_QUEUE));
        assert_eq!(queue_for("UNKNOWN"), None);
        for entity in [
            EntityType::Reasoning,
            EntityType::LightDeterministic,
            EntityType::HeavyDeterministic,
        ] {
            assert_eq!(queue_for(entity.routing_key()), Some(queue_for_entity(entity)));
        }
    }

    #[test]
    fn retry_header_increments() {
        let delivery = Delivery::new("REASONING", b"{}".to_vec());
        assert_eq!(delivery.retry_count(), 0);
        let next = delivery.next_retry().next_retry();
        assert_eq!(next.retry_count(), 2);
        assert_eq!(next.headers.get(RETRY_HEADER).map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn publish_routes_by_entity_type() {
        let broker = InMemoryBroker::new();
        let lint = task(EntityType::LightDeterministic, TaskType::Linter);
        broker
            .publish(lint.entity_type.routing_key(), &lint)
            .await
            .expect("publish");
        assert_eq!(broker.queue_len(PROCESS_QUEUE), 1);
        assert_eq!(broker.queue_len(AGENT_QUEUE), 0);
        let taken = broker.try_take_task(PROCESS_QUEUE).expect("decode").expect("task");
        assert_eq!(taken, lint);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn unknown_routing_key_is_an_error() {
        let broker = InMemoryBroker::new();
        let t = task(EntityType::Reasoning, TaskType::Debug);
        assert!(broker.publish("NOWHERE", &t).await.is_err());
    }

    #[tokio::test]
    async fn consume_times_out_when_idle() {
        let broker = InMemoryBroker::new();
        let got = broker
            .consume(AGENT_QUEUE, Duration::from_millis(20))
            .await
            .expect("consume");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn consume_wakes_on_publish() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = Arc::clone(&broker);
        let t = task(EntityType::Reasoning, TaskType::Implementation);
        let expected = t.task_id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.publish("REASONING", &t).await.expect("publish");
        });
        let delivery = broker
            .consume(AGENT_QUEUE, Duration::from_secs(5))
            .await
            .expect("consume")
            .expect("delivery");
        let decoded: TaskMessage = serde_json::from_slice(&delivery.body).expect("decode");
        assert_eq!(decoded.task_id, expected);
        handle.await.expect("join");
    }

    #[tokio::test]
    async fn malformed_results_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        broker
            .republish(Delivery::new(RESULTS_ROUTING_KEY, b"not json".to_vec()))
            .await
            .expect("push");
        let got = broker
            .next_result(Duration::from_millis(10))
            .await
            .expect("next");
        assert!(got.is_none());
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue, RESULTS_QUEUE);
    }

    #[tokio::test]
    async fn results_round_trip_through_results_queue() {
        let broker = InMemoryBroker::new();
        let t = task(EntityType::HeavyDeterministic, TaskType::Simulator);
        let result = ResultMessage::success(&t, "Simulation passed.");
        broker.publish_result(&result).await.expect("publish");
        let got = broker
            .next_result(Duration::from_millis(10))
            .await
            .expect("next")
            .expect("result");
        assert_eq!(got, result);
    }
}
