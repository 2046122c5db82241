//! Worker contract and the delivery runtime shared by every worker pool.
//!
//! A worker only turns a [`TaskMessage`] into a [`ResultMessage`]. The
//! runtime owns delivery policy: requeue tasks addressed to other workers,
//! dead-letter malformed or invalid input, retry transient errors up to a
//! bound, and make sure every accepted task ends in exactly one result.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::types::{TaskStatus, TaskType};
use crate::io::transport::{Delivery, Transport};
use crate::messages::{ResultMessage, TaskMessage};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Missing or invalid input; retrying cannot help.
    #[error("task input error: {0}")]
    Input(String),
    /// Temporary failure such as a tool timeout.
    #[error("transient error: {0}")]
    Transient(String),
    /// Unexpected failure inside the worker.
    #[error("unhandled worker error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self, task_type: TaskType) -> bool;

    /// Must be idempotent: the same task may be delivered more than once.
    async fn handle(&self, task: &TaskMessage) -> Result<ResultMessage, WorkerError>;
}

/// What the runtime did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed(TaskStatus),
    /// Addressed to a different worker type; put back on the queue.
    Requeued,
    /// Re-published after a transient error with this retry count.
    Retried(u32),
    DeadLettered(String),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: String,
    pub max_delivery_retries: u32,
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn new(queue: impl Into<String>, max_delivery_retries: u32) -> Self {
        Self {
            queue: queue.into(),
            max_delivery_retries,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Apply the delivery policy to one message taken from `queue`.
pub async fn process_delivery<T, W>(
    transport: &T,
    worker: &W,
    queue: &str,
    delivery: Delivery,
    max_delivery_retries: u32,
) -> Result<DeliveryOutcome>
where
    T: Transport + ?Sized,
    W: Worker + ?Sized,
{
    let task: TaskMessage = match serde_json::from_slice(&delivery.body) {
        Ok(task) => task,
        Err(err) => {
            let reason = format!("malformed task: {err}");
            transport.dead_letter(queue, delivery, &reason).await?;
            return Ok(DeliveryOutcome::DeadLettered(reason));
        }
    };

    if !worker.handles(task.task_type) {
        transport.requeue(queue, delivery).await?;
        return Ok(DeliveryOutcome::Requeued);
    }

    let node_id = task.context.node_id.as_str();
    match worker.handle(&task).await {
        Ok(result) => {
            debug!(worker = worker.name(), node_id, task_id = %task.task_id, status = ?result.status, "task handled");
            let status = result.status;
            transport.publish_result(&result).await?;
            Ok(DeliveryOutcome::Completed(status))
        }
        Err(WorkerError::Input(msg)) => {
            warn!(worker = worker.name(), node_id, error = %msg, "rejecting task input");
            let reason = WorkerError::Input(msg).to_string();
            transport.dead_letter(queue, delivery, &reason).await?;
            transport
                .publish_result(&ResultMessage::failure(&task, reason.clone()))
                .await?;
            Ok(DeliveryOutcome::DeadLettered(reason))
        }
        Err(WorkerError::Transient(msg)) => {
            let retry = delivery.retry_count();
            if retry < max_delivery_retries {
                info!(worker = worker.name(), node_id, retry = retry + 1, error = %msg, "retrying task");
                transport.republish(delivery.next_retry()).await?;
                return Ok(DeliveryOutcome::Retried(retry + 1));
            }
            let reason = format!(
                "transient error persisted after {max_delivery_retries} retries: {msg}"
            );
            warn!(worker = worker.name(), node_id, "{reason}");
            transport.dead_letter(queue, delivery, &reason).await?;
            transport
                .publish_result(&ResultMessage::failure(&task, reason.clone()))
                .await?;
            Ok(DeliveryOutcome::DeadLettered(reason))
        }
        Err(err @ WorkerError::Internal(_)) => {
            warn!(worker = worker.name(), node_id, error = %err, "worker failed");
            transport
                .publish_result(&ResultMessage::failure(&task, err.to_string()))
                .await?;
            Ok(DeliveryOutcome::Completed(TaskStatus::Failure))
        }
    }
}

/// Drive `worker` against its queue until `cancel` fires.
pub async fn run_worker<T, W>(
    transport: Arc<T>,
    worker: Arc<W>,
    settings: WorkerSettings,
    cancel: CancellationToken,
) -> Result<()>
where
    T: Transport + ?Sized,
    W: Worker + ?Sized,
{
    info!(worker = worker.name(), queue = %settings.queue, "worker started");
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = transport.consume(&settings.queue, settings.poll_interval) => delivery?,
        };
        let Some(delivery) = delivery else {
            continue;
        };
        let outcome = process_delivery(
            transport.as_ref(),
            worker.as_ref(),
            &settings.queue,
            delivery,
            settings.max_delivery_retries,
        )
        .await?;
        if outcome == DeliveryOutcome::Requeued {
            // Give the worker that owns this task type a chance to claim it.
            tokio::time::sleep(settings.poll_interval / 10).await;
        }
    }
    info!(worker = worker.name(), "worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::types::EntityType;
    use crate::io::transport::{InMemoryBroker, PROCESS_QUEUE, RESULTS_QUEUE};
    use crate::messages::TaskContext;
    use uuid::Uuid;

    /// Fails with the scripted errors first, then succeeds.
    struct Scripted {
        errors: Mutex<Vec<WorkerError>>,
    }

    impl Scripted {
        fn new(mut errors: Vec<WorkerError>) -> Self {
            errors.reverse();
            Self {
                errors: Mutex::new(errors),
            }
        }
    }

    #[async_trait]
    impl Worker for Scripted {
        fn name(&self) -> &str {
            "scripted-linter"
        }

        fn handles(&self, task_type: TaskType) -> bool {
            task_type == TaskType::Linter
        }

        async fn handle(&self, task: &TaskMessage) -> Result<ResultMessage, WorkerError> {
            let next = self.errors.lock().expect("lock").pop();
            match next {
                Some(err) => Err(err),
                None => Ok(ResultMessage::success(task, "lint clean")),
            }
        }
    }

    async fn enqueue(broker: &InMemoryBroker, task_type: TaskType) -> TaskMessage {
        let task = TaskMessage::new(
            Uuid::new_v4(),
            EntityType::LightDeterministic,
            task_type,
            TaskContext::new("alu"),
        );
        broker
            .publish(task.entity_type.routing_key(), &task)
            .await
            .expect("publish");
        task
    }

    async fn step(broker: &InMemoryBroker, worker: &Scripted, max: u32) -> DeliveryOutcome {
        let delivery = broker.try_consume(PROCESS_QUEUE).expect("delivery");
        process_delivery(broker, worker, PROCESS_QUEUE, delivery, max)
            .await
            .expect("process")
    }

    async fn only_result(broker: &InMemoryBroker) -> ResultMessage {
        let result = broker
            .next_result(Duration::from_millis(10))
            .await
            .expect("next")
            .expect("result");
        assert_eq!(broker.queue_len(RESULTS_QUEUE), 0);
        result
    }

    #[tokio::test]
    async fn success_publishes_one_result() {
        let broker = InMemoryBroker::new();
        let worker = Scripted::new(vec![]);
        let task = enqueue(&broker, TaskType::Linter).await;
        assert_eq!(
            step(&broker, &worker, 3).await,
            DeliveryOutcome::Completed(TaskStatus::Success)
        );
        let result = only_result(&broker).await;
        assert_eq!(result.task_id, task.task_id);
        assert_eq!(result.correlation_id, task.correlation_id);
    }

    #[tokio::test]
    async fn foreign_task_types_are_requeued() {
        let broker = InMemoryBroker::new();
        let worker = Scripted::new(vec![]);
        enqueue(&broker, TaskType::Acceptance).await;
        assert_eq!(step(&broker, &worker, 3).await, DeliveryOutcome::Requeued);
        assert_eq!(broker.queue_len(PROCESS_QUEUE), 1);
        assert_eq!(broker.queue_len(RESULTS_QUEUE), 0);
    }

    #[tokio::test]
    async fn input_errors_dead_letter_and_report_failure() {
        let broker = InMemoryBroker::new();
        let worker = Scripted::new(vec![WorkerError::Input("missing rtl_path".to_string())]);
        enqueue(&broker, TaskType::Linter).await;
        assert!(matches!(
            step(&broker, &worker, 3).await,
            DeliveryOutcome::DeadLettered(_)
        ));
        assert_eq!(broker.dead_letters().len(), 1);
        let result = only_result(&broker).await;
        assert_eq!(result.status, TaskStatus::Failure);
        assert!(result.log_output.contains("missing rtl_path"));
    }

    #[tokio::test]
    async fn transient_errors_retry_then_succeed() {
        let broker = InMemoryBroker::new();
        let worker = Scripted::new(vec![
            WorkerError::Transient("tool timeout".to_string()),
            WorkerError::Transient("tool timeout".to_string()),
        ]);
        enqueue(&broker, TaskType::Linter).await;
        assert_eq!(step(&broker, &worker, 3).await, DeliveryOutcome::Retried(1));
        assert_eq!(step(&broker, &worker, 3).await, DeliveryOutcome::Retried(2));
        assert_eq!(
            step(&broker, &worker, 3).await,
            DeliveryOutcome::Completed(TaskStatus::Success)
        );
        assert!(broker.dead_letters().is_empty());
        assert_eq!(only_result(&broker).await.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn transient_errors_exhaust_into_failure() {
        let broker = InMemoryBroker::new();
        let worker = Scripted::new(vec![
            WorkerError::Transient("busy".to_string()),
            WorkerError::Transient("busy".to_string()),
        ]);
        enqueue(&broker, TaskType::Linter).await;
        assert_eq!(step(&broker, &worker, 1).await, DeliveryOutcome::Retried(1));
        assert!(matches!(
            step(&broker, &worker, 1).await,
            DeliveryOutcome::DeadLettered(_)
        ));
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(only_result(&broker).await.status, TaskStatus::Failure);
    }

    #[tokio::test]
    async fn internal_errors_report_failure() {
        let broker = InMemoryBroker::new();
        let worker = Scripted::new(vec![WorkerError::Internal("panic in parser".to_string())]);
        enqueue(&broker, TaskType::Linter).await;
        assert_eq!(
            step(&broker, &worker, 3).await,
            DeliveryOutcome::Completed(TaskStatus::Failure)
        );
        assert!(broker.dead_letters().is_empty());
        assert_eq!(only_result(&broker).await.status, TaskStatus::Failure);
    }

    #[tokio::test]
    async fn malformed_tasks_are_dead_lettered_without_result() {
        let broker = InMemoryBroker::new();
        let worker = Scripted::new(vec![]);
        broker
            .republish(Delivery::new("LIGHT_DETERMINISTIC", b"{".to_vec()))
            .await
            .expect("push");
        assert!(matches!(
            step(&broker, &worker, 3).await,
            DeliveryOutcome::DeadLettered(_)
        ));
        assert_eq!(broker.queue_len(RESULTS_QUEUE), 0);
    }

    #[tokio::test]
    async fn run_worker_stops_on_cancel() {
        let broker = Arc::new(InMemoryBroker::new());
        let worker = Arc::new(Scripted::new(vec![]));
        let cancel = CancellationToken::new();
        let mut settings = WorkerSettings::new(PROCESS_QUEUE, 3);
        settings.poll_interval = Duration::from_millis(5);
        let handle = tokio::spawn(run_worker(
            Arc::clone(&broker),
            worker,
            settings,
            cancel.clone(),
        ));
        let task = enqueue(&broker, TaskType::Linter).await;
        let result = broker
            .next_result(Duration::from_secs(5))
            .await
            .expect("next")
            .expect("result");
        assert_eq!(result.task_id, task.task_id);
        cancel.cancel();
        handle.await.expect("join").expect("worker");
    }
}
