//! Task executor implementation

use crate::state::WorkerState;
use async_trait::async_trait;
use courier_backend::{Backend, BackendError, ResultStore};
use courier_broker::{BrokerError, Consumer};
use courier_core::{Delivery, Outcome, StatusRecord, TaskId, TaskMessage, TaskStatus, TaskView, WorkerId};
use courier_telemetry::{log_task_completed, log_task_failed, log_task_started, TaskLogContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn, Instrument};

/// Trait for task handlers.
///
/// Handlers may run more than once for the same task and must tolerate it.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute a task
    async fn execute(&self, task: &TaskMessage) -> Outcome;

    /// Get the handler name
    fn name(&self) -> &str;
}

/// Task type to handler mapping
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding the `echo`, `add`, `sleep` and `fail` handlers
    pub fn with_builtins() -> Self {
        let builtins: [Arc<dyn TaskHandler>; 4] = [
            Arc::new(crate::handlers::EchoHandler),
            Arc::new(crate::handlers::AddHandler),
            Arc::new(crate::handlers::SleepHandler),
            Arc::new(crate::handlers::FailHandler),
        ];
        let handlers: HashMap<String, Arc<dyn TaskHandler>> = builtins
            .into_iter()
            .map(|h| (h.name().to_string(), h))
            .collect();
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Register a handler
    pub async fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(task_type.into(), handler);
    }

    /// Get a handler
    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().await;
        handlers.get(task_type).cloned()
    }

    /// Check if a handler exists
    pub async fn has(&self, task_type: &str) -> bool {
        let handlers = self.handlers.read().await;
        handlers.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub async fn task_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        let mut types: Vec<String> = handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything other than a handler-reported error that goes wrong while
/// processing a task
#[derive(Error, Debug)]
pub enum ExecutionFault {
    #[error("malformed task message: {0}")]
    Malformed(String),

    #[error("store unreachable: {0}")]
    Store(#[from] BackendError),

    #[error("offset commit failed: {0}")]
    Commit(#[from] BrokerError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler exceeded the time limit of {0:?}")]
    TimedOut(Duration),
}

/// What became of one delivery
#[derive(Debug)]
pub enum Processed {
    /// The handler ran, its outcome was stored and the offset committed
    Completed { task_id: TaskId, outcome: Outcome },

    /// The task was already terminal; committed without running the handler
    Skipped { task_id: TaskId, status: TaskStatus },

    /// The handler ran, but another worker had already stored a terminal
    /// result, which was kept
    Superseded { task_id: TaskId, status: TaskStatus },

    /// Processing was abandoned; the offset was not committed unless the
    /// message itself was unreadable
    Faulted {
        task_id: Option<TaskId>,
        fault: ExecutionFault,
    },
}

/// Task executor - drives one task from `processing` to a terminal status
pub struct TaskExecutor<S: Backend> {
    /// Worker ID
    worker_id: WorkerId,

    /// Task registry
    registry: Arc<TaskRegistry>,

    /// Result store
    store: ResultStore<S>,

    /// Shared worker status, reported by heartbeats
    state: Arc<WorkerState>,

    /// Hard limit on one handler invocation
    time_limit: Duration,
}

impl<S: Backend> TaskExecutor<S> {
    /// Create a new executor
    pub fn new(
        worker_id: WorkerId,
        registry: Arc<TaskRegistry>,
        store: ResultStore<S>,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            worker_id,
            registry,
            store,
            state,
            time_limit: Duration::from_secs(300),
        }
    }

    /// Set the handler time limit
    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Process one delivery and commit it on `consumer` once its terminal
    /// status is stored. Never panics and never returns early on a fault.
    pub async fn process<C: Consumer + ?Sized>(&self, delivery: &Delivery, consumer: &C) -> Processed {
        let task: TaskMessage = match delivery.decode() {
            Ok(task) => task,
            Err(e) => {
                // Nothing to record the failure against; drop the message
                error!("Dropping undecodable message {}: {}", delivery.delivery_tag, e);
                if let Err(e) = consumer.commit(delivery).await {
                    warn!("Failed to commit undecodable message: {}", e);
                }
                return Processed::Faulted {
                    task_id: None,
                    fault: ExecutionFault::Malformed(e.to_string()),
                };
            }
        };

        let span = TaskLogContext::new(task.task_id.as_str(), &task.task_type)
            .with_worker(self.worker_id.as_str())
            .span();

        async {
            let processed = self.run(&task, delivery, consumer).await;
            if !matches!(processed, Processed::Skipped { .. }) {
                self.state.record_task();
            }
            self.state.set_idle();
            processed
        }
        .instrument(span)
        .await
    }

    async fn run<C: Consumer + ?Sized>(
        &self,
        task: &TaskMessage,
        delivery: &Delivery,
        consumer: &C,
    ) -> Processed {
        let task_id = task.task_id.clone();

        match self.store.status(&task_id).await {
            Ok(view) if view.is_terminal() => {
                let status = terminal_status(&view);
                info!("Task {} is already {}, skipping", task_id, status);
                return match consumer.commit(delivery).await {
                    Ok(()) => Processed::Skipped { task_id, status },
                    Err(e) => self.faulted(task_id, e.into()),
                };
            }
            Ok(_) => {}
            Err(e) => return self.abandon(task_id, e.into()).await,
        }

        if let Err(e) = self
            .store
            .put_status(&task_id, &StatusRecord::processing(self.worker_id.clone()))
            .await
        {
            return self.abandon(task_id, e.into()).await;
        }
        self.state.set_active();

        log_task_started!(task_id, task.task_type, self.worker_id);
        let start = Instant::now();
        let outcome = self.invoke(task).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &outcome {
            Outcome::Success(_) => log_task_completed!(task_id, task.task_type, duration_ms),
            Outcome::Failure(e) => log_task_failed!(task_id, task.task_type, e),
        }

        // First terminal result wins if a duplicate delivery raced us
        match self.store.status(&task_id).await {
            Ok(view) if view.is_terminal() => {
                let status = terminal_status(&view);
                warn!("Task {} was already finished as {} elsewhere, keeping it", task_id, status);
                return match consumer.commit(delivery).await {
                    Ok(()) => Processed::Superseded { task_id, status },
                    Err(e) => self.faulted(task_id, e.into()),
                };
            }
            Ok(_) => {}
            Err(e) => return self.abandon(task_id, e.into()).await,
        }

        if let Err(e) = self
            .store
            .put_status(&task_id, &StatusRecord::from(outcome.clone()))
            .await
        {
            return self.abandon(task_id, e.into()).await;
        }

        match consumer.commit(delivery).await {
            Ok(()) => {
                debug!("Committed {}", delivery.delivery_tag);
                Processed::Completed { task_id, outcome }
            }
            Err(e) => self.faulted(task_id, e.into()),
        }
    }

    /// Run the handler in its own task so a panic or a hang cannot take the
    /// loop down with it
    async fn invoke(&self, task: &TaskMessage) -> Outcome {
        let Some(handler) = self.registry.get(&task.task_type).await else {
            return Outcome::Failure(format!(
                "No handler registered for task type '{}'",
                task.task_type
            ));
        };

        let owned = task.clone();
        let mut join = tokio::spawn(async move { handler.execute(&owned).await });

        let fault = match tokio::time::timeout(self.time_limit, &mut join).await {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => ExecutionFault::Panicked(e.to_string()),
            Err(_) => {
                join.abort();
                ExecutionFault::TimedOut(self.time_limit)
            }
        };

        Outcome::Failure(system_error(&task.task_id, &fault))
    }

    /// Try to mark the task failed and leave the offset uncommitted
    async fn abandon(&self, task_id: TaskId, fault: ExecutionFault) -> Processed {
        let record = StatusRecord::failed(system_error(&task_id, &fault));
        if let Err(e) = self.store.put_status(&task_id, &record).await {
            warn!("Could not record failure of task {}: {}", task_id, e);
        }
        self.faulted(task_id, fault)
    }

    fn faulted(&self, task_id: TaskId, fault: ExecutionFault) -> Processed {
        error!("Task {} faulted: {}", task_id, fault);
        Processed::Faulted {
            task_id: Some(task_id),
            fault,
        }
    }
}

fn system_error(task_id: &TaskId, fault: &ExecutionFault) -> String {
    format!("System error while processing task {}: {}", task_id, fault)
}

fn terminal_status(view: &TaskView) -> TaskStatus {
    view.record()
        .map(|r| r.status)
        .unwrap_or(TaskStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_backend::MemoryBackend;
    use courier_broker::{Broker, ConsumerConfig, MemoryBroker, MemoryConsumer};
    use courier_core::TaskPayload;
    use serde_json::json;

    const TOPIC: &str = "tasks";

    struct Harness {
        broker: MemoryBroker,
        backend: MemoryBackend,
        store: ResultStore<MemoryBackend>,
        consumer: MemoryConsumer,
        executor: TaskExecutor<MemoryBackend>,
    }

    async fn harness() -> Harness {
        let broker = MemoryBroker::new();
        let backend = MemoryBackend::new();
        let store = ResultStore::new(backend.clone());
        let consumer = broker
            .subscribe(ConsumerConfig::new(TOPIC, "workers").block_timeout(Duration::from_millis(10)))
            .await
            .unwrap();
        let executor = TaskExecutor::new(
            WorkerId::from("worker_test"),
            Arc::new(TaskRegistry::with_builtins()),
            store.clone(),
            Arc::new(WorkerState::new()),
        );
        Harness {
            broker,
            backend,
            store,
            consumer,
            executor,
        }
    }

    impl Harness {
        async fn send(&mut self, task_type: &str, data: serde_json::Value) -> (TaskId, Delivery) {
            let id = TaskId::new();
            let message = TaskMessage::new(id.clone(), TaskPayload::new(task_type, data));
            self.store.put_status(&id, &StatusRecord::queued()).await.unwrap();
            self.broker.publish_json(TOPIC, id.as_str(), &message).await.unwrap();
            let delivery = self.consumer.next().await.unwrap().unwrap();
            (id, delivery)
        }

        fn committed(&self) -> u64 {
            self.broker.committed_offset(TOPIC, "workers", 0)
        }
    }

    #[tokio::test]
    async fn test_success_is_stored_then_committed() {
        let mut h = harness().await;
        let (id, delivery) = h.send("add", json!({"a": 1, "b": 2})).await;

        let processed = h.executor.process(&delivery, &h.consumer).await;
        assert!(matches!(processed, Processed::Completed { .. }));

        let view = h.store.status(&id).await.unwrap();
        assert_eq!(view, TaskView::Known(StatusRecord::success(json!({"result": 3}))));
        assert_eq!(h.committed(), 1);
        assert_eq!(h.executor.state().task_count(), 1);
        assert_eq!(h.executor.state().status(), courier_core::WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_handler_error_is_recorded() {
        let mut h = harness().await;
        let (id, delivery) = h.send("fail", json!({"error": "bad input"})).await;

        h.executor.process(&delivery, &h.consumer).await;

        let view = h.store.status(&id).await.unwrap();
        assert_eq!(view, TaskView::Known(StatusRecord::failed("bad input")));
        assert_eq!(h.committed(), 1);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_task() {
        let mut h = harness().await;
        let (id, delivery) = h.send("resize_image", json!({})).await;

        h.executor.process(&delivery, &h.consumer).await;

        let record = h.store.status(&id).await.unwrap().record().cloned().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("resize_image"));
    }

    struct PanicHandler;

    #[async_trait]
    impl TaskHandler for PanicHandler {
        async fn execute(&self, _task: &TaskMessage) -> Outcome {
            panic!("handler blew up");
        }

        fn name(&self) -> &str {
            "panic"
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_crash() {
        let mut h = harness().await;
        h.executor.registry.register("panic", Arc::new(PanicHandler)).await;
        let (id, delivery) = h.send("panic", json!(null)).await;

        let processed = h.executor.process(&delivery, &h.consumer).await;
        assert!(matches!(processed, Processed::Completed { .. }));

        let record = h.store.status(&id).await.unwrap().record().cloned().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().starts_with("System error while processing task"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit() {
        let mut h = harness().await;
        h.executor = TaskExecutor::new(
            WorkerId::from("worker_test"),
            Arc::new(TaskRegistry::with_builtins()),
            h.store.clone(),
            Arc::new(WorkerState::new()),
        )
        .with_time_limit(Duration::from_secs(5));
        let (id, delivery) = h.send("sleep", json!({"seconds": 60})).await;

        h.executor.process(&delivery, &h.consumer).await;

        let record = h.store.status(&id).await.unwrap().record().cloned().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("time limit"));
    }

    #[tokio::test]
    async fn test_store_outage_leaves_offset_uncommitted() {
        let mut h = harness().await;
        let (_, delivery) = h.send("echo", json!("hi")).await;
        h.backend.fail_writes(true);

        let processed = h.executor.process(&delivery, &h.consumer).await;
        assert!(matches!(
            processed,
            Processed::Faulted {
                fault: ExecutionFault::Store(_),
                ..
            }
        ));
        assert_eq!(h.committed(), 0);
        assert_eq!(h.executor.state().status(), courier_core::WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_recorded_fault_is_not_rerun_on_redelivery() {
        let mut h = harness().await;
        let (id, delivery) = h.send("echo", json!("hi")).await;

        // the status read fails but the failure record still lands
        h.backend.fail_reads(true);
        let processed = h.executor.process(&delivery, &h.consumer).await;
        assert!(matches!(processed, Processed::Faulted { .. }));
        assert_eq!(h.committed(), 0);
        h.backend.fail_reads(false);

        h.consumer = h
            .broker
            .subscribe(ConsumerConfig::new(TOPIC, "workers").block_timeout(Duration::from_millis(10)))
            .await
            .unwrap();
        let again = h.consumer.next().await.unwrap().unwrap();
        assert!(again.redelivered);

        let processed = h.executor.process(&again, &h.consumer).await;
        assert!(matches!(
            processed,
            Processed::Skipped {
                status: TaskStatus::Failed,
                ..
            }
        ));
        let record = h.store.status(&id).await.unwrap().record().cloned().unwrap();
        assert!(record.error.unwrap().starts_with("System error while processing task"));
        assert_eq!(h.committed(), 1);
    }

    #[tokio::test]
    async fn test_terminal_task_is_skipped() {
        let mut h = harness().await;
        let (id, delivery) = h.send("add", json!({"a": 1, "b": 2})).await;
        h.store
            .put_status(&id, &StatusRecord::success(json!("done")))
            .await
            .unwrap();

        let processed = h.executor.process(&delivery, &h.consumer).await;
        assert!(matches!(
            processed,
            Processed::Skipped {
                status: TaskStatus::Success,
                ..
            }
        ));
        assert_eq!(
            h.store.status(&id).await.unwrap(),
            TaskView::Known(StatusRecord::success(json!("done")))
        );
        assert_eq!(h.committed(), 1);
        assert_eq!(h.executor.state().task_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let mut h = harness().await;
        h.broker
            .publish(TOPIC, "x", bytes_of("{\"nope\": true}"))
            .await
            .unwrap();
        let delivery = h.consumer.next().await.unwrap().unwrap();

        let processed = h.executor.process(&delivery, &h.consumer).await;
        assert!(matches!(
            processed,
            Processed::Faulted {
                task_id: None,
                fault: ExecutionFault::Malformed(_)
            }
        ));
        assert_eq!(h.committed(), 1);
    }

    fn bytes_of(s: &'static str) -> bytes::Bytes {
        bytes::Bytes::from_static(s.as_bytes())
    }
}
