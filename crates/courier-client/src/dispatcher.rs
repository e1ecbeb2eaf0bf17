//! Task dispatch

use courier_backend::{Backend, BackendError, ResultStore};
use courier_broker::{Broker, BrokerError};
use courier_core::{StatusRecord, TaskId, TaskMessage, TaskPayload, TaskView};
use courier_telemetry::log_task_submitted;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors surfaced to a task submitter
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The task message could not be published
    #[error("transport error: {0}")]
    Transport(#[from] BrokerError),

    /// A status or payload record could not be read or written
    #[error("store error: {0}")]
    Store(#[from] BackendError),

    /// The task could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Publishes tasks and records their initial status
#[derive(Clone)]
pub struct Dispatcher<B: Broker, S: Backend> {
    broker: B,
    store: ResultStore<S>,
    topic: String,
}

impl<B: Broker, S: Backend> Dispatcher<B, S> {
    pub fn new(broker: B, store: ResultStore<S>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            store,
            topic: topic.into(),
        }
    }

    pub fn store(&self) -> &ResultStore<S> {
        &self.store
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Task topic this dispatcher publishes to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Submit a new task under a fresh id.
    ///
    /// The payload and the `queued` record are written before the message is
    /// published, so a status lookup never misses a task that is in flight.
    /// If the publish fails both records are removed again and the transport
    /// error is returned.
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        data: Value,
    ) -> Result<TaskId, DispatchError> {
        let task_id = TaskId::new();
        let payload = TaskPayload::new(task_type, data);

        self.store.put_payload(&task_id, &payload).await?;
        if let Err(e) = self.store.put_status(&task_id, &StatusRecord::queued()).await {
            self.rollback(&task_id).await;
            return Err(e.into());
        }

        let message = TaskMessage::new(task_id.clone(), payload);
        if let Err(e) = self.publish(&message).await {
            error!("Failed to publish task {}: {}", task_id, e);
            self.rollback(&task_id).await;
            return Err(e);
        }

        log_task_submitted!(task_id, message.task_type);
        Ok(task_id)
    }

    /// Publish an existing task again under the same id.
    ///
    /// Used to recover work from a dead worker: the record goes back to
    /// `queued` and a new message carrying the stored payload is appended to
    /// the task topic. Nothing is rolled back on failure.
    pub async fn resubmit(&self, task_id: &TaskId, payload: TaskPayload) -> Result<(), DispatchError> {
        self.store.put_status(task_id, &StatusRecord::queued()).await?;

        let message = TaskMessage::new(task_id.clone(), payload);
        self.publish(&message).await?;

        debug!("Resubmitted task {} ({})", task_id, message.task_type);
        Ok(())
    }

    /// Current status of a task, `Unknown` if it was never submitted
    pub async fn status(&self, task_id: &TaskId) -> Result<TaskView, DispatchError> {
        Ok(self.store.status(task_id).await?)
    }

    async fn publish(&self, message: &TaskMessage) -> Result<(), DispatchError> {
        let key = message.task_id.as_str();
        match self.broker.publish_json(&self.topic, key, message).await {
            Ok(()) => Ok(()),
            Err(BrokerError::Serialization(e)) => Err(DispatchError::Serialization(e)),
            Err(e) => Err(DispatchError::Transport(e)),
        }
    }

    async fn rollback(&self, task_id: &TaskId) {
        if let Err(e) = self.store.forget(task_id).await {
            warn!("Failed to roll back records of task {}: {}", task_id, e);
        }
    }
}
