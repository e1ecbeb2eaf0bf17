//! Recovery of tasks held by dead workers

use courier_backend::{Backend, BackendError, ResultStore};
use courier_broker::Broker;
use courier_client::{DispatchError, Dispatcher};
use courier_core::{StatusRecord, TaskId, TaskPayload, TaskStatus, WorkerId};
use courier_telemetry::log_task_requeued;
use thiserror::Error;
use tracing::{error, info, warn};

/// Why one task could not be requeued
#[derive(Error, Debug)]
pub enum ReprocessError {
    /// No payload record exists; the task is marked failed instead
    #[error("original payload of task {0} is missing")]
    MissingPayload(TaskId),

    #[error("store error: {0}")]
    Store(#[from] BackendError),

    #[error("resubmission failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("cannot requeue: {0}")]
    Transition(#[from] courier_core::Error),
}

impl ReprocessError {
    /// Whether trying again later can help
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            ReprocessError::MissingPayload(_) | ReprocessError::Transition(_)
        )
    }
}

/// Result of reprocessing one dead worker
#[derive(Debug, Default)]
pub struct ReprocessReport {
    /// Tasks back on the queue
    pub requeued: Vec<TaskId>,

    /// Tasks the worker no longer owned by the time they were looked at
    pub skipped: Vec<TaskId>,

    /// Tasks that could not be requeued
    pub failed: Vec<(TaskId, ReprocessError)>,
}

impl ReprocessReport {
    /// True when a later attempt could still requeue something
    pub fn needs_retry(&self) -> bool {
        self.failed.iter().any(|(_, e)| e.is_retriable())
    }
}

/// Hands the `processing` tasks of a dead worker back to the queue
#[derive(Clone)]
pub struct Reprocessor<B: Broker, S: Backend> {
    dispatcher: Dispatcher<B, S>,
}

impl<B: Broker, S: Backend> Reprocessor<B, S> {
    pub fn new(dispatcher: Dispatcher<B, S>) -> Self {
        Self { dispatcher }
    }

    fn store(&self) -> &ResultStore<S> {
        self.dispatcher.store()
    }

    /// Requeue every task in `processing` under `worker_id`.
    ///
    /// Each task is resubmitted with its stored original payload under its
    /// own id. A task whose resubmission fails is put back to `processing`
    /// under the dead worker so a later call finds it again. Fails as a
    /// whole only if the status scan fails.
    pub async fn reprocess(&self, worker_id: &WorkerId) -> Result<ReprocessReport, BackendError> {
        let mut report = ReprocessReport::default();

        let owned: Vec<TaskId> = self
            .store()
            .scan_statuses()
            .await?
            .into_iter()
            .filter(|(_, record)| record.is_owned_by(worker_id))
            .map(|(id, _)| id)
            .collect();

        if owned.is_empty() {
            info!("Worker {} held no tasks", worker_id);
            return Ok(report);
        }

        for task_id in owned {
            match self.requeue(&task_id, worker_id).await {
                Ok(Some(payload)) => {
                    log_task_requeued!(task_id, payload.task_type, worker_id);
                    report.requeued.push(task_id);
                }
                Ok(None) => report.skipped.push(task_id),
                Err(e) => {
                    error!("Failed to requeue task {}: {}", task_id, e);
                    self.park(&task_id, worker_id, &e).await;
                    report.failed.push((task_id, e));
                }
            }
        }

        info!(
            "Worker {}: {} requeued, {} skipped, {} failed",
            worker_id,
            report.requeued.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Returns the payload that was resubmitted, or `None` if the task
    /// changed hands since the scan
    async fn requeue(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
    ) -> Result<Option<TaskPayload>, ReprocessError> {
        let current = self.store().status(task_id).await?;
        match current.record() {
            Some(record) if record.is_owned_by(worker_id) => {
                record.status.check_transition(TaskStatus::Queued)?
            }
            _ => return Ok(None),
        }

        let payload = self
            .store()
            .payload(task_id)
            .await?
            .ok_or_else(|| ReprocessError::MissingPayload(task_id.clone()))?;

        self.dispatcher.resubmit(task_id, payload.clone()).await?;
        Ok(Some(payload))
    }

    /// Leave a task where the next attempt will find it, or fail it for good
    async fn park(&self, task_id: &TaskId, worker_id: &WorkerId, cause: &ReprocessError) {
        let record = match cause {
            ReprocessError::MissingPayload(_) => {
                StatusRecord::failed(format!("Cannot reprocess task {}: {}", task_id, cause))
            }
            _ => StatusRecord::processing(worker_id.clone()),
        };

        if let Err(e) = self.store().put_status(task_id, &record).await {
            warn!("Could not restore task {} after failed requeue: {}", task_id, e);
        }
    }
}
