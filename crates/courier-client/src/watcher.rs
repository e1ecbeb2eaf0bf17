//! Status watching

use courier_backend::{Backend, ResultStore};
use courier_core::{StatusRecord, TaskId, TaskView, WatchConfig};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why a watch ended without observing a terminal status.
///
/// Neither variant says anything about the task itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WatchError {
    /// Too many consecutive status lookups failed
    #[error("failed to monitor task {task_id} after {attempts} attempts: {last_error}")]
    MonitoringFailed {
        task_id: TaskId,
        attempts: u32,
        last_error: String,
    },

    /// The task was still running when the deadline passed
    #[error("task {task_id} did not finish within {waited:?}")]
    DeadlineExceeded { task_id: TaskId, waited: Duration },
}

/// Polls the store until a task is `success` or `failed`
#[derive(Clone)]
pub struct StatusWatcher<S: Backend> {
    store: ResultStore<S>,
    config: WatchConfig,
}

impl<S: Backend> StatusWatcher<S> {
    pub fn new(store: ResultStore<S>, config: WatchConfig) -> Self {
        Self { store, config }
    }

    /// Wait for the terminal record of a task
    pub async fn watch(&self, task_id: &TaskId) -> Result<StatusRecord, WatchError> {
        self.watch_with(task_id, |_, _| {}).await
    }

    /// Wait for the terminal record of a task, calling `on_update` with every
    /// successful observation (including `Unknown`).
    ///
    /// A failed lookup waits the backoff on top of the poll interval. Any
    /// successful lookup resets the failure count. A `retries` of 0 is
    /// treated as 1 (loaded configuration rejects it).
    pub async fn watch_with<F>(
        &self,
        task_id: &TaskId,
        mut on_update: F,
    ) -> Result<StatusRecord, WatchError>
    where
        F: FnMut(&TaskId, &TaskView),
    {
        let started = Instant::now();
        let retries = self.config.retries.max(1);
        let mut failures = 0u32;

        loop {
            if let Some(deadline) = self.config.deadline() {
                let waited = started.elapsed();
                if waited >= deadline {
                    return Err(WatchError::DeadlineExceeded {
                        task_id: task_id.clone(),
                        waited,
                    });
                }
            }

            match self.store.status(task_id).await {
                Ok(view) => {
                    failures = 0;
                    on_update(task_id, &view);
                    if let TaskView::Known(record) = view {
                        if record.status.is_terminal() {
                            debug!("Task {} finished as {}", task_id, record.status);
                            return Ok(record);
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Status lookup for task {} failed ({}/{}): {}",
                        task_id, failures, retries, e
                    );
                    if failures >= retries {
                        return Err(WatchError::MonitoringFailed {
                            task_id: task_id.clone(),
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(self.config.backoff()).await;
                }
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_backend::MemoryBackend;
    use serde_json::json;

    fn watcher(backend: &MemoryBackend, deadline: Option<u64>) -> StatusWatcher<MemoryBackend> {
        let config = WatchConfig {
            deadline,
            ..Default::default()
        };
        StatusWatcher::new(ResultStore::new(backend.clone()), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_terminal_record() {
        let backend = MemoryBackend::new();
        let store = ResultStore::new(backend.clone());
        let id = TaskId::new();
        store.put_status(&id, &StatusRecord::queued()).await.unwrap();

        let finisher = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                store
                    .put_status(&id, &StatusRecord::success(json!({"result": 3})))
                    .await
                    .unwrap();
            })
        };

        let mut seen = Vec::new();
        let record = watcher(&backend, None)
            .watch_with(&id, |_, view| seen.push(view.status_name()))
            .await
            .unwrap();
        finisher.await.unwrap();

        assert_eq!(record, StatusRecord::success(json!({"result": 3})));
        assert_eq!(seen.first().map(String::as_str), Some("queued"));
        assert_eq!(seen.last().map(String::as_str), Some("success"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_configured_retries() {
        let backend = MemoryBackend::new();
        backend.fail_reads(true);

        let err = watcher(&backend, None).watch(&TaskId::new()).await.unwrap_err();
        match err {
            WatchError::MonitoringFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(backend.read_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_still_makes_one_attempt() {
        let backend = MemoryBackend::new();
        backend.fail_reads(true);
        let config = WatchConfig {
            retries: 0,
            ..Default::default()
        };

        let watcher = StatusWatcher::new(ResultStore::new(backend.clone()), config);
        let err = watcher.watch(&TaskId::new()).await.unwrap_err();
        assert!(matches!(err, WatchError::MonitoringFailed { attempts: 1, .. }));
        assert_eq!(backend.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transient_failures() {
        let backend = MemoryBackend::new();
        let store = ResultStore::new(backend.clone());
        let id = TaskId::new();
        store.put_status(&id, &StatusRecord::success(json!(1))).await.unwrap();
        backend.fail_reads(true);

        let healer = {
            let backend = backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                backend.fail_reads(false);
            })
        };

        // lookups at 0s and 4s fail, the one at 8s succeeds
        let record = watcher(&backend, None).watch(&id).await.unwrap();
        healer.await.unwrap();

        assert_eq!(record.status, courier_core::TaskStatus::Success);
        assert_eq!(backend.read_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let backend = MemoryBackend::new();
        let store = ResultStore::new(backend.clone());
        let id = TaskId::new();
        store.put_status(&id, &StatusRecord::queued()).await.unwrap();

        let err = watcher(&backend, Some(10)).watch(&id).await.unwrap_err();
        assert!(matches!(err, WatchError::DeadlineExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_is_not_a_failure() {
        let backend = MemoryBackend::new();
        let err = watcher(&backend, Some(10))
            .watch(&TaskId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::DeadlineExceeded { .. }));
    }
}
