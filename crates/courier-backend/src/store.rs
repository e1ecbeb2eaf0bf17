//! Task key layout on top of a [`Backend`]

use crate::traits::{Backend, BackendResult};
use courier_core::{StatusRecord, TaskId, TaskPayload, TaskStatus, TaskView};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Key prefix for status records
pub const RESULT_PREFIX: &str = "task_result:";

/// Key prefix for original payloads
pub const DATA_PREFIX: &str = "task_data:";

/// Status counts over every record in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub queued: u64,
    pub processing: u64,
    pub success: u64,
    pub failed: u64,
}

impl StoreStats {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.success + self.failed
    }
}

/// Status records and payloads for tasks.
///
/// This is the single source of truth for task status. It takes no locks;
/// every write replaces the previous value.
#[derive(Clone)]
pub struct ResultStore<B: Backend> {
    backend: B,
}

impl<B: Backend> ResultStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Underlying key-value backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn result_key(task_id: &TaskId) -> String {
        format!("{}{}", RESULT_PREFIX, task_id)
    }

    fn data_key(task_id: &TaskId) -> String {
        format!("{}{}", DATA_PREFIX, task_id)
    }

    /// Replace the status record of a task
    pub async fn put_status(&self, task_id: &TaskId, record: &StatusRecord) -> BackendResult<()> {
        let value = serde_json::to_string(record)?;
        self.backend.set(&Self::result_key(task_id), &value).await?;
        debug!("Task {} is now {}", task_id, record.status);
        Ok(())
    }

    /// Current status of a task; `Unknown` if nothing was ever written
    pub async fn status(&self, task_id: &TaskId) -> BackendResult<TaskView> {
        match self.backend.get(&Self::result_key(task_id)).await? {
            Some(raw) => Ok(TaskView::Known(serde_json::from_str(&raw)?)),
            None => Ok(TaskView::Unknown),
        }
    }

    /// Store the original submission of a task
    pub async fn put_payload(&self, task_id: &TaskId, payload: &TaskPayload) -> BackendResult<()> {
        let value = serde_json::to_string(payload)?;
        self.backend.set(&Self::data_key(task_id), &value).await
    }

    /// Decode the original submission of a task
    pub async fn payload(&self, task_id: &TaskId) -> BackendResult<Option<TaskPayload>> {
        match self.backend.get(&Self::data_key(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every status record in the store.
    ///
    /// Records that vanish or fail to decode between the scan and the read
    /// are skipped.
    pub async fn scan_statuses(&self) -> BackendResult<Vec<(TaskId, StatusRecord)>> {
        let keys = self.backend.scan_prefix(RESULT_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            let Some(id) = key.strip_prefix(RESULT_PREFIX) else {
                continue;
            };
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<StatusRecord>(&raw) {
                Ok(record) => records.push((TaskId::from_string(id), record)),
                Err(e) => warn!("Skipping undecodable record {}: {}", key, e),
            }
        }

        Ok(records)
    }

    /// Remove both records of a task
    pub async fn forget(&self, task_id: &TaskId) -> BackendResult<()> {
        self.backend.delete(&Self::result_key(task_id)).await?;
        self.backend.delete(&Self::data_key(task_id)).await?;
        Ok(())
    }

    /// Count records per status
    pub async fn stats(&self) -> BackendResult<StoreStats> {
        let mut stats = StoreStats::default();
        for (_, record) in self.scan_statuses().await? {
            match record.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Success => stats.success += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use courier_core::WorkerId;
    use serde_json::json;

    fn store() -> ResultStore<MemoryBackend> {
        ResultStore::new(MemoryBackend::new())
    }

    #[tokio::test]
    async fn test_unknown_until_written() {
        let store = store();
        let id = TaskId::new();
        assert_eq!(store.status(&id).await.unwrap(), TaskView::Unknown);

        store.put_status(&id, &StatusRecord::queued()).await.unwrap();
        assert_eq!(
            store.status(&id).await.unwrap(),
            TaskView::Known(StatusRecord::queued())
        );
    }

    #[tokio::test]
    async fn test_wire_layout() {
        let store = store();
        let id = TaskId::from_string("abc");
        store
            .put_status(&id, &StatusRecord::success(json!(5)))
            .await
            .unwrap();
        store
            .put_payload(&id, &TaskPayload::new("add", json!({"x": 2, "y": 3})))
            .await
            .unwrap();

        let raw = store.backend().get("task_result:abc").await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, json!({"status": "success", "result": 5}));

        let raw = store.backend().get("task_data:abc").await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, json!({"type": "add", "data": {"x": 2, "y": 3}}));
    }

    #[tokio::test]
    async fn test_payload_is_decoded() {
        let store = store();
        let id = TaskId::new();
        assert_eq!(store.payload(&id).await.unwrap(), None);

        let payload = TaskPayload::new("echo", json!({"msg": "hi"}));
        store.put_payload(&id, &payload).await.unwrap();
        assert_eq!(store.payload(&id).await.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_scan_skips_garbage() {
        let store = store();
        let worker = WorkerId::new();
        let a = TaskId::new();
        store
            .put_status(&a, &StatusRecord::processing(worker.clone()))
            .await
            .unwrap();
        store
            .backend()
            .set("task_result:broken", "not json")
            .await
            .unwrap();

        let records = store.scan_statuses().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, a);
        assert!(records[0].1.is_owned_by(&worker));
    }

    #[tokio::test]
    async fn test_forget_and_stats() {
        let store = store();
        let a = TaskId::new();
        let b = TaskId::new();
        store.put_status(&a, &StatusRecord::queued()).await.unwrap();
        store.put_payload(&a, &TaskPayload::new("echo", json!(1))).await.unwrap();
        store.put_status(&b, &StatusRecord::failed("boom")).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 2);

        store.forget(&a).await.unwrap();
        assert_eq!(store.status(&a).await.unwrap(), TaskView::Unknown);
        assert_eq!(store.payload(&a).await.unwrap(), None);
        assert_eq!(store.stats().await.unwrap().total(), 1);
    }
}
