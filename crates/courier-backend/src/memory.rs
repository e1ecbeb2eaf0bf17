//! In-memory backend

use crate::traits::{Backend, BackendError, BackendResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory key-value store shared by clones
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, String>>>,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct Faults {
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read (`get`, `scan_prefix`) fail
    pub fn fail_reads(&self, fail: bool) {
        self.faults.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write (`set`, `delete`) fail
    pub fn fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `get` calls served or refused so far
    pub fn read_count(&self) -> usize {
        self.faults.reads.load(Ordering::SeqCst)
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    fn check_read(&self) -> BackendResult<()> {
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::Retrieval("store unreachable".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> BackendResult<()> {
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Storage("store unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.faults.reads.fetch_add(1, Ordering::SeqCst);
        self.check_read()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.check_write()?;
        self.data
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.check_read()?;
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.check_write()?;
        Ok(self.data.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set("a", "1").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().as_deref(), Some("1"));

        backend.set("a", "2").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().as_deref(), Some("2"));

        assert!(backend.delete("a").await.unwrap());
        assert!(!backend.delete("a").await.unwrap());
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let backend = MemoryBackend::new();
        backend.set("task_result:1", "x").await.unwrap();
        backend.set("task_result:2", "x").await.unwrap();
        backend.set("task_data:1", "x").await.unwrap();
        backend.set("task_resulz", "x").await.unwrap();

        let keys = backend.scan_prefix("task_result:").await.unwrap();
        assert_eq!(keys, vec!["task_result:1", "task_result:2"]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let backend = MemoryBackend::new();
        backend.fail_writes(true);
        assert!(matches!(
            backend.set("k", "v").await,
            Err(BackendError::Storage(_))
        ));

        backend.fail_writes(false);
        backend.set("k", "v").await.unwrap();
        backend.fail_reads(true);
        assert!(matches!(
            backend.get("k").await,
            Err(BackendError::Retrieval(_))
        ));
        assert_eq!(backend.read_count(), 1);
    }
}
