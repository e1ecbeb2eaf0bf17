//! Backend trait definitions

use async_trait::async_trait;
use thiserror::Error;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Retrieval error
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Pool error
    #[error("connection pool error: {0}")]
    Pool(String),
}

impl From<courier_core::Error> for BackendError {
    fn from(err: courier_core::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

/// Networked key-value store without transactions or expiry.
///
/// Writes are single-key and last-write-wins.
#[async_trait]
pub trait Backend: Send + Sync + Clone + 'static {
    /// Check if connected
    async fn is_connected(&self) -> bool;

    /// Read a value
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> BackendResult<()>;

    /// Every key starting with `prefix`, in no particular order
    async fn scan_prefix(&self, prefix: &str) -> BackendResult<Vec<String>>;

    /// Remove a key; returns whether it existed
    async fn delete(&self, key: &str) -> BackendResult<bool>;
}
