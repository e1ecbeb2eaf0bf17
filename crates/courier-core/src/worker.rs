//! Worker identity and heartbeat schema

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a worker process, fresh on every start
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Generate a new worker ID (`worker_<uuid>`)
    pub fn new() -> Self {
        Self::with_prefix("worker")
    }

    /// Generate a new worker ID (`<prefix>_<uuid>`)
    pub fn with_prefix(prefix: &str) -> Self {
        Self(format!("{}_{}", prefix, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a worker is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Active,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Active => write!(f, "active"),
        }
    }
}

/// Liveness snapshot published on the heartbeat topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub task_count: u64,
    /// Wall-clock time at the sender, float Unix seconds
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_id_format() {
        let id = WorkerId::new();
        assert!(id.as_str().starts_with("worker_"));
        assert_ne!(id, WorkerId::new());
    }

    #[test]
    fn test_heartbeat_schema() {
        let heartbeat = Heartbeat {
            worker_id: WorkerId::from("worker_a"),
            status: WorkerStatus::Active,
            task_count: 7,
            timestamp: 1700000000.5,
        };

        assert_eq!(
            serde_json::to_value(&heartbeat).unwrap(),
            json!({
                "worker_id": "worker_a",
                "status": "active",
                "task_count": 7,
                "timestamp": 1700000000.5
            })
        );
    }
}
