//! Task definitions and the task state machine

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::worker::WorkerId;

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new random task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a task ID from an existing string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Current status of a task
///
/// ```text
/// queued -> processing -> success
///              |      \-> failed
///              \-> queued          (reprocessing only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting on the task topic
    Queued,
    /// Owned by a worker
    Processing,
    /// Handler returned a result
    Success,
    /// Handler reported an error, or processing faulted
    Failed,
}

impl TaskStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Terminal states have no outgoing edges. `queued -> queued` is allowed
    /// so re-dispatching a record that is already queued is harmless.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Queued)
                | (Queued, Processing)
                | (Processing, Success)
                | (Processing, Failed)
                | (Processing, Queued)
        )
    }

    /// Return an error unless `self -> next` is a legal edge
    pub fn check_transition(&self, next: TaskStatus) -> crate::Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(crate::Error::InvalidTransition { from: *self, to: next })
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The original submission, kept verbatim so it can be resubmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Handler selector
    #[serde(rename = "type")]
    pub task_type: String,

    /// Opaque handler input
    pub data: Value,
}

impl TaskPayload {
    pub fn new(task_type: impl Into<String>, data: Value) -> Self {
        Self {
            task_type: task_type.into(),
            data,
        }
    }
}

/// Message published on the task topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task ID
    pub task_id: TaskId,

    /// Handler selector
    #[serde(rename = "type")]
    pub task_type: String,

    /// Opaque handler input
    pub data: Value,

    /// Always `queued` at publish time
    pub status: TaskStatus,
}

impl TaskMessage {
    /// Build the wire message for a task
    pub fn new(task_id: TaskId, payload: TaskPayload) -> Self {
        Self {
            task_id,
            task_type: payload.task_type,
            data: payload.data,
            status: TaskStatus::Queued,
        }
    }

    /// The type and data carried by this message
    pub fn payload(&self) -> TaskPayload {
        TaskPayload::new(self.task_type.clone(), self.data.clone())
    }
}

/// Status record stored under `task_result:<task_id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Current status
    pub status: TaskStatus,

    /// Owning worker, only meaningful while processing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    /// Handler result (success only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error detail (failed only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusRecord {
    /// A freshly dispatched (or requeued) task
    pub fn queued() -> Self {
        Self {
            status: TaskStatus::Queued,
            worker_id: None,
            result: None,
            error: None,
        }
    }

    /// Ownership marker written by a worker before running the handler
    pub fn processing(worker_id: WorkerId) -> Self {
        Self {
            status: TaskStatus::Processing,
            worker_id: Some(worker_id),
            result: None,
            error: None,
        }
    }

    /// Terminal success
    pub fn success(result: Value) -> Self {
        Self {
            status: TaskStatus::Success,
            worker_id: None,
            result: Some(result),
            error: None,
        }
    }

    /// Terminal failure
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            worker_id: None,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Whether this record is `processing` under `worker_id`
    pub fn is_owned_by(&self, worker_id: &WorkerId) -> bool {
        self.status == TaskStatus::Processing && self.worker_id.as_ref() == Some(worker_id)
    }
}

impl From<Outcome> for StatusRecord {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(value) => StatusRecord::success(value),
            Outcome::Failure(error) => StatusRecord::failed(error),
        }
    }
}

/// Result of a status lookup
#[derive(Debug, Clone, PartialEq)]
pub enum TaskView {
    /// No record exists for the task
    Unknown,
    /// The stored record
    Known(StatusRecord),
}

impl TaskView {
    /// Status name as shown to users (`unknown` when absent)
    pub fn status_name(&self) -> String {
        match self {
            TaskView::Unknown => "unknown".to_string(),
            TaskView::Known(record) => record.status.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskView::Known(record) if record.status.is_terminal())
    }

    pub fn record(&self) -> Option<&StatusRecord> {
        match self {
            TaskView::Unknown => None,
            TaskView::Known(record) => Some(record),
        }
    }

    /// JSON rendering, `{"status":"unknown"}` for absent records
    pub fn to_json(&self) -> Value {
        match self {
            TaskView::Unknown => serde_json::json!({ "status": "unknown" }),
            TaskView::Known(record) => {
                serde_json::to_value(record).unwrap_or_else(|_| serde_json::json!({}))
            }
        }
    }
}

/// Tagged result of a handler invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler produced a value
    Success(Value),
    /// The handler reported an error
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;

        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Success));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Success));
        assert!(!Success.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Success.can_transition_to(Failed));

        assert!(Success.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Processing.is_terminal());
    }

    #[test]
    fn test_check_transition_error() {
        let err = TaskStatus::Success
            .check_transition(TaskStatus::Processing)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid task transition: success -> processing");
    }

    #[test]
    fn test_task_message_schema() {
        let id = TaskId::from("abc");
        let message = TaskMessage::new(id, TaskPayload::new("add", json!({"a": 1, "b": 2})));

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"task_id": "abc", "type": "add", "data": {"a": 1, "b": 2}, "status": "queued"})
        );
    }

    #[test]
    fn test_status_record_omits_empty_fields() {
        let queued = serde_json::to_value(StatusRecord::queued()).unwrap();
        assert_eq!(queued, json!({"status": "queued"}));

        let done = serde_json::to_value(StatusRecord::success(json!({"result": 3}))).unwrap();
        assert_eq!(done, json!({"status": "success", "result": {"result": 3}}));

        let worker = WorkerId::from("worker_1");
        let processing = StatusRecord::processing(worker.clone());
        assert!(processing.is_owned_by(&worker));
        assert!(!processing.is_owned_by(&WorkerId::from("worker_2")));
    }

    #[test]
    fn test_outcome_into_record() {
        let record: StatusRecord = Outcome::Failure("boom".into()).into();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_unknown_view() {
        let view = TaskView::Unknown;
        assert_eq!(view.status_name(), "unknown");
        assert!(!view.is_terminal());
        assert_eq!(view.to_json(), json!({"status": "unknown"}));
    }
}
