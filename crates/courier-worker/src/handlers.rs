//! Built-in task handlers for demos and testing

use crate::executor::TaskHandler;
use async_trait::async_trait;
use courier_core::{Outcome, TaskMessage};
use serde_json::{json, Value};
use std::time::Duration;

/// Returns the task data unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, task: &TaskMessage) -> Outcome {
        Outcome::Success(task.data.clone())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Adds the numeric fields `a` and `b`
pub struct AddHandler;

#[async_trait]
impl TaskHandler for AddHandler {
    async fn execute(&self, task: &TaskMessage) -> Outcome {
        let a = task.data.get("a");
        let b = task.data.get("b");

        let sum = match (a.and_then(Value::as_i64), b.and_then(Value::as_i64)) {
            (Some(a), Some(b)) => match a.checked_add(b) {
                Some(sum) => json!(sum),
                None => return Outcome::Failure("integer overflow".to_string()),
            },
            _ => match (a.and_then(Value::as_f64), b.and_then(Value::as_f64)) {
                (Some(a), Some(b)) => json!(a + b),
                _ => {
                    return Outcome::Failure("add expects numeric fields 'a' and 'b'".to_string())
                }
            },
        };

        Outcome::Success(json!({ "result": sum }))
    }

    fn name(&self) -> &str {
        "add"
    }
}

/// Sleeps for `seconds` (a number or `{"seconds": n}`, default 1)
pub struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, task: &TaskMessage) -> Outcome {
        let seconds = task
            .data
            .get("seconds")
            .unwrap_or(&task.data)
            .as_u64()
            .unwrap_or(1);

        tokio::time::sleep(Duration::from_secs(seconds)).await;

        Outcome::Success(json!({ "slept_for": seconds }))
    }

    fn name(&self) -> &str {
        "sleep"
    }
}

/// Always fails, with `error` (a string or `{"error": msg}`) as detail
pub struct FailHandler;

#[async_trait]
impl TaskHandler for FailHandler {
    async fn execute(&self, task: &TaskMessage) -> Outcome {
        let message = task
            .data
            .get("error")
            .unwrap_or(&task.data)
            .as_str()
            .unwrap_or("Intentional failure");

        Outcome::Failure(message.to_string())
    }

    fn name(&self) -> &str {
        "fail"
    }
}
