//! Courier Core - Core types for the Courier distributed task queue
//!
//! This crate provides the fundamental building blocks shared by every
//! Courier process:
//! - Task identifiers, status records and the task state machine
//! - Wire schemas for the task and heartbeat topics
//! - An injectable clock
//! - Configuration structures
//! - Error types

pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod task;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BrokerConfig, CourierConfig, MonitorConfig, WatchConfig, WorkerConfig};
pub use error::{Error, Result};
pub use message::{decode, encode, Delivery};
pub use task::{Outcome, StatusRecord, TaskId, TaskMessage, TaskPayload, TaskStatus, TaskView};
pub use worker::{Heartbeat, WorkerId, WorkerStatus};
