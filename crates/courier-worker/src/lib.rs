//! Courier Worker - Task execution engine
//!
//! This crate provides the worker process for Courier:
//! - Task consumption from the task topic
//! - Per-task status transitions and offset commits
//! - Heartbeat reporting
//! - Graceful shutdown handling

pub mod executor;
pub mod handlers;
pub mod heartbeat;
pub mod state;
pub mod worker;

pub use executor::{ExecutionFault, Processed, TaskExecutor, TaskHandler, TaskRegistry};
pub use heartbeat::HeartbeatEmitter;
pub use state::WorkerState;
pub use worker::Worker;
