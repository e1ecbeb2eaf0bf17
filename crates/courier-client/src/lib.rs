//! Courier Client - Task submission and observation
//!
//! - [`Dispatcher`]: submits tasks and reads their status
//! - [`StatusWatcher`]: polls a task until it reaches a terminal status
//! - [`HeartbeatListener`]: follows worker heartbeats as they arrive

pub mod dispatcher;
pub mod heartbeats;
pub mod watcher;

pub use dispatcher::{DispatchError, Dispatcher};
pub use heartbeats::HeartbeatListener;
pub use watcher::{StatusWatcher, WatchError};
