//! Courier Monitor - Worker failure detection and recovery
//!
//! A singleton process that follows worker heartbeats, declares workers
//! unresponsive once they fall silent, and hands the tasks they held in
//! `processing` back to the queue.

pub mod detector;
pub mod monitor;
pub mod reprocessor;

pub use detector::FailureDetector;
pub use monitor::Monitor;
pub use reprocessor::{ReprocessError, ReprocessReport, Reprocessor};
