//! Courier Telemetry - Observability layer
//!
//! Structured logging for every Courier process. Library crates only emit
//! `tracing` events; binaries call [`init_logging`] once at startup.

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig, TaskLogContext, WorkerLogContext};

use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
