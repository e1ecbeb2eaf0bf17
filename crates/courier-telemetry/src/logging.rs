//! Structured logging for Courier
//!
//! Every binary installs one `tracing` subscriber at startup. Output is
//! pretty, compact or JSON, filtered by level or by a full `EnvFilter`
//! directive. Library code only emits events, usually inside the task and
//! worker spans defined here.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::{TelemetryError, TelemetryResult};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,

    /// Default level directive, e.g. `info`
    pub level: String,

    pub format: LogFormat,

    /// Emit span open/close events
    pub include_spans: bool,

    /// Source file and line on every event
    pub include_location: bool,

    /// Module path on every event
    pub include_target: bool,

    /// Environment filter string (e.g., "courier_worker=debug,redis=warn")
    pub env_filter: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line, colored
    #[default]
    Pretty,
    /// One line per event
    Compact,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(TelemetryError::Config(format!(
                "unknown log format {:?} (expected json, pretty or compact)",
                other
            ))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_spans: false,
            include_location: false,
            include_target: true,
            env_filter: None,
        }
    }
}

impl TryFrom<&courier_core::config::LoggingConfig> for LoggingConfig {
    type Error = TelemetryError;

    fn try_from(config: &courier_core::config::LoggingConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            level: config.level.clone(),
            format: config.format.parse()?,
            env_filter: config.env_filter.clone(),
            ..Default::default()
        })
    }
}

impl LoggingConfig {
    /// Build the event filter; `env_filter` wins over `level`
    pub fn filter(&self) -> TelemetryResult<EnvFilter> {
        let directive = self.env_filter.as_deref().unwrap_or(&self.level);
        EnvFilter::try_new(directive).map_err(|e| TelemetryError::Logging(e.to_string()))
    }
}

type FormatLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer(config: &LoggingConfig) -> FormatLayer {
    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(span_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_target(config.include_target);

    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LoggingConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = config.filter()?;
    tracing_subscriber::registry()
        .with(format_layer(&config))
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing::debug!(level = %config.level, format = ?config.format, "Logging ready");
    Ok(())
}

/// Log context for one task execution
#[derive(Debug, Clone)]
pub struct TaskLogContext {
    pub task_id: String,
    pub task_type: String,
    pub worker_id: Option<String>,
}

impl TaskLogContext {
    pub fn new(task_id: &str, task_type: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            worker_id: None,
        }
    }

    /// Set the executing worker
    pub fn with_worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    /// Span carrying the task fields; `worker_id` is left empty for
    /// client-side spans
    pub fn span(&self) -> tracing::Span {
        let span = tracing::info_span!(
            "task",
            task_id = %self.task_id,
            task_type = %self.task_type,
            worker_id = tracing::field::Empty,
        );
        if let Some(worker_id) = &self.worker_id {
            span.record("worker_id", worker_id.as_str());
        }
        span
    }
}

/// Fields identifying a worker process in its consume loop
#[derive(Debug, Clone)]
pub struct WorkerLogContext {
    pub worker_id: String,
    pub group: String,
}

impl WorkerLogContext {
    pub fn new(worker_id: &str, group: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            group: group.to_string(),
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "worker",
            worker_id = %self.worker_id,
            group = %self.group
        )
    }
}

/// Log task submission
#[macro_export]
macro_rules! log_task_submitted {
    ($task_id:expr, $task_type:expr) => {
        tracing::info!(
            task_id = %$task_id,
            task_type = %$task_type,
            event = "task.submitted",
            "Task submitted"
        )
    };
}

/// Log task started
#[macro_export]
macro_rules! log_task_started {
    ($task_id:expr, $task_type:expr, $worker_id:expr) => {
        tracing::info!(
            task_id = %$task_id,
            task_type = %$task_type,
            worker_id = %$worker_id,
            event = "task.started",
            "Task execution started"
        )
    };
}

/// Log task completed
#[macro_export]
macro_rules! log_task_completed {
    ($task_id:expr, $task_type:expr, $duration_ms:expr) => {
        tracing::info!(
            task_id = %$task_id,
            task_type = %$task_type,
            duration_ms = $duration_ms,
            event = "task.completed",
            "Task completed successfully"
        )
    };
}

/// Log task failed
#[macro_export]
macro_rules! log_task_failed {
    ($task_id:expr, $task_type:expr, $error:expr) => {
        tracing::error!(
            task_id = %$task_id,
            task_type = %$task_type,
            error = %$error,
            event = "task.failed",
            "Task execution failed"
        )
    };
}

/// Log a task handed back to the queue after its worker died
#[macro_export]
macro_rules! log_task_requeued {
    ($task_id:expr, $task_type:expr, $dead_worker:expr) => {
        tracing::warn!(
            task_id = %$task_id,
            task_type = %$task_type,
            dead_worker = %$dead_worker,
            event = "task.requeued",
            "Task requeued"
        )
    };
}
