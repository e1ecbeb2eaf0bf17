//! Configuration structures for Courier

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::worker::WorkerId;

/// Slack between the handler time limit and the moment an unacknowledged
/// delivery may be claimed by another consumer
const CLAIM_MARGIN: Duration = Duration::from_secs(30);

/// Main configuration for Courier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Transport configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Result store configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Failure detector configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Status watcher configuration
    #[serde(default)]
    pub watch: WatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CourierConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::Error::Configuration(format!("Failed to read config file: {}", e))
        })?;

        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, then let environment variables win
    pub fn load(path: Option<impl AsRef<Path>>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the system misbehave at runtime
    pub fn validate(&self) -> crate::Result<()> {
        if self.broker.visibility_timeout <= self.worker.task_time_limit {
            return Err(crate::Error::Configuration(format!(
                "broker.visibility_timeout ({}s) must exceed worker.task_time_limit ({}s), \
                 or running tasks are handed to a second worker",
                self.broker.visibility_timeout, self.worker.task_time_limit
            )));
        }
        if self.watch.retries == 0 {
            return Err(crate::Error::Configuration(
                "watch.retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Idle time after which an unacknowledged task delivery may be claimed
    /// by another worker. Never shorter than the handler time limit plus a
    /// margin, whatever the transport setting says.
    pub fn claim_timeout(&self) -> Duration {
        self.broker
            .visibility_timeout()
            .max(self.worker.task_time_limit() + CLAIM_MARGIN)
    }

    /// Override fields from `COURIER_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(url) = std::env::var("COURIER_BROKER_URL") {
            self.broker.url = url;
        }
        if let Ok(topic) = std::env::var("COURIER_TASK_TOPIC") {
            self.broker.task_topic = topic;
        }
        if let Ok(topic) = std::env::var("COURIER_HEARTBEAT_TOPIC") {
            self.broker.heartbeat_topic = topic;
        }
        if let Ok(url) = std::env::var("COURIER_BACKEND_URL") {
            self.backend.url = Some(url);
        }
        if let Ok(id) = std::env::var("COURIER_WORKER_ID") {
            self.worker.id = Some(id);
        }
        if let Ok(group) = std::env::var("COURIER_WORKER_GROUP") {
            self.worker.group = group;
        }
        if let Some(secs) = env_u64("COURIER_HEARTBEAT_INTERVAL")? {
            self.worker.heartbeat_interval = secs;
        }
        if let Some(secs) = env_u64("COURIER_HEARTBEAT_TIMEOUT")? {
            self.monitor.heartbeat_timeout = secs;
        }
        if let Ok(level) = std::env::var("COURIER_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// URL of the store, falling back to the broker URL
    pub fn backend_url(&self) -> &str {
        self.backend.url.as_deref().unwrap_or(&self.broker.url)
    }
}

fn env_u64(name: &str) -> crate::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| crate::Error::Configuration(format!("{} must be an integer, got {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Topic carrying task submissions
    #[serde(default = "default_task_topic")]
    pub task_topic: String,

    /// Topic carrying worker heartbeats
    #[serde(default = "default_heartbeat_topic")]
    pub heartbeat_topic: String,

    /// How long a consumer blocks waiting for a message, in milliseconds
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Seconds before an uncommitted message may be redelivered to another
    /// consumer. Must exceed `worker.task_time_limit`.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: u64,

    /// Approximate number of entries kept on the heartbeat topic
    #[serde(default = "default_heartbeat_max_len")]
    pub heartbeat_max_len: usize,
}

fn default_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_task_topic() -> String {
    "courier:tasks".to_string()
}

fn default_heartbeat_topic() -> String {
    "courier:heartbeats".to_string()
}

fn default_block_timeout_ms() -> u64 {
    1000
}

fn default_visibility_timeout() -> u64 {
    360
}

fn default_heartbeat_max_len() -> usize {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            pool_size: default_pool_size(),
            task_topic: default_task_topic(),
            heartbeat_topic: default_heartbeat_topic(),
            block_timeout_ms: default_block_timeout_ms(),
            visibility_timeout: default_visibility_timeout(),
            heartbeat_max_len: default_heartbeat_max_len(),
        }
    }
}

impl BrokerConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout)
    }
}

/// Result store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Connection URL (uses broker URL if not specified)
    pub url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker ID prefix. Every process appends a fresh suffix, so an ID is
    /// never reused across restarts.
    pub id: Option<String>,

    /// Consumer group shared by the workers that split the task topic
    #[serde(default = "default_worker_group")]
    pub group: String,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Hard limit on a single handler invocation, in seconds
    #[serde(default = "default_task_time_limit")]
    pub task_time_limit: u64,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

fn default_worker_group() -> String {
    "courier-workers".to_string()
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_task_time_limit() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            group: default_worker_group(),
            heartbeat_interval: default_heartbeat_interval(),
            task_time_limit: default_task_time_limit(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    /// A fresh worker ID, under the configured prefix if there is one
    pub fn get_id(&self) -> WorkerId {
        match &self.id {
            Some(prefix) => WorkerId::with_prefix(prefix),
            None => WorkerId::new(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn task_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_time_limit)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

/// Failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds of heartbeat silence before a worker is declared unresponsive
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,

    /// Seconds between liveness sweeps that run even when no heartbeat arrives
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Consumer group used to read the heartbeat topic
    #[serde(default = "default_monitor_group")]
    pub group: String,
}

fn default_heartbeat_timeout() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    1
}

fn default_monitor_group() -> String {
    "courier-monitor".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            sweep_interval: default_sweep_interval(),
            group: default_monitor_group(),
        }
    }
}

impl MonitorConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

/// Status watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Seconds between status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Consecutive failed lookups tolerated before giving up, at least 1
    #[serde(default = "default_watch_retries")]
    pub retries: u32,

    /// Extra seconds to wait after a failed lookup
    #[serde(default = "default_watch_backoff")]
    pub backoff: u64,

    /// Give up after this many seconds even if lookups succeed
    pub deadline: Option<u64>,
}

fn default_poll_interval() -> u64 {
    2
}

fn default_watch_retries() -> u32 {
    3
}

fn default_watch_backoff() -> u64 {
    2
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            retries: default_watch_retries(),
            backoff: default_watch_backoff(),
            deadline: None,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline.map(Duration::from_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json or compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Full `EnvFilter` directive, overrides `level`
    pub env_filter: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            env_filter: None,
        }
    }
}
