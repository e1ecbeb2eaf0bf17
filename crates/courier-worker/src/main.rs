//! Courier Worker - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use courier_backend::{RedisBackend, RedisBackendConfig};
use courier_broker::{RedisBroker, RedisBrokerConfig};
use courier_core::CourierConfig;
use courier_telemetry::{init_logging, LogFormat, LoggingConfig};
use courier_worker::{TaskRegistry, Worker};
use std::sync::Arc;
use tracing::{info, warn};

/// Courier Worker - consumes and executes tasks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<String>,

    /// Worker ID prefix; a fresh suffix is appended on every start
    #[arg(long, env = "COURIER_WORKER_ID")]
    worker_id: Option<String>,

    /// Consumer group shared by cooperating workers
    #[arg(short, long, env = "COURIER_WORKER_GROUP")]
    group: Option<String>,

    /// Broker URL
    #[arg(long, env = "COURIER_BROKER_URL")]
    broker_url: Option<String>,

    /// Backend URL
    #[arg(long, env = "COURIER_BACKEND_URL")]
    backend_url: Option<String>,

    /// Seconds between heartbeats
    #[arg(long, env = "COURIER_HEARTBEAT_INTERVAL")]
    heartbeat_interval: Option<u64>,

    /// Log level
    #[arg(long, env = "COURIER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, json, compact)
    #[arg(long, env = "COURIER_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = CourierConfig::load(args.config.as_ref())?;

    // Override with CLI args
    if let Some(broker_url) = args.broker_url {
        config.broker.url = broker_url;
    }
    if let Some(backend_url) = args.backend_url {
        config.backend.url = Some(backend_url);
    }
    if let Some(worker_id) = args.worker_id {
        config.worker.id = Some(worker_id);
    }
    if let Some(group) = args.group {
        config.worker.group = group;
    }
    if let Some(interval) = args.heartbeat_interval {
        config.worker.heartbeat_interval = interval;
    }

    let mut logging = LoggingConfig::try_from(&config.logging)?;
    if let Some(level) = args.log_level {
        logging.level = level;
    }
    if let Some(format) = args.log_format {
        logging.format = format;
    }
    init_logging(logging)?;

    info!("Starting Courier Worker v{}", env!("CARGO_PKG_VERSION"));
    info!("Broker: {}", config.broker.url);
    info!("Backend: {}", config.backend_url());

    let broker = RedisBroker::with_config(RedisBrokerConfig::from(&config.broker))
    .await
    .context("connecting to broker")?;
    let backend = RedisBackend::with_config(RedisBackendConfig {
        url: config.backend_url().to_string(),
        pool_size: config.backend.pool_size,
    })
    .await
    .context("connecting to backend")?;

    let registry = Arc::new(TaskRegistry::with_builtins());
    info!("Registered task handlers: {:?}", registry.task_types().await);

    let worker = Arc::new(Worker::new(&config, broker, backend, registry));
    info!("Courier Worker {} ready", worker.worker_id());

    let mut running = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    tokio::select! {
        joined = &mut running => {
            joined??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }
    info!("Received shutdown signal");
    worker.shutdown();

    let shutdown_timeout = config.worker.shutdown_timeout();
    match tokio::time::timeout(shutdown_timeout, running).await {
        Ok(joined) => joined??,
        Err(_) => warn!(
            "Task in hand did not finish within {:?}, exiting anyway",
            shutdown_timeout
        ),
    }

    Ok(())
}
