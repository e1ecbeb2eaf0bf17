//! Courier Monitor - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use courier_backend::{RedisBackend, RedisBackendConfig};
use courier_broker::{RedisBroker, RedisBrokerConfig};
use courier_core::CourierConfig;
use courier_monitor::Monitor;
use courier_telemetry::{init_logging, LogFormat, LoggingConfig};
use tracing::info;

/// Courier Monitor - detects dead workers and requeues their tasks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<String>,

    /// Broker URL
    #[arg(long, env = "COURIER_BROKER_URL")]
    broker_url: Option<String>,

    /// Backend URL
    #[arg(long, env = "COURIER_BACKEND_URL")]
    backend_url: Option<String>,

    /// Seconds of silence before a worker is declared dead
    #[arg(long, env = "COURIER_HEARTBEAT_TIMEOUT")]
    heartbeat_timeout: Option<u64>,

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

    if let Some(broker_url) = args.broker_url {
        config.broker.url = broker_url;
    }
    if let Some(backend_url) = args.backend_url {
        config.backend.url = Some(backend_url);
    }
    if let Some(timeout) = args.heartbeat_timeout {
        config.monitor.heartbeat_timeout = timeout;
    }

    let mut logging = LoggingConfig::try_from(&config.logging)?;
    if let Some(level) = args.log_level {
        logging.level = level;
    }
    if let Some(format) = args.log_format {
        logging.format = format;
    }
    init_logging(logging)?;

    info!("Starting Courier Monitor v{}", env!("CARGO_PKG_VERSION"));
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

    let mut monitor = Monitor::new(&config, broker, backend);
    let shutdown = monitor.shutdown_handle();

    let mut running = tokio::spawn(async move { monitor.run().await });

    tokio::select! {
        joined = &mut running => {
            joined??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }
    info!("Received shutdown signal");
    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    running.await??;

    Ok(())
}
