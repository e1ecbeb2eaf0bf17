//! Courier CLI - submit tasks and follow their progress

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_backend::{RedisBackend, RedisBackendConfig, ResultStore};
use courier_broker::{RedisBroker, RedisBrokerConfig};
use courier_client::{Dispatcher, HeartbeatListener, StatusWatcher};
use courier_core::{CourierConfig, TaskId, TaskView};
use courier_telemetry::{init_logging, LoggingConfig};
use tracing::info;

/// Courier - distributed task queue client
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

    /// Log level
    #[arg(long, default_value = "warn", env = "COURIER_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a task and print its id
    Submit {
        /// Task type, selects the handler
        task_type: String,

        /// Task data as JSON
        #[arg(default_value = "null")]
        data: String,

        /// Wait for the task to finish
        #[arg(short, long)]
        watch: bool,
    },

    /// Print the current status record of a task
    Status { task_id: String },

    /// Poll a task until it succeeds or fails
    Watch {
        task_id: String,

        /// Give up after this many seconds
        #[arg(long)]
        deadline: Option<u64>,
    },

    /// Count status records per status
    Stats,

    /// Print worker heartbeats as they arrive
    Heartbeats,
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

    init_logging(LoggingConfig {
        level: args.log_level,
        ..LoggingConfig::try_from(&config.logging)?
    })?;

    let broker = RedisBroker::with_config(RedisBrokerConfig::from(&config.broker))
    .await
    .context("connecting to broker")?;
    let backend = RedisBackend::with_config(RedisBackendConfig {
        url: config.backend_url().to_string(),
        pool_size: config.backend.pool_size,
    })
    .await
    .context("connecting to backend")?;

    let store = ResultStore::new(backend);
    let dispatcher = Dispatcher::new(broker.clone(), store.clone(), &config.broker.task_topic);

    match args.command {
        Command::Submit {
            task_type,
            data,
            watch,
        } => {
            let data = serde_json::from_str(&data).context("task data must be valid JSON")?;
            let task_id = dispatcher.submit(task_type, data).await?;
            println!("{}", task_id);

            if watch {
                let watcher = StatusWatcher::new(store, config.watch.clone());
                let record = watcher.watch_with(&task_id, print_update).await?;
                info!("Task {} finished as {}", task_id, record.status);
            }
        }
        Command::Status { task_id } => {
            let view = dispatcher.status(&TaskId::from_string(task_id)).await?;
            println!("{}", view.to_json());
        }
        Command::Watch { task_id, deadline } => {
            let mut watch_config = config.watch.clone();
            if deadline.is_some() {
                watch_config.deadline = deadline;
            }
            let watcher = StatusWatcher::new(store, watch_config);
            watcher
                .watch_with(&TaskId::from_string(task_id), print_update)
                .await?;
        }
        Command::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Heartbeats => {
            let mut listener =
                HeartbeatListener::subscribe(&broker, &config.broker.heartbeat_topic).await?;
            let listened = tokio::select! {
                result = listener.listen(|heartbeat| {
                    println!(
                        "{} {} tasks={} at {:.3}",
                        heartbeat.worker_id,
                        heartbeat.status,
                        heartbeat.task_count,
                        heartbeat.timestamp
                    );
                    true
                }) => result,
                _ = tokio::signal::ctrl_c() => Ok(()),
            };
            listener.close().await?;
            listened?;
        }
    }

    Ok(())
}

fn print_update(task_id: &TaskId, view: &TaskView) {
    println!("{} {}", task_id, view.to_json());
}
