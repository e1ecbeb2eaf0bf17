//! Worker runtime

use crate::executor::{Processed, TaskExecutor, TaskRegistry};
use crate::heartbeat::HeartbeatEmitter;
use crate::state::WorkerState;
use courier_backend::{Backend, ResultStore};
use courier_broker::{Broker, BrokerResult, Consumer, ConsumerConfig, StartFrom};
use courier_core::{Clock, CourierConfig, SystemClock, WorkerId};
use courier_telemetry::WorkerLogContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// One worker process: a task consumer plus its heartbeat emitter
pub struct Worker<B: Broker, S: Backend> {
    /// Worker ID
    worker_id: WorkerId,

    /// Broker
    broker: B,

    /// Consumer settings for the task topic
    consumer_config: ConsumerConfig,

    /// Heartbeat topic and interval
    heartbeat_topic: String,
    heartbeat_interval: Duration,

    /// Executor
    executor: TaskExecutor<S>,

    /// Shared status for the heartbeat emitter
    state: Arc<WorkerState>,

    /// Heartbeat timestamp source
    clock: Arc<dyn Clock>,

    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
}

/// Aborts the wrapped task when dropped, so heartbeats stop with the worker
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<B: Broker, S: Backend> Worker<B, S> {
    /// Create a worker from configuration
    pub fn new(config: &CourierConfig, broker: B, backend: S, registry: Arc<TaskRegistry>) -> Self {
        let worker_id = config.worker.get_id();
        let state = Arc::new(WorkerState::new());

        let consumer_config = ConsumerConfig::new(&config.broker.task_topic, &config.worker.group)
            .consumer_name(worker_id.as_str())
            .start(StartFrom::Earliest)
            .block_timeout(config.broker.block_timeout())
            .visibility_timeout(config.claim_timeout());

        let executor = TaskExecutor::new(
            worker_id.clone(),
            registry,
            ResultStore::new(backend),
            Arc::clone(&state),
        )
        .with_time_limit(config.worker.task_time_limit());

        Self {
            worker_id,
            broker,
            consumer_config,
            heartbeat_topic: config.broker.heartbeat_topic.clone(),
            heartbeat_interval: config.worker.heartbeat_interval(),
            executor,
            state,
            clock: Arc::new(SystemClock),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use another time source for heartbeat timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Shared worker status
    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Signal shutdown; the loop stops after the task in hand
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Handle for requesting shutdown from another task
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Consume and execute tasks until shutdown is requested
    pub async fn run(&self) -> BrokerResult<()> {
        let span = WorkerLogContext::new(self.worker_id.as_str(), &self.consumer_config.group).span();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> BrokerResult<()> {
        let mut consumer = self.broker.subscribe(self.consumer_config.clone()).await?;
        info!(
            "Worker {} consuming {} in group {}",
            self.worker_id, self.consumer_config.topic, self.consumer_config.group
        );

        let emitter = HeartbeatEmitter::new(
            self.broker.clone(),
            &self.heartbeat_topic,
            self.worker_id.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.clock),
        )
        .with_interval(self.heartbeat_interval);
        let _heartbeats = AbortOnDrop(tokio::spawn(emitter.run()));

        while !self.is_shutdown() {
            let delivery = match consumer.next().await {
                Some(Ok(d)) => d,
                Some(Err(e)) => {
                    warn!("Error receiving message: {}", e);
                    tokio::time::sleep(self.consumer_config.block_timeout).await;
                    continue;
                }
                // Timeout, continue
                None => continue,
            };

            match self.executor.process(&delivery, &consumer).await {
                Processed::Completed { task_id, outcome } => {
                    debug!("Task {} done (success: {})", task_id, outcome.is_success());
                }
                Processed::Skipped { task_id, status } => {
                    debug!("Task {} skipped, already {}", task_id, status);
                }
                Processed::Superseded { task_id, status } => {
                    debug!("Task {} superseded by an earlier {}", task_id, status);
                }
                Processed::Faulted { task_id, fault } => {
                    warn!(
                        "Message {} (task {:?}) not completed: {}",
                        delivery.delivery_tag, task_id, fault
                    );
                }
            }
        }

        info!(
            "Worker {} stopped. Processed: {}",
            self.worker_id,
            self.state.task_count()
        );
        Ok(())
    }
}
