//! Monitor loop: heartbeats in, reprocessing out

use crate::detector::FailureDetector;
use crate::reprocessor::{ReprocessReport, Reprocessor};
use courier_backend::{Backend, ResultStore};
use courier_broker::{Broker, BrokerResult, Consumer, ConsumerConfig, StartFrom};
use courier_client::Dispatcher;
use courier_core::{Clock, CourierConfig, Heartbeat, SystemClock, WorkerId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Singleton failure detector and reprocessor
pub struct Monitor<B: Broker, S: Backend> {
    broker: B,
    consumer_config: ConsumerConfig,
    detector: FailureDetector,
    reprocessor: Reprocessor<B, S>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    /// Declared workers whose tasks could not all be requeued yet
    pending: BTreeSet<WorkerId>,
    /// Set while the heartbeats being read are older than the timeout
    lagging: bool,
    shutdown: Arc<AtomicBool>,
}

impl<B: Broker, S: Backend> Monitor<B, S> {
    pub fn new(config: &CourierConfig, broker: B, backend: S) -> Self {
        let sweep_interval = config.monitor.sweep_interval().max(Duration::from_millis(100));

        // A group of its own, so a restarted monitor starts at the end of the
        // topic instead of replaying heartbeats sent while it was down.
        // Wake up often enough to sweep on time even when no heartbeat arrives.
        let group = format!("{}-{}", config.monitor.group, Uuid::new_v4());
        let consumer_config = ConsumerConfig::new(&config.broker.heartbeat_topic, group)
            .start(StartFrom::Latest)
            .block_timeout(config.broker.block_timeout().min(sweep_interval));

        let dispatcher = Dispatcher::new(
            broker.clone(),
            ResultStore::new(backend),
            &config.broker.task_topic,
        );

        Self {
            broker,
            consumer_config,
            detector: FailureDetector::new(config.monitor.heartbeat_timeout()),
            reprocessor: Reprocessor::new(dispatcher),
            clock: Arc::new(SystemClock),
            sweep_interval,
            pending: BTreeSet::new(),
            lagging: false,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use another time source for liveness checks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    /// Workers waiting for another reprocessing attempt
    pub fn pending(&self) -> impl Iterator<Item = &WorkerId> {
        self.pending.iter()
    }

    /// Handle for requesting shutdown from another task
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Consumer group this monitor reads heartbeats under
    pub fn group(&self) -> &str {
        &self.consumer_config.group
    }

    /// Feed one heartbeat and run a liveness check.
    ///
    /// A heartbeat that was already older than the timeout when it arrived
    /// means the topic is behind; newer heartbeats may still be queued, so
    /// no one is declared on its account.
    pub async fn on_heartbeat(&mut self, heartbeat: &Heartbeat) -> Vec<WorkerId> {
        if self.detector.observe(heartbeat) {
            debug!(
                "Heartbeat from {}: {} tasks={}",
                heartbeat.worker_id, heartbeat.status, heartbeat.task_count
            );
        }

        let now = self.clock.unix_seconds();
        self.lagging = heartbeat.timestamp < now - self.detector.timeout().as_secs_f64();
        if self.lagging {
            debug!(
                "Heartbeat from {} is {:.1}s old, catching up before checking",
                heartbeat.worker_id,
                now - heartbeat.timestamp
            );
            return Vec::new();
        }
        self.check().await
    }

    /// Declare silent workers and requeue their tasks. Returns the workers
    /// declared by this call.
    pub async fn check(&mut self) -> Vec<WorkerId> {
        let dead = self.detector.sweep(self.clock.unix_seconds());
        for worker_id in &dead {
            warn!("Worker {} is unresponsive. Reprocessing its tasks.", worker_id);
            self.recover(worker_id.clone()).await;
        }
        dead
    }

    /// Retry workers left over from earlier failed attempts
    pub async fn retry_pending(&mut self) {
        let pending: Vec<WorkerId> = self.pending.iter().cloned().collect();
        for worker_id in pending {
            info!("Retrying reprocessing of worker {}", worker_id);
            self.recover(worker_id).await;
        }
    }

    async fn recover(&mut self, worker_id: WorkerId) {
        match self.reprocessor.reprocess(&worker_id).await {
            Ok(report) => self.settle(worker_id, &report),
            Err(e) => {
                error!("Could not scan tasks of worker {}: {}", worker_id, e);
                self.pending.insert(worker_id);
            }
        }
    }

    fn settle(&mut self, worker_id: WorkerId, report: &ReprocessReport) {
        if report.needs_retry() {
            self.pending.insert(worker_id);
        } else {
            self.pending.remove(&worker_id);
        }
    }

    /// Follow the heartbeat topic until shutdown is requested.
    ///
    /// Liveness is checked after every fresh heartbeat and at least once per
    /// sweep interval. Errors are logged and never end the loop. The private
    /// heartbeat group is removed on the way out.
    pub async fn run(&mut self) -> BrokerResult<()> {
        let mut consumer = self.broker.subscribe(self.consumer_config.clone()).await?;
        info!(
            "Monitoring worker heartbeats on {} (timeout {:?})",
            self.consumer_config.topic,
            self.detector.timeout()
        );

        let mut last_sweep = Instant::now();
        // Sweeps wait while catching up, but never longer than one timeout
        let max_deferral = self.detector.timeout();

        while !self.is_shutdown() {
            match consumer.next().await {
                Some(Ok(delivery)) => {
                    if let Err(e) = consumer.commit(&delivery).await {
                        warn!("Failed to commit heartbeat: {}", e);
                    }
                    match delivery.decode::<Heartbeat>() {
                        Ok(heartbeat) => {
                            self.on_heartbeat(&heartbeat).await;
                        }
                        Err(e) => warn!("Ignoring malformed heartbeat: {}", e),
                    }
                }
                Some(Err(e)) => {
                    warn!("Error receiving heartbeat: {}", e);
                    tokio::time::sleep(self.consumer_config.block_timeout).await;
                }
                None => self.lagging = false,
            }

            let due = last_sweep.elapsed() >= self.sweep_interval;
            if due && (!self.lagging || last_sweep.elapsed() >= max_deferral) {
                last_sweep = Instant::now();
                self.check().await;
                self.retry_pending().await;
            }
        }

        drop(consumer);
        if let Err(e) = self
            .broker
            .remove_group(&self.consumer_config.topic, &self.consumer_config.group)
            .await
        {
            warn!("Failed to remove heartbeat group {}: {}", self.consumer_config.group, e);
        }

        info!("Monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_backend::MemoryBackend;
    use courier_broker::MemoryBroker;
    use courier_core::{ManualClock, StatusRecord, TaskId, TaskPayload, TaskView, WorkerStatus};
    use serde_json::json;

    struct Fixture {
        broker: MemoryBroker,
        store: ResultStore<MemoryBackend>,
        clock: Arc<ManualClock>,
        monitor: Monitor<MemoryBroker, MemoryBackend>,
    }

    fn fixture() -> Fixture {
        let config = CourierConfig::default();
        let broker = MemoryBroker::new();
        let backend = MemoryBackend::new();
        let clock = Arc::new(ManualClock::at_unix_seconds(1_000));
        let monitor = Monitor::new(&config, broker.clone(), backend.clone()).with_clock(clock.clone());
        Fixture {
            broker,
            store: ResultStore::new(backend),
            clock,
            monitor,
        }
    }

    fn heartbeat(worker: &WorkerId, timestamp: f64) -> Heartbeat {
        Heartbeat {
            worker_id: worker.clone(),
            status: WorkerStatus::Active,
            task_count: 0,
            timestamp,
        }
    }

    async fn held_task(store: &ResultStore<MemoryBackend>, worker: &WorkerId) -> TaskId {
        let id = TaskId::new();
        store
            .put_payload(&id, &TaskPayload::new("echo", json!({"n": 1})))
            .await
            .unwrap();
        store
            .put_status(&id, &StatusRecord::processing(worker.clone()))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_heartbeat_triggers_check_of_other_workers() {
        let mut f = fixture();
        let quiet = WorkerId::from("worker_quiet");
        let chatty = WorkerId::from("worker_chatty");
        let task = held_task(&f.store, &quiet).await;

        f.monitor.on_heartbeat(&heartbeat(&quiet, 1_000.0)).await;
        f.clock.advance(Duration::from_secs(11));

        let declared = f.monitor.on_heartbeat(&heartbeat(&chatty, 1_011.0)).await;
        assert_eq!(declared, vec![quiet]);
        assert_eq!(f.store.status(&task).await.unwrap(), TaskView::Known(StatusRecord::queued()));
        assert_eq!(f.broker.messages("courier:tasks").len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_catches_last_silent_worker() {
        let mut f = fixture();
        let last = WorkerId::from("worker_last");
        f.monitor.on_heartbeat(&heartbeat(&last, 1_000.0)).await;

        f.clock.advance(Duration::from_secs(5));
        assert!(f.monitor.check().await.is_empty());

        f.clock.advance(Duration::from_secs(6));
        assert_eq!(f.monitor.check().await, vec![last]);
    }

    #[tokio::test]
    async fn test_failed_requeue_is_retried() {
        let mut f = fixture();
        let dead = WorkerId::from("worker_dead");
        let task = held_task(&f.store, &dead).await;
        f.monitor.on_heartbeat(&heartbeat(&dead, 1_000.0)).await;

        f.broker.fail_publishes(true);
        f.clock.advance(Duration::from_secs(11));
        f.monitor.check().await;
        assert_eq!(f.monitor.pending().cloned().collect::<Vec<_>>(), vec![dead.clone()]);

        f.broker.fail_publishes(false);
        f.monitor.retry_pending().await;
        assert_eq!(f.monitor.pending().count(), 0);
        assert_eq!(f.store.status(&task).await.unwrap(), TaskView::Known(StatusRecord::queued()));
    }

    #[tokio::test]
    async fn test_late_heartbeat_does_not_trigger_declaration() {
        let mut f = fixture();
        let worker = WorkerId::from("worker_behind");
        let task = held_task(&f.store, &worker).await;

        // read from a backlog: the newest heartbeat is still queued behind it
        f.clock.advance(Duration::from_secs(60));
        assert!(f.monitor.on_heartbeat(&heartbeat(&worker, 1_000.0)).await.is_empty());
        assert!(f.monitor.on_heartbeat(&heartbeat(&worker, 1_060.0)).await.is_empty());

        assert_eq!(f.monitor.detector().last_seen(&worker), Some(1_060.0));
        assert_eq!(
            f.store.status(&task).await.unwrap(),
            TaskView::Known(StatusRecord::processing(worker))
        );
    }

    #[test]
    fn test_each_monitor_reads_under_its_own_group() {
        let config = CourierConfig::default();
        let broker = MemoryBroker::new();
        let first = Monitor::new(&config, broker.clone(), MemoryBackend::new());
        let second = Monitor::new(&config, broker, MemoryBackend::new());

        assert!(first.group().starts_with("courier-monitor-"));
        assert_ne!(first.group(), second.group());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_detects_silence_without_heartbeats() {
        let Fixture {
            broker,
            store,
            clock,
            mut monitor,
        } = fixture();
        let dead = WorkerId::from("worker_dead");
        let task = held_task(&store, &dead).await;
        let shutdown = monitor.shutdown_handle();

        let running = tokio::spawn(async move {
            monitor.run().await.unwrap();
            monitor
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker
            .publish_json("courier:heartbeats", dead.as_str(), &heartbeat(&dead, 1_000.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        // no more heartbeats from anyone
        clock.advance(Duration::from_secs(11));
        tokio::time::sleep(Duration::from_secs(2)).await;

        shutdown.store(true, Ordering::SeqCst);
        let monitor = running.await.unwrap();

        assert!(monitor.detector().is_empty());
        assert_eq!(store.status(&task).await.unwrap(), TaskView::Known(StatusRecord::queued()));
        assert!(broker.groups("courier:heartbeats").is_empty());
    }
}
