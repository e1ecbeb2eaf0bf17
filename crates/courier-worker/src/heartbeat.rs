//! Periodic liveness broadcast

use crate::state::WorkerState;
use courier_broker::{Broker, BrokerResult};
use courier_core::{Clock, Heartbeat, WorkerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Publishes a [`Heartbeat`] for one worker on a fixed interval.
///
/// Delivery is best effort: a failed publish is logged and the next tick
/// tries again.
pub struct HeartbeatEmitter<B: Broker> {
    broker: B,
    topic: String,
    worker_id: WorkerId,
    state: Arc<WorkerState>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl<B: Broker> HeartbeatEmitter<B> {
    pub fn new(
        broker: B,
        topic: impl Into<String>,
        worker_id: WorkerId,
        state: Arc<WorkerState>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            worker_id,
            state,
            clock,
            interval: Duration::from_secs(5),
        }
    }

    /// Set the emit interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Snapshot of the worker right now
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            worker_id: self.worker_id.clone(),
            status: self.state.status(),
            task_count: self.state.task_count(),
            timestamp: self.clock.unix_seconds(),
        }
    }

    /// Publish one heartbeat
    pub async fn emit(&self) -> BrokerResult<()> {
        let heartbeat = self.heartbeat();
        self.broker
            .publish_json(&self.topic, self.worker_id.as_str(), &heartbeat)
            .await?;
        debug!(
            "Heartbeat sent: {} {} tasks={}",
            heartbeat.worker_id, heartbeat.status, heartbeat.task_count
        );
        Ok(())
    }

    /// Emit forever, starting immediately
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.emit().await {
                warn!("Failed to send heartbeat: {}", e);
            }
        }
    }
}
