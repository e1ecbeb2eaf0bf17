//! Following worker heartbeats

use courier_broker::{Broker, BrokerResult, Consumer, ConsumerConfig, StartFrom};
use courier_core::Heartbeat;
use tracing::warn;
use uuid::Uuid;

/// Reads the heartbeat topic from its current end under a private group,
/// so every listener sees every heartbeat.
///
/// The group outlives the process unless [`close`](Self::close) is called.
pub struct HeartbeatListener<B: Broker> {
    broker: B,
    consumer: B::Consumer,
    topic: String,
    group: String,
}

impl<B: Broker> HeartbeatListener<B> {
    /// Join the heartbeat topic
    pub async fn subscribe(broker: &B, topic: &str) -> BrokerResult<Self> {
        let group = format!("courier-listener-{}", Uuid::new_v4());
        let config = ConsumerConfig::new(topic, &group).start(StartFrom::Latest);
        let consumer = broker.subscribe(config).await?;
        Ok(Self {
            broker: broker.clone(),
            consumer,
            topic: topic.to_string(),
            group,
        })
    }

    /// Name of the private consumer group
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Leave the topic and delete the private group
    pub async fn close(self) -> BrokerResult<()> {
        let Self {
            broker,
            consumer,
            topic,
            group,
        } = self;
        drop(consumer);
        broker.remove_group(&topic, &group).await
    }

    /// Next heartbeat, or `None` if nothing arrived within the block timeout.
    ///
    /// Undecodable messages are logged and skipped.
    pub async fn next(&mut self) -> BrokerResult<Option<Heartbeat>> {
        loop {
            let delivery = match self.consumer.next().await {
                Some(delivery) => delivery?,
                None => return Ok(None),
            };
            self.consumer.commit(&delivery).await?;

            match delivery.decode::<Heartbeat>() {
                Ok(heartbeat) => return Ok(Some(heartbeat)),
                Err(e) => warn!("Ignoring malformed heartbeat {}: {}", delivery.delivery_tag, e),
            }
        }
    }

    /// Call `on_heartbeat` for every heartbeat until it returns `false`
    pub async fn listen<F>(&mut self, mut on_heartbeat: F) -> BrokerResult<()>
    where
        F: FnMut(&Heartbeat) -> bool,
    {
        loop {
            if let Some(heartbeat) = self.next().await? {
                if !on_heartbeat(&heartbeat) {
                    return Ok(());
                }
            }
        }
    }
}
