//! Broker trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use courier_core::Delivery;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Publish error
    #[error("publish error: {0}")]
    Publish(String),

    /// Consume error
    #[error("consume error: {0}")]
    Consume(String),

    /// Offset commit error
    #[error("commit error: {0}")]
    Commit(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Pool error
    #[error("connection pool error: {0}")]
    Pool(String),
}

impl From<courier_core::Error> for BrokerError {
    fn from(err: courier_core::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

/// Where a consumer group starts reading when it is first created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Every message still in the log
    #[default]
    Earliest,
    /// Only messages published after the group was created
    Latest,
}

/// Configuration for a consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topic to consume from
    pub topic: String,

    /// Consumer group; members of one group split the topic between them
    pub group: String,

    /// Name of this member inside the group (generated if not set)
    pub consumer_name: Option<String>,

    /// Start position for a new group
    pub start: StartFrom,

    /// Block timeout when waiting for messages
    pub block_timeout: Duration,

    /// How long a message may stay uncommitted before another member takes it over
    pub visibility_timeout: Duration,
}

impl ConsumerConfig {
    /// Create a new consumer config
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer_name: None,
            start: StartFrom::default(),
            block_timeout: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(30),
        }
    }

    /// Set the member name
    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    /// Set the start position
    pub fn start(mut self, start: StartFrom) -> Self {
        self.start = start;
        self
    }

    /// Set the block timeout
    pub fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the visibility timeout
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// A group member that yields deliveries in log order
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Get the next delivery.
    ///
    /// Returns `None` when nothing arrived within the block timeout.
    async fn next(&mut self) -> Option<BrokerResult<Delivery>>;

    /// Commit the offset of a delivery. Uncommitted deliveries are handed out
    /// again if this member disappears.
    async fn commit(&self, delivery: &Delivery) -> BrokerResult<()>;
}

/// Main broker trait for publishing and consuming messages
#[async_trait]
pub trait Broker: Send + Sync + Clone + 'static {
    /// The consumer type produced by this broker
    type Consumer: Consumer + 'static;

    /// Check if connected
    async fn is_connected(&self) -> bool;

    /// Append a message to a topic. `key` selects the partition.
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> BrokerResult<()>;

    /// Join a consumer group
    async fn subscribe(&self, config: ConsumerConfig) -> BrokerResult<Self::Consumer>;

    /// Delete a consumer group and its committed offsets. Removing a group
    /// that does not exist is not an error.
    async fn remove_group(&self, topic: &str, group: &str) -> BrokerResult<()>;

    /// Encode a value as JSON and publish it
    async fn publish_json<T>(&self, topic: &str, key: &str, value: &T) -> BrokerResult<()>
    where
        T: Serialize + Sync,
    {
        let payload = courier_core::encode(value)?;
        self.publish(topic, key, payload).await
    }
}
