//! Courier Broker - Transport abstraction layer
//!
//! This crate provides the ordered publish/subscribe log that carries task
//! submissions and worker heartbeats:
//! - In-memory partitioned log (tests and single-process setups)
//! - Redis Streams (consumer groups, explicit acknowledgement)

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::{MemoryBroker, MemoryConsumer};
pub use redis::{RedisBroker, RedisBrokerConfig, RedisConsumer};
pub use traits::{Broker, BrokerError, BrokerResult, Consumer, ConsumerConfig, StartFrom};
