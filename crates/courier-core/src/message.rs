//! JSON wire encoding and the transport delivery envelope

use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Content type of every message Courier publishes
pub const CONTENT_TYPE: &str = "application/json";

/// Encode a value as UTF-8 JSON
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let data = serde_json::to_vec(value)?;
    Ok(Bytes::from(data))
}

/// Decode a value from UTF-8 JSON
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// A message handed out by a transport consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Source topic
    pub topic: String,

    /// Raw message body
    pub payload: Bytes,

    /// Transport-specific handle used to commit this message's offset
    pub delivery_tag: String,

    /// Whether the message was handed out before without being committed
    pub redelivered: bool,
}

impl Delivery {
    /// Create a new delivery
    pub fn new(topic: impl Into<String>, payload: Bytes, delivery_tag: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            delivery_tag: delivery_tag.into(),
            redelivered: false,
        }
    }

    /// Mark as redelivered
    pub fn redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }

    /// Decode the body
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        decode(&self.payload)
    }
}
