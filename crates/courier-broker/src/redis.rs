//! Redis broker implementation using Redis Streams
//!
//! - Each topic is a stream; `XADD` appends, preserving order
//! - Consumer groups (`XGROUP CREATE ... MKSTREAM`) split a stream between members
//! - `XREADGROUP` hands out new entries, `XACK` commits them
//! - Entries a dead member left pending longer than the visibility timeout
//!   are claimed with `XCLAIM` and delivered again
//! - Topics with a configured cap are trimmed on write (`XADD MAXLEN ~`)

use crate::traits::{Broker, BrokerError, BrokerResult, Consumer, ConsumerConfig, StartFrom};
use async_trait::async_trait;
use bytes::Bytes;
use courier_core::Delivery;
use deadpool_redis::{Config, Pool, Runtime};
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Connection = deadpool_redis::Connection;

/// Field holding the partition key inside a stream entry
const KEY_FIELD: &str = "key";

/// Field holding the message body inside a stream entry
const PAYLOAD_FIELD: &str = "payload";

/// Pending entries inspected per claim attempt
const CLAIM_BATCH: usize = 10;

/// Transport over Redis Streams with a pooled connection
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    config: Arc<RedisBrokerConfig>,
}

/// Connection settings for [`RedisBroker`]
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub url: String,

    /// Maximum pooled connections
    pub pool_size: usize,

    /// Approximate entry cap per stream; streams not listed grow until trimmed
    pub max_len: HashMap<String, usize>,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://localhost:6379"),
            pool_size: 10,
            max_len: HashMap::new(),
        }
    }
}

impl From<&courier_core::BrokerConfig> for RedisBrokerConfig {
    fn from(config: &courier_core::BrokerConfig) -> Self {
        Self {
            url: config.url.clone(),
            pool_size: config.pool_size,
            max_len: HashMap::from([(
                config.heartbeat_topic.clone(),
                config.heartbeat_max_len,
            )]),
        }
    }
}

impl RedisBrokerConfig {
    /// Cap `topic` at roughly `len` entries
    pub fn max_len(mut self, topic: impl Into<String>, len: usize) -> Self {
        self.max_len.insert(topic.into(), len);
        self
    }
}

fn connection_error(e: impl ToString) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

impl RedisBroker {
    /// Connect to `url` with the default pool size
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        Self::with_config(RedisBrokerConfig {
            url: url.to_string(),
            ..RedisBrokerConfig::default()
        })
        .await
    }

    /// Build the pool and check the server answers before returning
    pub async fn with_config(config: RedisBrokerConfig) -> BrokerResult<Self> {
        let pool = Config::from_url(&config.url)
            .builder()
            .map_err(connection_error)?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(connection_error)?;

        let mut conn = pool.get().await.map_err(connection_error)?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await
            .map_err(connection_error)?;

        info!("Transport connected at {}", config.url);
        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    async fn conn(&self) -> BrokerResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Pool(e.to_string()))
    }

    /// Create the group if it does not exist yet
    async fn ensure_group(&self, topic: &str, group: &str, start: StartFrom) -> BrokerResult<()> {
        let mut conn = self.conn().await?;
        let start_id = match start {
            StartFrom::Earliest => "0",
            StartFrom::Latest => "$",
        };

        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(topic, group, start_id).await;
        match created {
            Ok(()) => {
                debug!("Created consumer group {} on {}", group, topic);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::Connection(e.to_string())),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    type Consumer = RedisConsumer;

    async fn is_connected(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await
            .is_ok()
    }

    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> BrokerResult<()> {
        let mut conn = self.conn().await?;
        let fields = [(KEY_FIELD, key.as_bytes()), (PAYLOAD_FIELD, &payload[..])];

        let added: redis::RedisResult<String> = match self.config.max_len.get(topic) {
            Some(&len) => {
                conn.xadd_maxlen(topic, StreamMaxlen::Approx(len), "*", &fields)
                    .await
            }
            None => conn.xadd(topic, "*", &fields).await,
        };
        let id = added.map_err(|e| BrokerError::Publish(e.to_string()))?;

        debug!("Published message {} with key {} to {}", id, key, topic);
        Ok(())
    }

    async fn subscribe(&self, config: ConsumerConfig) -> BrokerResult<Self::Consumer> {
        self.ensure_group(&config.topic, &config.group, config.start)
            .await?;

        let name = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));

        info!(
            "Consumer {} joined group {} on {} ({})",
            name, config.group, config.topic, self.config.url
        );

        Ok(RedisConsumer {
            broker: self.clone(),
            name,
            config,
        })
    }

    async fn remove_group(&self, topic: &str, group: &str) -> BrokerResult<()> {
        let mut conn = self.conn().await?;

        // XGROUP DESTROY fails on a missing stream
        let exists: bool = conn
            .exists(topic)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        if !exists {
            return Ok(());
        }

        let removed: i64 = conn
            .xgroup_destroy(topic, group)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!("Removed consumer group {} on {} ({})", group, topic, removed);
        Ok(())
    }
}

/// Member of a Redis Streams consumer group
pub struct RedisConsumer {
    broker: RedisBroker,
    name: String,
    config: ConsumerConfig,
}

impl RedisConsumer {
    /// Consumer name inside the group
    pub fn name(&self) -> &str {
        &self.name
    }

    fn to_delivery(&self, entry: &StreamId) -> BrokerResult<Delivery> {
        let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).ok_or_else(|| {
            BrokerError::Consume(format!("entry {} has no {} field", entry.id, PAYLOAD_FIELD))
        })?;
        Ok(Delivery::new(
            self.config.topic.clone(),
            Bytes::from(payload),
            entry.id.clone(),
        ))
    }

    /// Take over one entry another member left pending too long
    async fn claim_stale(&self, conn: &mut Connection) -> BrokerResult<Option<Delivery>> {
        let min_idle_ms = self.config.visibility_timeout.as_millis() as usize;

        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.config.topic, &self.config.group, "-", "+", CLAIM_BATCH)
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.consumer != self.name && p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .take(1)
            .collect();

        if stale.is_empty() {
            return Ok(None);
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.topic,
                &self.config.group,
                &self.name,
                min_idle_ms,
                &stale[..],
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        match claimed.ids.first() {
            Some(entry) => {
                warn!(
                    "Claimed stale entry {} on {} for {}",
                    entry.id, self.config.topic, self.name
                );
                Ok(Some(self.to_delivery(entry)?.redelivered()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Consumer for RedisConsumer {
    async fn next(&mut self) -> Option<BrokerResult<Delivery>> {
        let mut conn = match self.broker.conn().await {
            Ok(c) => c,
            Err(e) => return Some(Err(e)),
        };

        match self.claim_stale(&mut conn).await {
            Ok(Some(delivery)) => return Some(Ok(delivery)),
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }

        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.name)
            .count(1)
            .block(self.config.block_timeout.as_millis() as usize);

        let reply: Option<StreamReadReply> = match conn
            .xread_options(&[&self.config.topic], &[">"], &options)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Some(Err(BrokerError::Consume(e.to_string()))),
        };

        // Nil reply means the block timeout elapsed
        let entry = reply?
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .next()?;

        Some(self.to_delivery(&entry))
    }

    async fn commit(&self, delivery: &Delivery) -> BrokerResult<()> {
        let mut conn = self.broker.conn().await?;

        let _: i64 = conn
            .xack(&self.config.topic, &self.config.group, &[&delivery.delivery_tag])
            .await
            .map_err(|e| BrokerError::Commit(e.to_string()))?;

        debug!("Acknowledged entry {} on {}", delivery.delivery_tag, self.config.topic);
        Ok(())
    }
}
