//! Redis key-value store
//!
//! Status and payload records are plain string keys; listing walks the
//! keyspace with a `SCAN` cursor, never `KEYS`.

use crate::traits::{Backend, BackendError, BackendResult};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 100;

/// Store backed by a pooled Redis connection
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    config: Arc<RedisBackendConfig>,
}

/// Connection settings for [`RedisBackend`]
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    pub url: String,

    /// Maximum pooled connections
    pub pool_size: usize,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://localhost:6379"),
            pool_size: 10,
        }
    }
}

fn connection_error(e: impl ToString) -> BackendError {
    BackendError::Connection(e.to_string())
}

impl RedisBackend {
    /// Connect to `url` with the default pool size
    pub async fn connect(url: &str) -> BackendResult<Self> {
        Self::with_config(RedisBackendConfig {
            url: url.to_string(),
            ..RedisBackendConfig::default()
        })
        .await
    }

    /// Build the pool and check the server answers before returning
    pub async fn with_config(config: RedisBackendConfig) -> BackendResult<Self> {
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

        info!("Result store connected at {}", config.url);
        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn conn(&self) -> BackendResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| BackendError::Pool(e.to_string()))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn is_connected(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await
            .is_ok()
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.conn().await?;

        conn.get(key)
            .await
            .map_err(|e| BackendError::Retrieval(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        let mut conn = self.conn().await?;

        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| BackendError::Storage(e.to_string()))?;

        debug!("Stored {}", key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await
                .map_err(|e| BackendError::Retrieval(e.to_string()))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.conn().await?;

        let deleted: i32 = conn
            .del(key)
            .await
            .map_err(|e| BackendError::Storage(e.to_string()))?;

        Ok(deleted > 0)
    }
}
