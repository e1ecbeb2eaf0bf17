//! Courier Backend - Result storage abstraction layer
//!
//! This crate provides the shared key-value store that holds task status
//! records and original payloads:
//! - In-memory (tests and single-process setups)
//! - Redis (GET/SET/SCAN)
//!
//! [`ResultStore`] layers the task key layout on top of any [`Backend`].

pub mod memory;
pub mod redis;
pub mod store;
pub mod traits;

pub use memory::MemoryBackend;
pub use redis::{RedisBackend, RedisBackendConfig};
pub use store::{ResultStore, StoreStats};
pub use traits::{Backend, BackendError, BackendResult};
