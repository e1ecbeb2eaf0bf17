//! Common test utilities and fixtures

use chrono::{DateTime, Utc};
use courier_core::Clock;
use std::sync::Once;
use tokio::time::Instant;

static INIT: Once = Once::new();

/// Initialize test environment (logging, etc.)
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("courier=debug")
            .try_init();
    });
}

/// Check if Redis is available for integration tests
pub async fn redis_available() -> bool {
    use std::time::Duration;

    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect("localhost:6379"),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Generate a unique topic name
pub fn unique_topic(prefix: &str) -> String {
    format!("{}_{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Wall clock driven by tokio time, so paused tests move heartbeat
/// timestamps and liveness checks together
#[derive(Debug)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl TokioClock {
    /// Must be created inside the test runtime
    pub fn new() -> Self {
        Self {
            origin: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}
