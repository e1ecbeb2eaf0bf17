//! Heartbeat-based failure detection

use courier_core::{Heartbeat, WorkerId};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Liveness table of workers, keyed by the newest heartbeat timestamp seen.
///
/// Starts empty and lives as long as the monitor process; losing it only
/// delays detection. Timestamps are float Unix seconds as sent by workers.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    timeout: Duration,
    retention: Duration,
    last_seen: HashMap<WorkerId, f64>,
    /// Workers already declared, with their last heartbeat timestamp
    tombstones: HashMap<WorkerId, f64>,
}

impl FailureDetector {
    /// Detector declaring workers silent for longer than `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retention: (timeout * 10).max(Duration::from_secs(60)),
            last_seen: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    /// How long a declared worker is remembered, to drop late heartbeats
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a heartbeat. Returns `false` if it was ignored.
    ///
    /// Only the newest timestamp per worker counts, whatever order
    /// heartbeats arrive in. A declared worker is only brought back by a
    /// heartbeat newer than the last one seen before it was declared.
    pub fn observe(&mut self, heartbeat: &Heartbeat) -> bool {
        let timestamp = heartbeat.timestamp;
        if !timestamp.is_finite() {
            warn!(
                "Ignoring heartbeat from {} with invalid timestamp",
                heartbeat.worker_id
            );
            return false;
        }

        if let Some(&last_before) = self.tombstones.get(&heartbeat.worker_id) {
            if timestamp <= last_before {
                debug!("Ignoring stale heartbeat from declared worker {}", heartbeat.worker_id);
                return false;
            }
            self.tombstones.remove(&heartbeat.worker_id);
        }

        let last_seen = self
            .last_seen
            .entry(heartbeat.worker_id.clone())
            .or_insert(timestamp);
        *last_seen = last_seen.max(timestamp);
        true
    }

    /// Declare and forget every worker silent for longer than the timeout.
    ///
    /// A worker is reported once per silence; it is reported again only
    /// after a newer heartbeat revives it.
    pub fn sweep(&mut self, now: f64) -> Vec<WorkerId> {
        let timeout = self.timeout.as_secs_f64();
        let mut dead: Vec<WorkerId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now - **seen > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        dead.sort();

        for id in &dead {
            if let Some(seen) = self.last_seen.remove(id) {
                self.tombstones.insert(id.clone(), seen);
            }
        }

        let retention = self.retention.as_secs_f64();
        self.tombstones.retain(|_, &mut seen| now - seen <= retention);

        dead
    }

    /// Newest heartbeat timestamp of a live worker
    pub fn last_seen(&self, worker_id: &WorkerId) -> Option<f64> {
        self.last_seen.get(worker_id).copied()
    }

    pub fn is_tracked(&self, worker_id: &WorkerId) -> bool {
        self.last_seen.contains_key(worker_id)
    }

    /// Workers currently considered alive, sorted
    pub fn workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self.last_seen.keys().cloned().collect();
        workers.sort();
        workers
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::WorkerStatus;

    fn hb(worker: &str, timestamp: f64) -> Heartbeat {
        Heartbeat {
            worker_id: WorkerId::from(worker),
            status: WorkerStatus::Idle,
            task_count: 0,
            timestamp,
        }
    }

    fn detector() -> FailureDetector {
        FailureDetector::new(Duration::from_secs(10))
    }

    #[test]
    fn test_starts_empty() {
        let mut detector = detector();
        assert!(detector.is_empty());
        assert!(detector.sweep(1_000.0).is_empty());
    }

    #[test]
    fn test_declares_after_timeout_only() {
        let mut detector = detector();
        detector.observe(&hb("worker_a", 100.0));

        assert!(detector.sweep(110.0).is_empty());
        assert_eq!(detector.sweep(110.5), vec![WorkerId::from("worker_a")]);
        assert!(!detector.is_tracked(&WorkerId::from("worker_a")));
    }

    #[test]
    fn test_declared_once() {
        let mut detector = detector();
        detector.observe(&hb("worker_a", 100.0));

        assert_eq!(detector.sweep(120.0).len(), 1);
        assert!(detector.sweep(121.0).is_empty());
    }

    #[test]
    fn test_reordered_heartbeats_keep_newest() {
        let mut detector = detector();
        for ts in [105.0, 100.0, 109.0, 101.0, 103.0] {
            detector.observe(&hb("worker_a", ts));
        }

        assert_eq!(detector.last_seen(&WorkerId::from("worker_a")), Some(109.0));
        assert!(detector.sweep(118.0).is_empty());
    }

    #[test]
    fn test_stale_heartbeat_does_not_resurrect() {
        let mut detector = detector();
        detector.observe(&hb("worker_a", 100.0));
        detector.observe(&hb("worker_a", 105.0));
        assert_eq!(detector.sweep(116.0).len(), 1);

        // delayed copy of an old heartbeat
        assert!(!detector.observe(&hb("worker_a", 100.0)));
        assert!(detector.is_empty());

        // a genuinely newer one does
        assert!(detector.observe(&hb("worker_a", 117.0)));
        assert!(detector.is_tracked(&WorkerId::from("worker_a")));
    }

    #[test]
    fn test_revival_compares_against_last_heartbeat() {
        let mut detector = detector();
        detector.observe(&hb("worker_a", 105.0));
        assert_eq!(detector.sweep(116.0).len(), 1);

        // sent before the declaration, but after the last heartbeat seen
        assert!(detector.observe(&hb("worker_a", 110.0)));
        assert_eq!(detector.last_seen(&WorkerId::from("worker_a")), Some(110.0));
    }

    #[test]
    fn test_tombstones_are_pruned() {
        let mut detector = detector().with_retention(Duration::from_secs(30));
        detector.observe(&hb("worker_a", 100.0));
        detector.sweep(111.0);
        assert_eq!(detector.tombstones.len(), 1);

        detector.sweep(131.0);
        assert!(detector.tombstones.is_empty());
    }

    #[test]
    fn test_invalid_timestamp_ignored() {
        let mut detector = detector();
        assert!(!detector.observe(&hb("worker_a", f64::NAN)));
        assert!(detector.is_empty());
    }

    #[test]
    fn test_only_silent_workers_declared() {
        let mut detector = detector();
        detector.observe(&hb("worker_a", 100.0));
        detector.observe(&hb("worker_b", 100.0));
        detector.observe(&hb("worker_b", 108.0));

        assert_eq!(detector.sweep(115.0), vec![WorkerId::from("worker_a")]);
        assert_eq!(detector.workers(), vec![WorkerId::from("worker_b")]);
    }
}
