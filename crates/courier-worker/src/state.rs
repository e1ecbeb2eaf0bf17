//! Status and counters shared between a worker's loops

use courier_core::WorkerStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Written by the executor, read by the heartbeat emitter
#[derive(Debug, Default)]
pub struct WorkerState {
    active: AtomicBool,
    task_count: AtomicU64,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn set_idle(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> WorkerStatus {
        if self.active.load(Ordering::SeqCst) {
            WorkerStatus::Active
        } else {
            WorkerStatus::Idle
        }
    }

    /// Tasks handled so far, whatever their outcome
    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::SeqCst)
    }

    pub fn record_task(&self) {
        self.task_count.fetch_add(1, Ordering::SeqCst);
    }
}
