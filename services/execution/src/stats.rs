use collections::RollingWindow;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

const LATENCY_WINDOW: usize = 1024;

/// Consumer counters; `in_flight` is derived from the permit pool
#[derive(Debug)]
pub struct ExecutionStats {
    pub received: AtomicU64,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
    pub invalid: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub reclaimed: AtomicU64,
    pub unacked: AtomicU64,
    pub read_failures: AtomicU64,
    /// Strategy call duration, in ms
    execution_latency: Mutex<RollingWindow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatsSnapshot {
    pub received: u64,
    pub executed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub invalid: u64,
    pub dead_lettered: u64,
    pub reclaimed: u64,
    pub unacked: u64,
    pub read_failures: u64,
    pub in_flight: usize,
    pub capacity: usize,
    pub avg_execution_ms: Option<f64>,
    pub max_execution_ms: Option<f64>,
}

impl Default for ExecutionStats {
    fn default() -> Self {
        Self {
            received: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            unacked: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            execution_latency: Mutex::new(RollingWindow::new(LATENCY_WINDOW)),
        }
    }
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self, elapsed_ms: f64) {
        // Durations are always finite.
        let _ = self.execution_latency.lock().push(elapsed_ms);
    }

    pub fn record_read(&self, ok: bool) {
        if ok {
            self.read_failures.store(0, Ordering::Relaxed);
        } else {
            Self::incr(&self.read_failures);
        }
    }

    pub fn snapshot(&self, in_flight: usize, capacity: usize) -> ExecutionStatsSnapshot {
        let (avg_execution_ms, max_execution_ms) = {
            let window = self.execution_latency.lock();
            (window.average(), window.max())
        };
        ExecutionStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            unacked: self.unacked.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            in_flight,
            capacity,
            avg_execution_ms,
            max_execution_ms,
        }
    }
}
