use collections::{top_k_by, RollingWindow};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Samples kept for the forward latency average
const LATENCY_WINDOW: usize = 1_024;
/// Pairs listed in the busiest-pairs report
const BUSIEST_PAIRS: usize = 5;

/// Counters shared by the coordinator stages
#[derive(Debug)]
pub struct CoordinatorStats {
    pub received: AtomicU64,
    pub invalid: AtomicU64,
    pub intake_duplicates: AtomicU64,
    pub handed_off: AtomicU64,
    pub forwarded: AtomicU64,
    pub forward_duplicates: AtomicU64,
    pub breaker_rejections: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub claimed: AtomicU64,
    pub warmed: AtomicU64,
    pub replayed: AtomicU64,
    /// Parked forwards a follower handed back to the leader
    pub handed_back: AtomicU64,
    /// Forwards parked without an attempt while forwarding was degraded
    pub degraded_parks: AtomicU64,
    /// Forwards abandoned because the leadership term ended mid-attempt
    pub deposed_forwards: AtomicU64,
    /// Consecutive failed reads across stages; reset by any successful read
    pub read_failures: AtomicU64,
    /// createdAt → forwarded, in ms
    forward_latency: Mutex<RollingWindow>,
    forwards_by_pair: DashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatsSnapshot {
    pub received: u64,
    pub invalid: u64,
    pub intake_duplicates: u64,
    pub handed_off: u64,
    pub forwarded: u64,
    pub forward_duplicates: u64,
    pub breaker_rejections: u64,
    pub dead_lettered: u64,
    pub claimed: u64,
    pub warmed: u64,
    pub replayed: u64,
    pub handed_back: u64,
    pub degraded_parks: u64,
    pub deposed_forwards: u64,
    pub read_failures: u64,
    pub avg_forward_latency_ms: Option<f64>,
    pub max_forward_latency_ms: Option<f64>,
    pub busiest_pairs: Vec<(String, u64)>,
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        Self {
            received: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            intake_duplicates: AtomicU64::new(0),
            handed_off: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            forward_duplicates: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            warmed: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            handed_back: AtomicU64::new(0),
            degraded_parks: AtomicU64::new(0),
            deposed_forwards: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            forward_latency: Mutex::new(RollingWindow::new(LATENCY_WINDOW)),
            forwards_by_pair: DashMap::new(),
        }
    }
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward(&self, pair_key: &str, latency_ms: u64) {
        Self::incr(&self.forwarded);
        // u64 → f64 is always finite
        let _ = self.forward_latency.lock().push(latency_ms as f64);
        *self.forwards_by_pair.entry(pair_key.to_string()).or_insert(0) += 1;
    }

    pub fn record_read(&self, ok: bool) {
        if ok {
            self.read_failures.store(0, Ordering::Relaxed);
        } else {
            Self::incr(&self.read_failures);
        }
    }

    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let (avg, max) = {
            let window = self.forward_latency.lock();
            (window.average(), window.max())
        };
        let busiest_pairs = top_k_by(
            self.forwards_by_pair
                .iter()
                .map(|e| (e.key().clone(), *e.value())),
            BUSIEST_PAIRS,
            |a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)),
        );

        CoordinatorStatsSnapshot {
            received: load(&self.received),
            invalid: load(&self.invalid),
            intake_duplicates: load(&self.intake_duplicates),
            handed_off: load(&self.handed_off),
            forwarded: load(&self.forwarded),
            forward_duplicates: load(&self.forward_duplicates),
            breaker_rejections: load(&self.breaker_rejections),
            dead_lettered: load(&self.dead_lettered),
            claimed: load(&self.claimed),
            warmed: load(&self.warmed),
            replayed: load(&self.replayed),
            handed_back: load(&self.handed_back),
            degraded_parks: load(&self.degraded_parks),
            deposed_forwards: load(&self.deposed_forwards),
            read_failures: load(&self.read_failures),
            avg_forward_latency_ms: avg,
            max_forward_latency_ms: max,
            busiest_pairs,
        }
    }
}
