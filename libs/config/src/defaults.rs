//! Default values shared by every service
//!
//! Durations are in milliseconds.

/// Instance identity and health endpoint
pub mod instance {
    pub const HEALTH_PORT: u16 = 8080;
}

/// Stream broker client
pub mod broker {
    pub const URL: &str = "redis://127.0.0.1:6379/";

    /// Entries kept per stream before the oldest are trimmed
    pub const STREAM_MAX_LEN: usize = 100_000;

    pub const BLOCK_TIMEOUT_MS: u64 = 1_000;

    pub const READ_BATCH: usize = 32;

    /// Pending entries older than this are reclaimed from crashed consumers
    pub const CLAIM_MIN_IDLE_MS: u64 = 30_000;

    pub const CLAIM_BATCH: usize = 100;
}

/// Leader lease
pub mod leader {
    pub const LEASE_KEY: &str = "lease:coordinator-leader";

    pub const LEASE_TTL_MS: u64 = 10_000;

    /// Must stay strictly below the lease TTL
    pub const RENEWAL_INTERVAL_MS: u64 = 3_000;
}

/// Coordinator routing
pub mod coordinator {
    pub const DEDUP_WINDOW_MS: u64 = 5_000;

    pub const DEDUP_MAX_ENTRIES: usize = 100_000;

    pub const DEDUP_SWEEP_INTERVAL_MS: u64 = 1_000;

    pub const FORWARD_BREAKER: &str = "execution-forwarding";
}

/// Execution consumer
pub mod execution {
    pub const QUEUE_CAPACITY: usize = 10;

    pub const WORKER_COUNT: usize = 4;

    pub const DRAIN_TIMEOUT_MS: u64 = 5_000;

    /// Opportunities older than this are rejected as stale
    pub const MAX_OPPORTUNITY_AGE_MS: u64 = 30_000;
}

/// Circuit breaker
pub mod breaker {
    pub const FAILURE_THRESHOLD: u32 = 5;

    pub const RECOVERY_TIMEOUT_MS: u64 = 30_000;
}

/// Retry with exponential backoff
pub mod retry {
    pub const MAX_ATTEMPTS: u32 = 3;

    pub const BASE_DELAY_MS: u64 = 100;

    pub const MAX_DELAY_MS: u64 = 5_000;

    pub const MULTIPLIER: f64 = 2.0;

    /// Fraction of each delay randomised
    pub const JITTER: f64 = 0.2;
}

/// Dead-letter queue
pub mod dead_letter {
    pub const MAX_ENTRIES: usize = 10_000;

    pub const MAX_RETRIES: u32 = 3;

    pub const TTL_MS: u64 = 300_000;

    pub const SWEEP_INTERVAL_MS: u64 = 5_000;
}

/// Self-healing supervisor
pub mod supervisor {
    pub const POLL_INTERVAL_MS: u64 = 5_000;

    pub const FAILURE_THRESHOLD: u32 = 3;

    pub const RESTART_BASE_DELAY_MS: u64 = 1_000;

    pub const RESTART_MAX_DELAY_MS: u64 = 60_000;

    pub const RESTART_MULTIPLIER: f64 = 2.0;

    /// Direct restarts before dependencies are restarted too
    pub const MAX_DIRECT_RESTARTS: u32 = 3;

    pub const PROBE_TIMEOUT_MS: u64 = 2_000;
}
