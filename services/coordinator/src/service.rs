//! # Coordinator
//!
//! ## Purpose
//!
//! Wires leader election, the three routing stages, the dead-letter sweep and
//! the dedup sweeper into one process, and publishes their state on the
//! health endpoint.
//!
//! ## Architecture Role
//!
//! ```text
//! [LeaderElector] ──watch──▶ [ForwardStage] ──▶ stream:execution-requests
//!        ▲                         ▲   │
//!   lease store          hand-off  │   └─ breaker open / append failed ─▶ [DeadLetterQueue]
//!                                  │                                         │
//! stream:opportunities ─▶ [IntakeStage] ─▶ stream:coordinator-handoff        │
//!                                                                 [ForwardReplayHandler]
//! ```

use crate::dedup::DedupCache;
use crate::error::CoordinatorError;
use crate::leader::{LeaderConfig, LeaderElector, LeadershipState};
use crate::replay::ForwardReplayHandler;
use crate::stages::{
    ForwardStage, IntakeStage, ParkingPolicy, ReadSettings, StageContext, WarmupStage,
};
use crate::stats::{CoordinatorStats, CoordinatorStatsSnapshot};
use health_check::{HealthStatus, SharedHealth};
use resilience::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState, DeadLetterQueue,
    DeadLetterStats, DegradationManager, RetryPolicy,
};
use serde::Serialize;
use service_config::ServiceConfig;
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{LeaseStore, StreamBroker};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use types::{current_time_ms, InstanceId};

/// Consecutive failed reads before the service reports itself unhealthy
const UNHEALTHY_READ_FAILURES: u64 = 3;

/// Capability switched off while the forwarding breaker is open
pub const FORWARDING_CAPABILITY: &str = "execution-forwarding";

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub instance: String,
    pub leadership: LeadershipState,
    pub stats: CoordinatorStatsSnapshot,
    pub breakers: Vec<CircuitBreakerStats>,
    pub dead_letters: DeadLetterStats,
    pub intake_dedup_entries: usize,
    pub forward_dedup_entries: usize,
}

pub struct Coordinator {
    instance: InstanceId,
    broker: Arc<dyn StreamBroker>,
    leader: Arc<LeaderElector>,
    intake: Arc<IntakeStage>,
    forward: Arc<ForwardStage>,
    warmup: Arc<WarmupStage>,
    intake_dedup: Arc<DedupCache>,
    forward_dedup: Arc<DedupCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    forward_breaker: Arc<CircuitBreaker>,
    dead_letters: Arc<DeadLetterQueue>,
    degradation: Arc<DegradationManager>,
    stats: Arc<CoordinatorStats>,
    retry: RetryPolicy,
    dedup_sweep_interval: Duration,
    dead_letter_sweep_interval: Duration,
}

impl Coordinator {
    pub fn new(
        config: &ServiceConfig,
        instance: InstanceId,
        broker: Arc<dyn StreamBroker>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        let stats = Arc::new(CoordinatorStats::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.breaker_config()));
        let forward_breaker = breakers.get_or_create(&config.coordinator.forward_breaker);
        let dead_letters = Arc::new(DeadLetterQueue::with_journal(
            config.dead_letter.queue_config(),
            broker.clone(),
            instance.as_str(),
        ));
        let degradation = Arc::new(DegradationManager::new());
        degradation.register(FORWARDING_CAPABILITY, "park opportunities in the dead-letter queue");

        let leader = Arc::new(LeaderElector::new(
            leases,
            instance.clone(),
            LeaderConfig::from(&config.leader),
        ));
        let dedup = || {
            Arc::new(DedupCache::new(
                config.coordinator.dedup_window(),
                config.coordinator.dedup_max_entries,
            ))
        };
        let intake_dedup = dedup();
        let forward_dedup = dedup();

        let ctx = StageContext {
            broker: broker.clone(),
            instance: instance.clone(),
            reads: ReadSettings::from(&config.broker),
            retry: config.retry.policy(),
            dead_letters: dead_letters.clone(),
            parking: ParkingPolicy::from(&config.dead_letter),
            stats: stats.clone(),
        };

        Self {
            intake: Arc::new(IntakeStage::new(ctx.clone(), intake_dedup.clone())),
            forward: Arc::new(ForwardStage::new(
                ctx.clone(),
                forward_dedup.clone(),
                forward_breaker.clone(),
                leader.clone(),
                degradation.clone(),
                config.leader.lease_ttl(),
            )),
            warmup: Arc::new(WarmupStage::new(ctx, forward_dedup.clone())),
            instance,
            broker,
            leader,
            intake_dedup,
            forward_dedup,
            breakers,
            forward_breaker,
            dead_letters,
            degradation,
            stats,
            retry: config.retry.policy(),
            dedup_sweep_interval: config.coordinator.dedup_sweep_interval(),
            dead_letter_sweep_interval: config.dead_letter.sweep_interval(),
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn leader(&self) -> &Arc<LeaderElector> {
        &self.leader
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn forward_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.forward_breaker
    }

    pub fn intake(&self) -> &Arc<IntakeStage> {
        &self.intake
    }

    pub fn forward(&self) -> &Arc<ForwardStage> {
        &self.forward
    }

    pub fn warmup(&self) -> &Arc<WarmupStage> {
        &self.warmup
    }

    pub fn replay_handler(&self) -> ForwardReplayHandler {
        ForwardReplayHandler::new(
            self.broker.clone(),
            self.forward_breaker.clone(),
            self.leader.clone(),
            self.degradation.clone(),
            self.instance.clone(),
            self.stats.clone(),
        )
    }

    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }

    /// Create every consumer group the stages read from and take back the
    /// dead-letter entries a previous run of this instance left parked
    pub async fn prepare(&self) -> Result<(), CoordinatorError> {
        self.intake.prepare().await?;
        self.forward.prepare().await?;
        self.warmup.prepare().await?;
        self.dead_letters.recover().await?;
        Ok(())
    }

    /// Retry [`Coordinator::prepare`] until it succeeds.
    ///
    /// `Ok(false)` means shutdown arrived first.
    async fn join_groups(&self, mut shutdown: watch::Receiver<bool>) -> Result<bool, CoordinatorError> {
        let mut attempt = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(false);
            }
            match self.prepare().await {
                Ok(()) => {
                    self.stats.record_read(true);
                    return Ok(true);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    self.stats.record_read(false);
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, ?delay, error = %e, "Joining coordinator groups failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return Ok(false);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            instance: self.instance.to_string(),
            leadership: self.leader.state(),
            stats: self.stats.snapshot(),
            breakers: self.breakers.snapshot(),
            dead_letters: self.dead_letters.stats(),
            intake_dedup_entries: self.intake_dedup.len(),
            forward_dedup_entries: self.forward_dedup.len(),
        }
    }

    /// Push current state onto the health document
    pub async fn publish_health(&self, health: &SharedHealth) {
        // Half-open leaves the flag alone; the trial forward settles it.
        match self.forward_breaker.state() {
            CircuitState::Open => {
                self.degradation
                    .degrade(FORWARDING_CAPABILITY, "forwarding breaker open");
            }
            CircuitState::Closed => {
                self.degradation.restore(FORWARDING_CAPABILITY);
            }
            CircuitState::HalfOpen => {}
        }

        let status = self.status();
        let read_failures = status.stats.read_failures;
        let flags = self.degradation.flags();
        let mut health = health.lock().await;

        health.set_capabilities(flags.clone());
        health.add_detail("coordinator", &status);
        health.add_detail("capabilities", &self.degradation.snapshot());
        if read_failures >= UNHEALTHY_READ_FAILURES {
            health.set_status(HealthStatus::Unhealthy);
            health.add_error(&format!("{read_failures} consecutive broker read failures"));
        } else if flags.values().any(|available| !available) {
            health.set_status(HealthStatus::Degraded);
        } else {
            health.clear_errors();
            health.set_status(HealthStatus::Healthy);
        }
    }

    async fn run_health_publisher(
        self: Arc<Self>,
        health: SharedHealth,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_health(&health).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_dedup_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.dedup_sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = current_time_ms();
                    self.intake_dedup.sweep(now);
                    self.forward_dedup.sweep(now);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Run every stage until `shutdown` flips to `true`.
    ///
    /// When `health` is given, state is published on it every
    /// `publish_interval`, starting before the broker is reachable. Joining
    /// the consumer groups is retried with backoff until it succeeds.
    pub async fn run(
        self: Arc<Self>,
        health: Option<(SharedHealth, Duration)>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), CoordinatorError> {
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        if let Some((health, interval)) = health {
            tasks.push((
                "health-publisher",
                tokio::spawn(self.clone().run_health_publisher(health, interval, shutdown.clone())),
            ));
        }

        let joined = self.join_groups(shutdown.clone()).await;
        if !matches!(joined, Ok(true)) {
            for (_, task) in tasks {
                task.abort();
            }
            return joined.map(|_| ());
        }
        info!(instance = %self.instance, "🚀 Coordinator running");

        tasks.extend([
            ("leader", tokio::spawn(self.leader.clone().run(shutdown.clone()))),
            ("intake", tokio::spawn(self.intake.clone().run(shutdown.clone()))),
            ("forward", tokio::spawn(self.forward.clone().run(shutdown.clone()))),
            ("warmup", tokio::spawn(self.warmup.clone().run(shutdown.clone()))),
            (
                "dead-letter-sweeper",
                tokio::spawn(self.dead_letters.clone().run_sweeper(
                    self.dead_letter_sweep_interval,
                    Arc::new(self.replay_handler()),
                    shutdown.clone(),
                )),
            ),
            (
                "dedup-sweeper",
                tokio::spawn(self.clone().run_dedup_sweeper(shutdown.clone())),
            ),
        ]);

        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Coordinator task ended abnormally");
            }
        }
        self.warmup.teardown().await;
        info!(instance = %self.instance, "Coordinator stopped");
        Ok(())
    }
}
