//! # Self-Healing Supervisor
//!
//! Polls every managed unit on a fixed interval. After `failure_threshold`
//! consecutive failed probes a restart is scheduled with an increasing,
//! capped delay (`base * multiplier^n`). A unit that keeps failing after
//! `max_direct_restarts` restarts has its declared dependencies restarted
//! first, in declaration order, then itself.
//!
//! Capability flags carried by probe reports are forwarded to an attached
//! [`DegradationManager`].

use crate::degradation::DegradationManager;
use crate::error::ResilienceError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of one health probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub capabilities: BTreeMap<String, bool>,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            ..Self::default()
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            capabilities: BTreeMap::new(),
            detail: Some(detail.into()),
        }
    }

    pub fn with_capability(mut self, name: impl Into<String>, available: bool) -> Self {
        self.capabilities.insert(name.into(), available);
        self
    }
}

/// Source of health reports for one unit (e.g. an HTTP health endpoint)
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> HealthReport;
}

/// Something the supervisor can probe and restart
#[async_trait]
pub trait ManagedUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Units restarted first once direct restarts stop helping
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn probe(&self) -> HealthReport;

    async fn restart(&self) -> Result<(), ResilienceError>;
}

pub type RestartFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Unit made of an external probe and a restart action
pub struct ProbedUnit {
    name: String,
    dependencies: Vec<String>,
    probe: Arc<dyn HealthProbe>,
    restart: RestartFn,
}

impl ProbedUnit {
    pub fn new(name: impl Into<String>, probe: Arc<dyn HealthProbe>, restart: RestartFn) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            probe,
            restart,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

#[async_trait]
impl ManagedUnit for ProbedUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn probe(&self) -> HealthReport {
        self.probe.probe().await
    }

    async fn restart(&self) -> Result<(), ResilienceError> {
        (self.restart)()
            .await
            .map_err(|reason| ResilienceError::restart_failed(&self.name, reason))
    }
}

pub type TaskFactory = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// In-process unit: a spawned task that is healthy while it runs.
///
/// Restarting aborts whatever is left of the old task and spawns a fresh
/// one from the factory.
pub struct TaskUnit {
    name: String,
    dependencies: Vec<String>,
    factory: TaskFactory,
    handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl TaskUnit {
    /// Spawn the first instance of the task immediately
    pub fn spawn(name: impl Into<String>, factory: TaskFactory) -> Self {
        let handle = tokio::spawn(factory());
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            factory,
            handle: SyncMutex::new(Some(handle)),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Stop the task without restarting it
    pub fn abort(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ManagedUnit for TaskUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn probe(&self) -> HealthReport {
        match self.handle.lock().as_ref() {
            Some(handle) if !handle.is_finished() => HealthReport::healthy(),
            Some(_) => HealthReport::unhealthy("task exited"),
            None => HealthReport::unhealthy("task not running"),
        }
    }

    async fn restart(&self) -> Result<(), ResilienceError> {
        let fresh = tokio::spawn((self.factory)());
        if let Some(old) = self.handle.lock().replace(fresh) {
            old.abort();
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub failure_threshold: u32,
    pub restart_base_delay: Duration,
    pub restart_max_delay: Duration,
    pub restart_multiplier: f64,
    pub max_direct_restarts: u32,
    pub probe_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            failure_threshold: 3,
            restart_base_delay: Duration::from_secs(1),
            restart_max_delay: Duration::from_secs(60),
            restart_multiplier: 2.0,
            max_direct_restarts: 3,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl SupervisorConfig {
    /// Delay before restart number `restarts + 1` since the unit was last healthy
    pub fn restart_delay(&self, restarts: u32) -> Duration {
        let exponent = restarts.min(63) as i32;
        let secs = self.restart_base_delay.as_secs_f64() * self.restart_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.restart_max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitStats {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Restarts of this unit since it was last healthy
    pub restarts_since_healthy: u32,
    pub restarts: u64,
    /// Times this unit was restarted as a dependency of another unit
    pub dependency_restarts: u64,
    pub escalations: u64,
}

struct UnitState {
    unit: Arc<dyn ManagedUnit>,
    stats: UnitStats,
    restart_at: Option<Instant>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    units: Mutex<Vec<UnitState>>,
    degradation: Option<Arc<DegradationManager>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            units: Mutex::new(Vec::new()),
            degradation: None,
        }
    }

    pub fn with_degradation(mut self, degradation: Arc<DegradationManager>) -> Self {
        self.degradation = Some(degradation);
        self
    }

    pub async fn register(&self, unit: Arc<dyn ManagedUnit>) {
        let name = unit.name().to_string();
        info!(unit = %name, dependencies = ?unit.dependencies(), "Supervising unit");
        self.units.lock().await.push(UnitState {
            unit,
            stats: UnitStats {
                name,
                healthy: true,
                ..UnitStats::default()
            },
            restart_at: None,
        });
    }

    pub async fn stats(&self, name: &str) -> Option<UnitStats> {
        self.units
            .lock()
            .await
            .iter()
            .find(|u| u.stats.name == name)
            .map(|u| u.stats.clone())
    }

    pub async fn all_stats(&self) -> Vec<UnitStats> {
        self.units.lock().await.iter().map(|u| u.stats.clone()).collect()
    }

    async fn probe(&self, unit: &Arc<dyn ManagedUnit>) -> HealthReport {
        match tokio::time::timeout(self.config.probe_timeout, unit.probe()).await {
            Ok(report) => report,
            Err(_) => HealthReport::unhealthy(format!(
                "probe timed out after {:?}",
                self.config.probe_timeout
            )),
        }
    }

    /// One polling round over every unit, in registration order
    pub async fn tick(&self) {
        let mut units = self.units.lock().await;
        let now = Instant::now();

        for index in 0..units.len() {
            let unit = units[index].unit.clone();
            let report = self.probe(&unit).await;
            if let Some(degradation) = &self.degradation {
                degradation.apply_capabilities(&report.capabilities);
            }

            let state = &mut units[index];
            if report.healthy {
                if !state.stats.healthy {
                    info!(unit = %state.stats.name, "💚 Unit healthy again");
                }
                state.stats.healthy = true;
                state.stats.consecutive_failures = 0;
                state.stats.restarts_since_healthy = 0;
                state.restart_at = None;
                continue;
            }

            state.stats.healthy = false;
            state.stats.consecutive_failures += 1;
            debug!(
                unit = %state.stats.name,
                failures = state.stats.consecutive_failures,
                detail = ?report.detail,
                "Probe failed"
            );
            if state.stats.consecutive_failures < self.config.failure_threshold {
                continue;
            }

            match state.restart_at {
                None => {
                    let delay = self.config.restart_delay(state.stats.restarts_since_healthy);
                    warn!(
                        unit = %state.stats.name,
                        failures = state.stats.consecutive_failures,
                        ?delay,
                        "Scheduling restart"
                    );
                    state.restart_at = Some(now + delay);
                }
                Some(at) if now >= at => {
                    let escalate =
                        state.stats.restarts_since_healthy >= self.config.max_direct_restarts;
                    if escalate {
                        state.stats.escalations += 1;
                        let dependencies = unit.dependencies();
                        warn!(
                            unit = %state.stats.name,
                            restarts = state.stats.restarts_since_healthy,
                            ?dependencies,
                            "Direct restarts not helping, restarting dependencies"
                        );
                        self.restart_dependencies(&mut units, &dependencies).await;
                    }

                    let state = &mut units[index];
                    match unit.restart().await {
                        Ok(()) => info!(unit = %state.stats.name, "🔄 Unit restarted"),
                        Err(e) => error!(unit = %state.stats.name, error = %e, "Restart failed"),
                    }
                    state.stats.restarts += 1;
                    state.stats.restarts_since_healthy += 1;
                    state.stats.consecutive_failures = 0;
                    state.restart_at = None;
                }
                Some(_) => {}
            }
        }
    }

    async fn restart_dependencies(&self, units: &mut [UnitState], dependencies: &[String]) {
        for dependency in dependencies {
            let Some(dep) = units.iter_mut().find(|u| &u.stats.name == dependency) else {
                warn!(dependency = %dependency, "Dependency is not supervised, skipping");
                continue;
            };
            match dep.unit.restart().await {
                Ok(()) => info!(unit = %dependency, "🔄 Dependency restarted"),
                Err(e) => error!(unit = %dependency, error = %e, "Dependency restart failed"),
            }
            dep.stats.dependency_restarts += 1;
        }
    }

    /// Poll until `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.poll_interval, "Supervisor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Supervisor stopped");
    }
}
