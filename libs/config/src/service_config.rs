//! Service Configuration Module
//!
//! Loads [`ServiceConfig`] from TOML with an environment-specific overlay and
//! `OPPFLOW__` environment variable overrides.

use crate::defaults;
use crate::logging::LoggingConfig;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use resilience::{CircuitBreakerConfig, DeadLetterConfig, RetryPolicy, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/oppflow.toml";
const ENV_PREFIX: &str = "OPPFLOW";
const ENV_SEPARATOR: &str = "__";

/// Main service configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub instance: InstanceSettings,
    pub logging: LoggingConfig,
    pub broker: BrokerSettings,
    pub leader: LeaderSettings,
    pub coordinator: CoordinatorSettings,
    pub execution: ExecutionSettings,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub dead_letter: DeadLetterSettings,
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceSettings {
    /// Stable instance id; generated at startup when absent
    pub id: Option<String>,
    pub health_port: u16,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            id: None,
            health_port: defaults::instance::HEALTH_PORT,
        }
    }
}

/// Where streams and the leader lease live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// Process-local; nothing is shared between processes
    #[default]
    Memory,
    /// Redis streams and a Redis-held lease, shared by every instance
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub backend: BrokerBackend,
    /// Connection URL for the redis backend
    pub url: String,
    pub stream_max_len: usize,
    pub block_timeout_ms: u64,
    pub read_batch: usize,
    pub claim_min_idle_ms: u64,
    pub claim_batch: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            url: defaults::broker::URL.to_string(),
            stream_max_len: defaults::broker::STREAM_MAX_LEN,
            block_timeout_ms: defaults::broker::BLOCK_TIMEOUT_MS,
            read_batch: defaults::broker::READ_BATCH,
            claim_min_idle_ms: defaults::broker::CLAIM_MIN_IDLE_MS,
            claim_batch: defaults::broker::CLAIM_BATCH,
        }
    }
}

impl BrokerSettings {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn claim_min_idle(&self) -> Duration {
        Duration::from_millis(self.claim_min_idle_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LeaderSettings {
    pub lease_key: String,
    pub lease_ttl_ms: u64,
    pub renewal_interval_ms: u64,
}

impl Default for LeaderSettings {
    fn default() -> Self {
        Self {
            lease_key: defaults::leader::LEASE_KEY.to_string(),
            lease_ttl_ms: defaults::leader::LEASE_TTL_MS,
            renewal_interval_ms: defaults::leader::RENEWAL_INTERVAL_MS,
        }
    }
}

impl LeaderSettings {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub dedup_window_ms: u64,
    pub dedup_max_entries: usize,
    pub dedup_sweep_interval_ms: u64,
    /// Circuit breaker guarding appends to the execution stream
    pub forward_breaker: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            dedup_window_ms: defaults::coordinator::DEDUP_WINDOW_MS,
            dedup_max_entries: defaults::coordinator::DEDUP_MAX_ENTRIES,
            dedup_sweep_interval_ms: defaults::coordinator::DEDUP_SWEEP_INTERVAL_MS,
            forward_breaker: defaults::coordinator::FORWARD_BREAKER.to_string(),
        }
    }
}

impl CoordinatorSettings {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn dedup_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub drain_timeout_ms: u64,
    pub max_opportunity_age_ms: u64,
    /// Pair keys this instance can route; empty accepts every pair
    pub known_pairs: Vec<String>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::execution::QUEUE_CAPACITY,
            worker_count: defaults::execution::WORKER_COUNT,
            drain_timeout_ms: defaults::execution::DRAIN_TIMEOUT_MS,
            max_opportunity_age_ms: defaults::execution::MAX_OPPORTUNITY_AGE_MS,
            known_pairs: Vec::new(),
        }
    }
}

impl ExecutionSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::breaker::FAILURE_THRESHOLD,
            recovery_timeout_ms: defaults::breaker::RECOVERY_TIMEOUT_MS,
        }
    }
}

impl BreakerSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: defaults::retry::MAX_ATTEMPTS,
            base_delay_ms: defaults::retry::BASE_DELAY_MS,
            max_delay_ms: defaults::retry::MAX_DELAY_MS,
            multiplier: defaults::retry::MULTIPLIER,
            jitter: defaults::retry::JITTER,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeadLetterSettings {
    pub max_entries: usize,
    pub max_retries: u32,
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            max_entries: defaults::dead_letter::MAX_ENTRIES,
            max_retries: defaults::dead_letter::MAX_RETRIES,
            ttl_ms: defaults::dead_letter::TTL_MS,
            sweep_interval_ms: defaults::dead_letter::SWEEP_INTERVAL_MS,
        }
    }
}

impl DeadLetterSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
    pub fn queue_config(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            max_entries: self.max_entries,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub poll_interval_ms: u64,
    pub failure_threshold: u32,
    pub restart_base_delay_ms: u64,
    pub restart_max_delay_ms: u64,
    pub restart_multiplier: f64,
    pub max_direct_restarts: u32,
    pub probe_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::supervisor::POLL_INTERVAL_MS,
            failure_threshold: defaults::supervisor::FAILURE_THRESHOLD,
            restart_base_delay_ms: defaults::supervisor::RESTART_BASE_DELAY_MS,
            restart_max_delay_ms: defaults::supervisor::RESTART_MAX_DELAY_MS,
            restart_multiplier: defaults::supervisor::RESTART_MULTIPLIER,
            max_direct_restarts: defaults::supervisor::MAX_DIRECT_RESTARTS,
            probe_timeout_ms: defaults::supervisor::PROBE_TIMEOUT_MS,
        }
    }
}

impl SupervisorSettings {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            failure_threshold: self.failure_threshold,
            restart_base_delay: Duration::from_millis(self.restart_base_delay_ms),
            restart_max_delay: Duration::from_millis(self.restart_max_delay_ms),
            restart_multiplier: self.restart_multiplier,
            max_direct_restarts: self.max_direct_restarts,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from files with environment overrides.
    ///
    /// An explicit `base_path` must exist; the default path is optional so a
    /// service can start on defaults alone.
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let (base, required) = match base_path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let mut builder = Config::builder().add_source(File::from(base.as_path()).required(required));

        if let Some(env) = environment {
            let env_file = base
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("environments")
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Parse a configuration held in memory, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.leader.renewal_interval_ms >= self.leader.lease_ttl_ms {
            bail!(
                "leader.renewal_interval_ms ({}) must be below leader.lease_ttl_ms ({})",
                self.leader.renewal_interval_ms,
                self.leader.lease_ttl_ms
            );
        }
        if self.leader.renewal_interval_ms == 0 {
            bail!("leader.renewal_interval_ms must be non-zero");
        }
        if self.execution.queue_capacity == 0 {
            bail!("execution.queue_capacity must be non-zero");
        }
        if self.execution.worker_count == 0 {
            bail!("execution.worker_count must be non-zero");
        }
        if self.broker.read_batch == 0 || self.broker.stream_max_len == 0 {
            bail!("broker.read_batch and broker.stream_max_len must be non-zero");
        }
        if self.coordinator.dedup_max_entries == 0 {
            bail!("coordinator.dedup_max_entries must be non-zero");
        }
        if self.breaker.failure_threshold == 0 {
            bail!("breaker.failure_threshold must be non-zero");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            bail!("retry.jitter must be within [0, 1], got {}", self.retry.jitter);
        }
        if self.retry.multiplier < 1.0 || self.supervisor.restart_multiplier < 1.0 {
            bail!("backoff multipliers must be >= 1.0");
        }
        if self.dead_letter.max_entries == 0 {
            bail!("dead_letter.max_entries must be non-zero");
        }
        if self.broker.backend == BrokerBackend::Redis && self.broker.url.trim().is_empty() {
            bail!("broker.url is required for the redis backend");
        }
        Ok(())
    }
}

/// Load, then validate, the configuration for `environment`
pub fn load_config(path: Option<&Path>, environment: Option<&str>) -> Result<ServiceConfig> {
    let config = ServiceConfig::load(path, environment)?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
