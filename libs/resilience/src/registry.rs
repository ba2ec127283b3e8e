//! Process-wide lookup of breakers by protected-operation name

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, created with the registry default on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Like [`get_or_create`](Self::get_or_create); `config` only applies if
    /// the breaker does not exist yet
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return existing.clone();
        }
        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = name, "Registered circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Stats for every breaker, sorted by name
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Names of breakers currently rejecting calls
    pub fn open_breakers(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|s| !s.state.is_closed())
            .map(|s| s.name)
            .collect()
    }
}
