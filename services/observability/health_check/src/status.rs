use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Errors kept on a health document
const MAX_ERRORS: usize = 10;

/// Service health status levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Healthy and ready for traffic
    Healthy,
    /// Starting up, not ready for traffic
    Starting,
    /// Running with one or more capabilities switched to their fallback
    Degraded,
    /// Not operational
    Unhealthy,
}

/// Health document published by a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub status: HealthStatus,
    pub startup_time: SystemTime,
    pub last_update: SystemTime,
    /// Named capabilities and whether they are currently available
    pub capabilities: BTreeMap<String, bool>,
    /// Service-specific status (breaker snapshots, dead-letter depth, leadership)
    pub details: BTreeMap<String, serde_json::Value>,
    /// Most recent error messages, oldest first
    pub errors: Vec<String>,
}

impl ServiceHealth {
    pub fn new(service_name: &str) -> Self {
        let now = SystemTime::now();
        Self {
            service_name: service_name.to_string(),
            status: HealthStatus::Starting,
            startup_time: now,
            last_update: now,
            capabilities: BTreeMap::new(),
            details: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn set_status(&mut self, status: HealthStatus) {
        self.status = status;
        self.last_update = SystemTime::now();
    }

    pub fn set_capability(&mut self, name: &str, available: bool) {
        self.capabilities.insert(name.to_string(), available);
        self.last_update = SystemTime::now();
    }

    /// Replace all capability flags at once
    pub fn set_capabilities(&mut self, flags: BTreeMap<String, bool>) {
        self.capabilities = flags;
        self.last_update = SystemTime::now();
    }

    /// Record a detail; values that fail to serialize are stored as their error text
    pub fn add_detail<T: Serialize>(&mut self, key: &str, value: &T) {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|e| serde_json::Value::String(format!("unserializable: {e}")));
        self.details.insert(key.to_string(), value);
        self.last_update = SystemTime::now();
    }

    pub fn add_error(&mut self, error: &str) {
        self.errors.push(error.to_string());
        if self.errors.len() > MAX_ERRORS {
            self.errors.remove(0);
        }
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    /// Degraded services still take traffic
    pub fn is_ready(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.status, HealthStatus::Unhealthy)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.startup_time.elapsed().unwrap_or_default().as_secs()
    }
}
