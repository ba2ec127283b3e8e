//! Graceful degradation.
//!
//! A capability is a named feature backed by some dependency. When the
//! dependency is unhealthy the capability is switched off, and callers take
//! the documented fallback instead of calling the degraded path.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Capability {
    available: bool,
    fallback: String,
    reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityStatus {
    pub name: String,
    pub available: bool,
    /// What callers do instead while unavailable
    pub fallback: String,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct DegradationManager {
    capabilities: RwLock<BTreeMap<String, Capability>>,
}

impl DegradationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a capability (available) and its fallback behaviour
    pub fn register(&self, name: &str, fallback: &str) {
        self.capabilities
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Capability {
                available: true,
                fallback: fallback.to_string(),
                reason: None,
            });
    }

    /// Switch `name` off; returns `true` if it was available
    pub fn degrade(&self, name: &str, reason: &str) -> bool {
        let mut caps = self.capabilities.write();
        let cap = caps.entry(name.to_string()).or_insert_with(|| Capability {
            available: true,
            fallback: "none declared".to_string(),
            reason: None,
        });
        let changed = cap.available;
        cap.available = false;
        cap.reason = Some(reason.to_string());
        if changed {
            warn!(capability = name, reason, fallback = %cap.fallback, "⚠️ Capability degraded");
        }
        changed
    }

    /// Switch `name` back on; returns `true` if it was degraded
    pub fn restore(&self, name: &str) -> bool {
        let mut caps = self.capabilities.write();
        match caps.get_mut(name) {
            Some(cap) if !cap.available => {
                cap.available = true;
                cap.reason = None;
                info!(capability = name, "Capability restored");
                true
            }
            _ => false,
        }
    }

    /// Unknown capabilities count as available
    pub fn is_available(&self, name: &str) -> bool {
        self.capabilities
            .read()
            .get(name)
            .map_or(true, |cap| cap.available)
    }

    /// Apply capability flags reported by a health probe
    pub fn apply_capabilities(&self, flags: &BTreeMap<String, bool>) {
        for (name, &available) in flags {
            if available {
                self.restore(name);
            } else {
                self.degrade(name, "reported unavailable by health probe");
            }
        }
    }

    /// Availability flags, as published on a health endpoint
    pub fn flags(&self) -> BTreeMap<String, bool> {
        self.capabilities
            .read()
            .iter()
            .map(|(name, cap)| (name.clone(), cap.available))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<CapabilityStatus> {
        self.capabilities
            .read()
            .iter()
            .map(|(name, cap)| CapabilityStatus {
                name: name.clone(),
                available: cap.available,
                fallback: cap.fallback.clone(),
                reason: cap.reason.clone(),
            })
            .collect()
    }

    /// Run `primary` if `name` is available, otherwise `fallback`
    pub async fn run_or_fallback<T, P, PF, F, FF>(&self, name: &str, primary: P, fallback: F) -> T
    where
        P: FnOnce() -> PF,
        PF: Future<Output = T>,
        F: FnOnce() -> FF,
        FF: Future<Output = T>,
    {
        if self.is_available(name) {
            primary().await
        } else {
            fallback().await
        }
    }
}
