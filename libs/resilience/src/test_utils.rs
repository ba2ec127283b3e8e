//! Test doubles for resilience consumers

use crate::dead_letter::{DeadLetterHandler, ReplayOutcome};
use crate::error::ResilienceError;
use crate::supervisor::{HealthReport, ManagedUnit};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use types::DeadLetterEntry;

/// Replay handler that answers from a script, then repeats a default
#[derive(Debug)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<ReplayOutcome>>,
    default: ReplayOutcome,
    replayed: Mutex<Vec<DeadLetterEntry>>,
}

impl ScriptedHandler {
    pub fn always(outcome: ReplayOutcome) -> Self {
        Self::new(Vec::new(), outcome)
    }

    pub fn new(script: Vec<ReplayOutcome>, default: ReplayOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default,
            replayed: Mutex::new(Vec::new()),
        }
    }

    pub fn replay_count(&self) -> usize {
        self.replayed.lock().len()
    }

    pub fn replayed_ids(&self) -> Vec<String> {
        self.replayed
            .lock()
            .iter()
            .map(|e| e.operation_id.to_string())
            .collect()
    }
}

#[async_trait]
impl DeadLetterHandler for ScriptedHandler {
    async fn replay(&self, entry: &DeadLetterEntry) -> ReplayOutcome {
        self.replayed.lock().push(entry.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Managed unit whose health is flipped by the test and which records restarts
#[derive(Debug)]
pub struct SwitchableUnit {
    name: String,
    dependencies: Vec<String>,
    healthy: AtomicBool,
    /// Restarting makes the unit healthy again
    heal_on_restart: AtomicBool,
    restarts: AtomicU32,
    log: Arc<Mutex<Vec<String>>>,
}

impl SwitchableUnit {
    pub fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            dependencies: Vec::new(),
            healthy: AtomicBool::new(true),
            heal_on_restart: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            log,
        }
    }

    pub fn depends_on(mut self, dependency: &str) -> Self {
        self.dependencies.push(dependency.to_string());
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn heal_on_restart(&self, heal: bool) {
        self.heal_on_restart.store(heal, Ordering::SeqCst);
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagedUnit for SwitchableUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn probe(&self) -> HealthReport {
        if self.healthy.load(Ordering::SeqCst) {
            HealthReport::healthy()
        } else {
            HealthReport::unhealthy(format!("{} switched off", self.name))
        }
    }

    async fn restart(&self) -> Result<(), ResilienceError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(self.name.clone());
        if self.heal_on_restart.load(Ordering::SeqCst) {
            self.healthy.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}
