//! Scriptable strategies for consumer tests.

use crate::strategy::{ExecutionOutcome, ExecutionStrategy, StrategyError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use types::ExecutionRequest;

/// Blocks every call until the test releases it
#[derive(Debug)]
pub struct BlockingStrategy {
    gate: Semaphore,
    started: AtomicUsize,
    completed: Mutex<Vec<String>>,
}

impl Default for BlockingStrategy {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            completed: Mutex::new(Vec::new()),
        }
    }
}

impl BlockingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `calls` blocked (or future) calls complete
    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    /// Calls that entered `execute`
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Ids of calls that completed, in completion order
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().clone()
    }
}

#[async_trait]
impl ExecutionStrategy for BlockingStrategy {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, StrategyError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(StrategyError::Terminal("gate closed".into())),
        }
        self.completed.lock().push(request.id().to_string());
        Ok(ExecutionOutcome::new("released"))
    }
}

/// Fails a fixed number of calls, then succeeds (or always fails terminally)
#[derive(Debug)]
pub struct FlakyStrategy {
    failures_left: AtomicU32,
    terminal: bool,
    calls: AtomicU32,
}

impl FlakyStrategy {
    pub fn transient(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            terminal: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn terminal() -> Self {
        Self {
            failures_left: AtomicU32::new(0),
            terminal: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionStrategy for FlakyStrategy {
    async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutcome, StrategyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.terminal {
            return Err(StrategyError::Terminal("route no longer exists".into()));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            Err(StrategyError::Transient(format!("rpc timeout on call {call}")))
        } else {
            Ok(ExecutionOutcome::new(format!("filled on call {call}")))
        }
    }
}
