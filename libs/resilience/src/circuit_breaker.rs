//! Circuit Breaker
//!
//! Fails fast while a protected operation keeps failing, then probes for
//! recovery with a single trial call.
//!
//! ```text
//! CLOSED ──failure_threshold──> OPEN ──recovery_timeout──> HALF_OPEN
//!   ▲                            ▲                            │
//!   │                            └────── trial failure ───────┤
//!   └──────────────────────────── trial success ──────────────┘
//! ```
//!
//! Callers take a [`CallPermit`] before the call and report the outcome on
//! it. In HALF_OPEN exactly one permit is handed out; if that permit is
//! dropped without a report the trial counts as failed, so the breaker can
//! never wedge half-open.
//!
//! All state lives behind one `parking_lot::Mutex` per breaker, so the
//! transition and the failure counter always move together.

use crate::error::{BreakerError, BreakerOpen};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Calls fail fast without reaching the operation
    Open,
    /// One trial call decides between CLOSED and OPEN
    HalfOpen,
}

impl CircuitState {
    pub fn is_closed(&self) -> bool {
        matches!(self, CircuitState::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open)
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self, CircuitState::HalfOpen)
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// How long to stay OPEN before admitting a trial call
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a fast-recovery configuration for low-latency systems
    pub fn fast_recovery() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(5),
        }
    }

    /// Create a conservative configuration for critical systems
    pub fn conservative() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Statistics for circuit breaker monitoring
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub calls_rejected: u64,
    pub time_in_state_ms: u64,
}

impl CircuitBreakerStats {
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_calls as f64
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped for every trial permit; only the latest one decides HALF_OPEN
    trial_generation: u64,
    state_changed_at: Instant,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    calls_rejected: u64,
}

impl BreakerState {
    fn issue_trial(&mut self) -> u64 {
        self.trial_in_flight = true;
        self.trial_generation += 1;
        self.total_calls += 1;
        self.trial_generation
    }

    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            trial_generation: 0,
            state_changed_at: Instant::now(),
            total_calls: 0,
            total_failures: 0,
            total_successes: 0,
            calls_rejected: 0,
        }
    }

    fn transition_to(&mut self, name: &str, new_state: CircuitState) {
        if self.state == new_state {
            return;
        }
        let now = Instant::now();
        match new_state {
            CircuitState::Open => warn!(
                breaker = name,
                failures = self.consecutive_failures,
                "🔴 Circuit breaker state transition: {:?} -> {:?}",
                self.state,
                new_state
            ),
            _ => info!(
                breaker = name,
                "Circuit breaker state transition: {:?} -> {:?}", self.state, new_state
            ),
        }
        self.state = new_state;
        self.state_changed_at = now;

        match new_state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.trial_in_flight = false;
            }
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.trial_in_flight = false;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Named breaker guarding one protected operation
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn with_default_config(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to make one call.
    ///
    /// An OPEN breaker whose recovery timeout has elapsed moves to HALF_OPEN
    /// here and hands out the single trial permit.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, BreakerOpen> {
        let now = Instant::now();
        let mut s = self.state.lock();

        match s.state {
            CircuitState::Closed => {
                s.total_calls += 1;
                Ok(CallPermit::new(self, None))
            }
            CircuitState::Open => {
                let opened_at = s.opened_at.unwrap_or(s.state_changed_at);
                let reopen_at = opened_at + self.config.recovery_timeout;
                if now >= reopen_at {
                    s.transition_to(&self.name, CircuitState::HalfOpen);
                    Ok(CallPermit::new(self, Some(s.issue_trial())))
                } else {
                    s.calls_rejected += 1;
                    Err(BreakerOpen {
                        name: self.name.clone(),
                        retry_after: reopen_at - now,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    s.calls_rejected += 1;
                    Err(BreakerOpen {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    Ok(CallPermit::new(self, Some(s.issue_trial())))
                }
            }
        }
    }

    /// Whether a call made now would be admitted, without taking a permit
    pub fn is_call_permitted(&self) -> bool {
        let s = self.state.lock();
        match s.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !s.trial_in_flight,
            CircuitState::Open => s
                .opened_at
                .is_some_and(|at| Instant::now() >= at + self.config.recovery_timeout),
        }
    }

    /// Report a successful call made without a permit.
    ///
    /// Counts toward CLOSED bookkeeping only; while HALF_OPEN just the trial
    /// permit's outcome moves the breaker.
    pub fn record_success(&self) {
        self.on_outcome(true, None);
    }

    /// Report a failed call made without a permit; see [`Self::record_success`]
    pub fn record_failure(&self) {
        self.on_outcome(false, None);
    }

    fn on_outcome(&self, success: bool, trial: Option<u64>) {
        let mut s = self.state.lock();
        let trial = s.state.is_half_open()
            && s.trial_in_flight
            && trial == Some(s.trial_generation);
        if trial {
            s.trial_in_flight = false;
        }

        if success {
            s.total_successes += 1;
            match s.state {
                CircuitState::HalfOpen if trial => s.transition_to(&self.name, CircuitState::Closed),
                CircuitState::Closed => s.consecutive_failures = 0,
                _ => {}
            }
            return;
        }

        s.total_failures += 1;
        match s.state {
            CircuitState::HalfOpen if trial => {
                s.consecutive_failures += 1;
                s.transition_to(&self.name, CircuitState::Open);
            }
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold {
                    s.transition_to(&self.name, CircuitState::Open);
                }
            }
            // Late results from permits issued before the breaker opened
            _ => {}
        }
    }

    /// Run `op` under the breaker, counting any `Err` as a failure
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(BreakerError::Open)?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let s = self.state.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            total_calls: s.total_calls,
            total_failures: s.total_failures,
            total_successes: s.total_successes,
            calls_rejected: s.calls_rejected,
            time_in_state_ms: s.state_changed_at.elapsed().as_millis() as u64,
        }
    }

    /// Back to CLOSED with all counters cleared
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.transition_to(&self.name, CircuitState::Closed);
        // Permits issued before the reset must not match a later trial.
        let trial_generation = s.trial_generation;
        *s = BreakerState::new();
        s.trial_generation = trial_generation;
    }

    /// Open immediately, restarting the recovery timer
    pub fn force_open(&self) {
        let mut s = self.state.lock();
        s.transition_to(&self.name, CircuitState::Open);
        s.opened_at = Some(Instant::now());
    }
}

/// Admission to make one call through a [`CircuitBreaker`]
#[must_use = "report the call outcome with `success()` or `failure()`"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    /// Generation of the HALF_OPEN trial this permit carries
    trial: Option<u64>,
    reported: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: Option<u64>) -> Self {
        Self {
            breaker,
            trial,
            reported: false,
        }
    }

    /// Whether this is the HALF_OPEN trial call
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_outcome(true, self.trial);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_outcome(false, self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if let (false, Some(generation)) = (self.reported, self.trial) {
            warn!(breaker = %self.breaker.name, "Trial permit dropped without outcome, counting as failure");
            self.breaker.on_outcome(false, Some(generation));
        }
    }
}
