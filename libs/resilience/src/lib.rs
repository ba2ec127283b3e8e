//! # Resilience
//!
//! Building blocks every network-facing call in the pipeline goes through:
//!
//! - [`CircuitBreaker`] / [`CircuitBreakerRegistry`]: fail fast per named operation
//! - [`retry`] with [`RetryPolicy`]: exponential backoff with jitter, retryable vs terminal
//! - [`DeadLetterQueue`]: priority- and TTL-bounded holding area with a replay sweep
//! - [`DegradationManager`]: named capabilities with documented fallbacks
//! - [`Supervisor`]: probes units and restarts them with escalating delay
//!
//! ```rust
//! use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     "execution-forwarding",
//!     CircuitBreakerConfig { failure_threshold: 1, recovery_timeout: Duration::from_secs(30) },
//! );
//! breaker.try_acquire().unwrap().failure();
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(breaker.try_acquire().is_err());
//! ```

pub mod circuit_breaker;
pub mod dead_letter;
pub mod degradation;
pub mod error;
pub mod registry;
pub mod retry;
pub mod supervisor;
pub mod test_utils;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use dead_letter::{
    DeadLetterConfig, DeadLetterHandler, DeadLetterQueue, DeadLetterStats, ReplayOutcome,
    SweepReport, TerminalFailure, TerminalReason, OWNER_FIELD,
};
pub use degradation::{CapabilityStatus, DegradationManager};
pub use error::{BreakerError, BreakerOpen, ResilienceError};
pub use registry::CircuitBreakerRegistry;
pub use retry::{retry, RetryError, RetryPolicy};
pub use supervisor::{
    HealthProbe, HealthReport, ManagedUnit, ProbedUnit, RestartFn, Supervisor, SupervisorConfig,
    TaskFactory, TaskUnit, UnitStats,
};
