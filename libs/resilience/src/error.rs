use std::time::Duration;
use stream_broker::BrokerError;

/// Returned instead of running a call while a breaker rejects traffic
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit breaker '{name}' is open (retry in {retry_after:?})")]
pub struct BreakerOpen {
    pub name: String,
    /// Time until the breaker will admit a trial call; zero while a trial is in flight
    pub retry_after: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(BreakerOpen),

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Open(_) => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("Unit '{unit}' failed to restart: {reason}")]
    RestartFailed { unit: String, reason: String },

    #[error("Unknown managed unit '{0}'")]
    UnknownUnit(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl ResilienceError {
    pub fn restart_failed(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        ResilienceError::RestartFailed {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::RestartFailed { .. } => true,
            ResilienceError::UnknownUnit(_) => false,
            ResilienceError::Broker(e) => e.is_retryable(),
        }
    }
}
