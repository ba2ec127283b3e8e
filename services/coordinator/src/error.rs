use stream_broker::{BrokerError, LeaseError};
use thiserror::Error;

/// Failures a coordinator stage surfaces to its run loop.
///
/// Per-message problems (invalid payloads, duplicates, an open breaker) are
/// resolved inside the stage and never become a `CoordinatorError`.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Lease store error: {0}")]
    Lease(#[from] LeaseError),
}

impl CoordinatorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::Broker(e) => e.is_retryable(),
            CoordinatorError::Lease(e) => e.is_retryable(),
        }
    }
}
