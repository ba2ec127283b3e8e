use stream_broker::BrokerError;
use thiserror::Error;

/// Failures the consumer's read loop surfaces.
///
/// Per-message outcomes (invalid schema, rule rejections, strategy failures)
/// are settled inside the consumer and never become an `ExecutionError`.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Work queue closed")]
    QueueClosed,
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Broker(e) => e.is_retryable(),
            ExecutionError::QueueClosed => false,
        }
    }
}
