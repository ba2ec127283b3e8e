use types::Term;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("No such consumer group '{group}' on stream '{stream}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Broker closed")]
    Closed,

    /// The backend answered with an error that retrying will not fix
    #[error("Broker backend error: {0}")]
    Backend(String),
}

impl BrokerError {
    /// Transient infrastructure failure worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        BrokerError::Unavailable(msg.into())
    }

    pub fn no_such_group(stream: &str, group: &str) -> Self {
        BrokerError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease '{key}' term {term} is not held by '{holder}'")]
    NotHolder {
        key: String,
        holder: String,
        term: Term,
    },
}

impl LeaseError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LeaseError::Unavailable(_))
    }
}
