//! The seam to whatever actually executes a trade.
//!
//! Idempotency of `execute` is the strategy's responsibility: a request can
//! be delivered again after a crash between execution and ack.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use types::ExecutionRequest;

/// What a successful execution reports back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub detail: String,
}

impl ExecutionOutcome {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    /// Worth retrying (RPC timeout, nonce race, ...)
    #[error("transient strategy failure: {0}")]
    Transient(String),

    /// Retrying cannot help; the request is dead-lettered as terminal
    #[error("terminal strategy failure: {0}")]
    Terminal(String),
}

impl StrategyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrategyError::Transient(_))
    }
}

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, StrategyError>;
}

/// Accepts every request without touching a chain
#[derive(Debug, Default)]
pub struct DryRunStrategy;

#[async_trait]
impl ExecutionStrategy for DryRunStrategy {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, StrategyError> {
        let opportunity = &request.opportunity;
        info!(
            id = %opportunity.id,
            pair = %opportunity.pair_key,
            amount_in = %opportunity.amount_in,
            expected_profit = %opportunity.expected_profit,
            "🧪 Dry-run execution"
        );
        Ok(ExecutionOutcome::new("dry-run"))
    }
}
