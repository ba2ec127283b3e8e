//! Boundary checks for routed requests.
//!
//! [`validate`] is the schema check: a failure is a malformed message and
//! goes to the dead-letter queue as terminal. [`BusinessRules::check`] runs
//! on a well-formed request: a failure is a [`Rejection`], which is acked,
//! reported and counted but is not an error.

use service_config::ExecutionSettings;
use std::collections::HashSet;
use thiserror::Error;
use types::{ExecutionRequest, FieldMap, Opportunity, Validation};

/// Every field a routed request may carry
pub const REQUEST_FIELDS: [&str; 10] = [
    Opportunity::ID,
    Opportunity::PAIR_KEY,
    Opportunity::SOURCE_PARTITION,
    Opportunity::AMOUNT_IN,
    Opportunity::EXPECTED_PROFIT,
    Opportunity::PROFIT_PERCENTAGE,
    Opportunity::GAS_ESTIMATE,
    Opportunity::CREATED_AT,
    ExecutionRequest::ROUTED_AT,
    ExecutionRequest::ROUTED_BY,
];

/// Schema-validate a routed request.
///
/// Amounts and `profitPercentage` must not be negative; `-0` is zero.
pub fn validate(fields: &FieldMap) -> Validation<ExecutionRequest> {
    ExecutionRequest::validate_fields(fields)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("opportunity is {age_ms}ms old, limit is {max_age_ms}ms")]
    Stale { age_ms: u64, max_age_ms: u64 },

    #[error("unknown pair '{0}'")]
    UnknownPair(String),

    #[error("amountIn is zero")]
    ZeroAmount,

    #[error("expectedProfit is zero")]
    NoProfit,
}

impl Rejection {
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::Stale { .. } => "stale",
            Rejection::UnknownPair(_) => "unknown_pair",
            Rejection::ZeroAmount => "zero_amount",
            Rejection::NoProfit => "no_profit",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusinessRules {
    /// Zero disables the age check
    pub max_age_ms: u64,
    /// Empty accepts every pair
    pub known_pairs: HashSet<String>,
}

impl From<&ExecutionSettings> for BusinessRules {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            max_age_ms: settings.max_opportunity_age_ms,
            known_pairs: settings.known_pairs.iter().cloned().collect(),
        }
    }
}

impl BusinessRules {
    pub fn check(&self, request: &ExecutionRequest, now_ms: u64) -> Result<(), Rejection> {
        let opportunity = &request.opportunity;
        if opportunity.amount_in == 0 {
            return Err(Rejection::ZeroAmount);
        }
        if opportunity.expected_profit == 0 {
            return Err(Rejection::NoProfit);
        }
        if !self.known_pairs.is_empty() && !self.known_pairs.contains(&opportunity.pair_key) {
            return Err(Rejection::UnknownPair(opportunity.pair_key.clone()));
        }
        let age_ms = opportunity.age_ms(now_ms);
        if self.max_age_ms > 0 && age_ms > self.max_age_ms {
            return Err(Rejection::Stale {
                age_ms,
                max_age_ms: self.max_age_ms,
            });
        }
        Ok(())
    }
}
