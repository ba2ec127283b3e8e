//! # Opportunity
//!
//! A detected, not yet executed trade published by an external producer.
//! Amounts are integers in the token's smallest unit; `expected_profit` is
//! always absolute and `profit_percentage` travels beside it, never in its
//! place.

use crate::fields::{self, field_map, FieldMap};
use crate::{FieldError, OpportunityId, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: OpportunityId,
    pub pair_key: String,
    pub source_partition: String,
    pub amount_in: u128,
    pub expected_profit: u128,
    pub profit_percentage: f64,
    pub gas_estimate: u64,
    #[serde(rename = "createdAt")]
    pub created_at_ms: u64,
}

impl Opportunity {
    pub const ID: &'static str = "id";
    pub const PAIR_KEY: &'static str = "pairKey";
    pub const SOURCE_PARTITION: &'static str = "sourcePartition";
    pub const AMOUNT_IN: &'static str = "amountIn";
    pub const EXPECTED_PROFIT: &'static str = "expectedProfit";
    pub const PROFIT_PERCENTAGE: &'static str = "profitPercentage";
    pub const GAS_ESTIMATE: &'static str = "gasEstimate";
    pub const CREATED_AT: &'static str = "createdAt";

    /// The complete wire schema; nothing outside this list is read or written
    pub const FIELDS: [&'static str; 8] = [
        Self::ID,
        Self::PAIR_KEY,
        Self::SOURCE_PARTITION,
        Self::AMOUNT_IN,
        Self::EXPECTED_PROFIT,
        Self::PROFIT_PERCENTAGE,
        Self::GAS_ESTIMATE,
        Self::CREATED_AT,
    ];

    pub fn builder(id: impl Into<OpportunityId>, pair_key: impl Into<String>) -> OpportunityBuilder {
        OpportunityBuilder {
            inner: Opportunity {
                id: id.into(),
                pair_key: pair_key.into(),
                source_partition: "default".to_string(),
                amount_in: 0,
                expected_profit: 0,
                profit_percentage: 0.0,
                gas_estimate: 0,
                created_at_ms: 0,
            },
        }
    }

    pub fn to_fields(&self) -> FieldMap {
        field_map([
            (Self::ID, self.id.to_string()),
            (Self::PAIR_KEY, self.pair_key.clone()),
            (Self::SOURCE_PARTITION, self.source_partition.clone()),
            (Self::AMOUNT_IN, self.amount_in.to_string()),
            (Self::EXPECTED_PROFIT, self.expected_profit.to_string()),
            (Self::PROFIT_PERCENTAGE, self.profit_percentage.to_string()),
            (Self::GAS_ESTIMATE, self.gas_estimate.to_string()),
            (Self::CREATED_AT, self.created_at_ms.to_string()),
        ])
    }

    /// Decode the allow-listed fields, ignoring any others present
    pub fn from_fields(map: &FieldMap) -> Result<Self, FieldError> {
        Ok(Self {
            id: OpportunityId::new(fields::required(map, Self::ID)?),
            pair_key: fields::required(map, Self::PAIR_KEY)?.to_string(),
            source_partition: fields::required(map, Self::SOURCE_PARTITION)?.to_string(),
            amount_in: fields::required_amount(map, Self::AMOUNT_IN)?,
            expected_profit: fields::required_amount(map, Self::EXPECTED_PROFIT)?,
            profit_percentage: fields::required_non_negative_f64(map, Self::PROFIT_PERCENTAGE)?,
            gas_estimate: fields::required_u64(map, Self::GAS_ESTIMATE)?,
            created_at_ms: fields::required_u64(map, Self::CREATED_AT)?,
        })
    }

    pub fn validate_fields(map: &FieldMap) -> Validation<Self> {
        Self::from_fields(map).into()
    }

    /// Milliseconds since creation, zero if the clock is behind the producer
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

/// Fluent constructor for producers and tests
#[derive(Debug, Clone)]
pub struct OpportunityBuilder {
    inner: Opportunity,
}

impl OpportunityBuilder {
    pub fn source_partition(mut self, partition: impl Into<String>) -> Self {
        self.inner.source_partition = partition.into();
        self
    }

    pub fn amount_in(mut self, amount: u128) -> Self {
        self.inner.amount_in = amount;
        self
    }

    pub fn expected_profit(mut self, profit: u128) -> Self {
        self.inner.expected_profit = profit;
        self
    }

    pub fn profit_percentage(mut self, percentage: f64) -> Self {
        self.inner.profit_percentage = percentage;
        self
    }

    pub fn gas_estimate(mut self, gas: u64) -> Self {
        self.inner.gas_estimate = gas;
        self
    }

    pub fn created_at_ms(mut self, created_at_ms: u64) -> Self {
        self.inner.created_at_ms = created_at_ms;
        self
    }

    pub fn build(self) -> Opportunity {
        self.inner
    }
}
