//! Opportunity fixtures

use types::{current_time_ms, FieldMap, Opportunity};

/// Opportunity as a producer would publish it
#[derive(Debug, Clone)]
pub struct OpportunityFixture {
    pub id: String,
    pub pair_key: String,
    pub source_partition: String,
    pub amount_in: u128,
    pub expected_profit: u128,
    pub profit_percentage: f64,
    pub gas_estimate: u64,
}

impl OpportunityFixture {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pair_key: "WETH/USDC".to_string(),
            source_partition: "partition-0".to_string(),
            amount_in: 2_000_000,
            expected_profit: 4_200,
            profit_percentage: 0.21,
            gas_estimate: 190_000,
        }
    }

    pub fn with_pair(mut self, pair_key: &str) -> Self {
        self.pair_key = pair_key.to_string();
        self
    }

    /// Same opportunity as seen by another detector partition
    pub fn from_partition(mut self, partition: &str) -> Self {
        self.source_partition = partition.to_string();
        self
    }

    pub fn with_profit(mut self, profit: u128) -> Self {
        self.expected_profit = profit;
        self
    }

    pub fn build(&self) -> Opportunity {
        Opportunity::builder(self.id.as_str(), self.pair_key.as_str())
            .source_partition(self.source_partition.as_str())
            .amount_in(self.amount_in)
            .expected_profit(self.expected_profit)
            .profit_percentage(self.profit_percentage)
            .gas_estimate(self.gas_estimate)
            .created_at_ms(current_time_ms())
            .build()
    }

    pub fn fields(&self) -> FieldMap {
        self.build().to_fields()
    }

    /// `count` distinct opportunities `{prefix}-0 .. {prefix}-{count-1}`
    pub fn batch(prefix: &str, count: usize) -> Vec<Self> {
        (0..count)
            .map(|i| Self::new(format!("{prefix}-{i}")))
            .collect()
    }
}

/// Fields no producer should ever emit: no id and a non-numeric amount
pub fn malformed_opportunity() -> FieldMap {
    let mut fields = OpportunityFixture::new("ignored").fields();
    fields.remove(Opportunity::ID);
    fields.insert(Opportunity::AMOUNT_IN.to_string(), "lots".to_string());
    fields
}
