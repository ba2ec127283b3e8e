//! # Dead-Letter Entry
//!
//! A failed operation parked for replay or inspection. `operation` names the
//! kind of work (e.g. `"forward"`, `"execute"`) so a sweep can route the
//! entry to the handler that knows how to retry it; `terminal` marks entries
//! that must never be retried, such as validation failures.
//!
//! On `stream:dead-letter` the payload is carried as one JSON-encoded field
//! so the entry stays a flat map.

use crate::fields::{self, field_map, FieldMap};
use crate::{FieldError, OpportunityId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl DeadLetterPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterPriority::Low => "low",
            DeadLetterPriority::Normal => "normal",
            DeadLetterPriority::High => "high",
            DeadLetterPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for DeadLetterPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(DeadLetterPriority::Low),
            "normal" => Ok(DeadLetterPriority::Normal),
            "high" => Ok(DeadLetterPriority::High),
            "critical" => Ok(DeadLetterPriority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub operation_id: OpportunityId,
    pub operation: String,
    pub payload: FieldMap,
    pub last_error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: DeadLetterPriority,
    #[serde(rename = "enqueuedAt")]
    pub enqueued_at_ms: u64,
    #[serde(rename = "ttl")]
    pub ttl_ms: u64,
    pub terminal: bool,
}

impl DeadLetterEntry {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_TTL_MS: u64 = 300_000;

    pub const FIELDS: [&'static str; 10] = [
        "operationId",
        "operation",
        "payload",
        "lastError",
        "retryCount",
        "maxRetries",
        "priority",
        "enqueuedAt",
        "ttl",
        "terminal",
    ];

    pub fn new(
        operation_id: impl Into<OpportunityId>,
        operation: impl Into<String>,
        payload: FieldMap,
        last_error: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation: operation.into(),
            payload,
            last_error: last_error.into(),
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            priority: DeadLetterPriority::Normal,
            enqueued_at_ms: crate::current_time_ms(),
            ttl_ms: Self::DEFAULT_TTL_MS,
            terminal: false,
        }
    }

    pub fn with_priority(mut self, priority: DeadLetterPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.retry_count = self.retry_count.min(max_retries);
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Mark as never retryable; the sweep only ages it out
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn can_retry(&self) -> bool {
        !self.terminal && self.retry_count < self.max_retries
    }

    /// Count one replay attempt, never past `max_retries`
    pub fn record_attempt(&mut self, error: impl Into<String>) {
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.last_error = error.into();
    }

    pub fn to_fields(&self) -> FieldMap {
        // BTreeMap<String, String> always serializes.
        let payload = serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string());
        field_map([
            ("operationId", self.operation_id.to_string()),
            ("operation", self.operation.clone()),
            ("payload", payload),
            ("lastError", self.last_error.clone()),
            ("retryCount", self.retry_count.to_string()),
            ("maxRetries", self.max_retries.to_string()),
            ("priority", self.priority.to_string()),
            ("enqueuedAt", self.enqueued_at_ms.to_string()),
            ("ttl", self.ttl_ms.to_string()),
            ("terminal", self.terminal.to_string()),
        ])
    }

    pub fn from_fields(map: &FieldMap) -> Result<Self, FieldError> {
        let payload = serde_json::from_str::<FieldMap>(fields::required(map, "payload")?)
            .map_err(|e| FieldError::malformed("payload", e.to_string()))?;
        let priority = fields::required(map, "priority")?
            .parse()
            .map_err(|e: String| FieldError::malformed("priority", e))?;
        let max_retries = fields::required_u32(map, "maxRetries")?;
        let retry_count = fields::required_u32(map, "retryCount")?;
        if retry_count > max_retries {
            return Err(FieldError::malformed(
                "retryCount",
                format!("{} exceeds maxRetries {}", retry_count, max_retries),
            ));
        }

        Ok(Self {
            operation_id: OpportunityId::new(fields::required(map, "operationId")?),
            operation: fields::required(map, "operation")?.to_string(),
            payload,
            last_error: map.get("lastError").cloned().unwrap_or_default(),
            retry_count,
            max_retries,
            priority,
            enqueued_at_ms: fields::required_u64(map, "enqueuedAt")?,
            ttl_ms: fields::required_u64(map, "ttl")?,
            terminal: fields::required_bool(map, "terminal")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> DeadLetterEntry {
        let payload = field_map([("id", "opp-1"), ("amountIn", "100")]);
        DeadLetterEntry::new("opp-1", "forward", payload, "broker unavailable")
            .with_priority(DeadLetterPriority::High)
            .with_max_retries(2)
            .with_ttl_ms(1_000)
    }

    #[test]
    fn retry_count_is_capped() {
        let mut e = entry();
        assert!(e.can_retry());
        e.record_attempt("again");
        e.record_attempt("again");
        e.record_attempt("again");
        assert_eq!(e.retry_count, 2);
        assert!(!e.can_retry());
        assert_eq!(e.last_error, "again");
    }

    #[test]
    fn terminal_entries_never_retry() {
        assert!(!entry().terminal().can_retry());
    }

    #[test]
    fn payload_travels_as_json_field() {
        let e = entry();
        let map = e.to_fields();
        assert!(map["payload"].starts_with('{'));
        assert_eq!(DeadLetterEntry::from_fields(&map), Ok(e));
    }

    #[test]
    fn inconsistent_retry_count_is_malformed() {
        let mut map = entry().to_fields();
        map.insert("retryCount".into(), "9".into());
        assert!(matches!(
            DeadLetterEntry::from_fields(&map),
            Err(FieldError::Malformed { field: "retryCount", .. })
        ));
    }

    #[test]
    fn priorities_order_low_to_critical() {
        assert!(DeadLetterPriority::Critical > DeadLetterPriority::High);
        assert!(DeadLetterPriority::Low < DeadLetterPriority::Normal);
    }

    #[test]
    fn json_uses_wire_names() {
        let json = serde_json::to_value(entry()).unwrap();
        assert_eq!(json["operationId"], "opp-1");
        assert_eq!(json["ttl"], 1_000);
        assert_eq!(json["priority"], "high");
    }
}
