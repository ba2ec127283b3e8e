//! Routed execution requests and their reported outcomes

use crate::fields::{self, field_map, FieldMap};
use crate::{FieldError, InstanceId, Opportunity, OpportunityId, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An opportunity stamped by the coordinator that forwarded it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub opportunity: Opportunity,
    pub routed_at_ms: u64,
    pub routed_by: InstanceId,
}

impl ExecutionRequest {
    pub const ROUTED_AT: &'static str = "routedAt";
    pub const ROUTED_BY: &'static str = "routedBy";

    pub fn new(opportunity: Opportunity, routed_by: InstanceId, routed_at_ms: u64) -> Self {
        Self {
            opportunity,
            routed_at_ms,
            routed_by,
        }
    }

    pub fn id(&self) -> &OpportunityId {
        &self.opportunity.id
    }

    /// Opportunity fields plus the routing stamp
    pub fn to_fields(&self) -> FieldMap {
        let mut map = self.opportunity.to_fields();
        map.insert(Self::ROUTED_AT.to_string(), self.routed_at_ms.to_string());
        map.insert(Self::ROUTED_BY.to_string(), self.routed_by.to_string());
        map
    }

    pub fn from_fields(map: &FieldMap) -> Result<Self, FieldError> {
        Ok(Self {
            opportunity: Opportunity::from_fields(map)?,
            routed_at_ms: fields::required_u64(map, Self::ROUTED_AT)?,
            routed_by: InstanceId::new(fields::required(map, Self::ROUTED_BY)?),
        })
    }

    pub fn validate_fields(map: &FieldMap) -> Validation<Self> {
        Self::from_fields(map).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    Rejected,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "rejected" => Ok(ExecutionStatus::Rejected),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Entry on `stream:execution-results`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: OpportunityId,
    pub status: ExecutionStatus,
    pub detail: String,
    pub executed_by: InstanceId,
    pub completed_at_ms: u64,
}

impl ExecutionReport {
    pub const FIELDS: [&'static str; 5] = ["id", "status", "detail", "executedBy", "completedAt"];

    pub fn to_fields(&self) -> FieldMap {
        field_map([
            ("id", self.id.to_string()),
            ("status", self.status.to_string()),
            ("detail", self.detail.clone()),
            ("executedBy", self.executed_by.to_string()),
            ("completedAt", self.completed_at_ms.to_string()),
        ])
    }

    pub fn from_fields(map: &FieldMap) -> Result<Self, FieldError> {
        let status = fields::required(map, "status")?;
        Ok(Self {
            id: OpportunityId::new(fields::required(map, "id")?),
            status: status
                .parse()
                .map_err(|e: String| FieldError::malformed("status", e))?,
            detail: map.get("detail").cloned().unwrap_or_default(),
            executed_by: InstanceId::new(fields::required(map, "executedBy")?),
            completed_at_ms: fields::required_u64(map, "completedAt")?,
        })
    }
}
