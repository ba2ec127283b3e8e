//! Pipeline-wide checks over what ended up on the streams

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use types::{ExecutionReport, ExecutionRequest, ExecutionStatus};

/// Collected view of the forwarded requests and execution results
#[derive(Debug, Default)]
pub struct PipelineValidator {
    routed: BTreeMap<String, Vec<String>>,
    outcomes: BTreeMap<String, Vec<ExecutionStatus>>,
}

impl PipelineValidator {
    pub fn new(forwarded: &[ExecutionRequest], results: &[ExecutionReport]) -> Self {
        let mut validator = Self::default();
        for request in forwarded {
            validator
                .routed
                .entry(request.id().to_string())
                .or_default()
                .push(request.routed_by.to_string());
        }
        for report in results {
            validator
                .outcomes
                .entry(report.id.to_string())
                .or_default()
                .push(report.status);
        }
        validator
    }

    pub fn forwarded_ids(&self) -> BTreeSet<String> {
        self.routed.keys().cloned().collect()
    }

    pub fn executed_ids(&self) -> BTreeSet<String> {
        self.outcomes.keys().cloned().collect()
    }

    /// Instances that routed at least one request
    pub fn routers(&self) -> BTreeSet<String> {
        self.routed.values().flatten().cloned().collect()
    }

    /// Every opportunity was routed once and produced exactly one result
    pub fn validate_exactly_once(&self) -> Result<()> {
        for (id, routers) in &self.routed {
            if routers.len() > 1 {
                bail!("{id} was forwarded {} times (by {:?})", routers.len(), routers);
            }
        }
        for (id, statuses) in &self.outcomes {
            if statuses.len() > 1 {
                bail!("{id} produced {} results: {:?}", statuses.len(), statuses);
            }
            if !self.routed.contains_key(id) {
                bail!("{id} has a result but was never forwarded");
            }
        }
        Ok(())
    }

    /// Each id in `expected` executed successfully
    pub fn validate_succeeded(&self, expected: &BTreeSet<String>) -> Result<()> {
        for id in expected {
            match self.outcomes.get(id).map(Vec::as_slice) {
                Some([ExecutionStatus::Succeeded]) => {}
                Some(other) => bail!("{id} ended with {other:?}"),
                None => bail!("{id} never produced a result"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::OpportunityFixture;
    use types::{current_time_ms, InstanceId};

    fn request(id: &str, by: &str) -> ExecutionRequest {
        ExecutionRequest::new(
            OpportunityFixture::new(id).build(),
            InstanceId::new(by),
            current_time_ms(),
        )
    }

    fn report(id: &str, status: ExecutionStatus) -> ExecutionReport {
        ExecutionReport {
            id: id.into(),
            status,
            detail: String::new(),
            executed_by: InstanceId::new("exec-a"),
            completed_at_ms: current_time_ms(),
        }
    }

    #[test]
    fn duplicate_forward_is_flagged() {
        let validator = PipelineValidator::new(
            &[request("opp-1", "coord-a"), request("opp-1", "coord-b")],
            &[],
        );
        assert!(validator.validate_exactly_once().is_err());
        assert_eq!(validator.routers().len(), 2);
    }

    #[test]
    fn result_without_forward_is_flagged() {
        let validator =
            PipelineValidator::new(&[], &[report("opp-9", ExecutionStatus::Succeeded)]);
        assert!(validator.validate_exactly_once().is_err());
    }

    #[test]
    fn clean_run_passes() {
        let validator = PipelineValidator::new(
            &[request("opp-1", "coord-a"), request("opp-2", "coord-a")],
            &[
                report("opp-1", ExecutionStatus::Succeeded),
                report("opp-2", ExecutionStatus::Succeeded),
            ],
        );
        validator.validate_exactly_once().unwrap();
        let expected: BTreeSet<String> = ["opp-1", "opp-2"].iter().map(|s| s.to_string()).collect();
        validator.validate_succeeded(&expected).unwrap();
        assert_eq!(validator.executed_ids(), expected);
    }
}
