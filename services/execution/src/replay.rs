use crate::consumer::operations;
use crate::stats::ExecutionStats;
use crate::strategy::ExecutionStrategy;
use async_trait::async_trait;
use resilience::{DeadLetterHandler, ReplayOutcome};
use std::sync::Arc;
use stream_broker::StreamBroker;
use tracing::{info, warn};
use types::{
    current_time_ms, streams, DeadLetterEntry, ExecutionReport, ExecutionRequest, ExecutionStatus,
    InstanceId,
};

/// Re-runs requests whose execution ran out of retries
pub struct ExecutionReplayHandler {
    broker: Arc<dyn StreamBroker>,
    strategy: Arc<dyn ExecutionStrategy>,
    instance: InstanceId,
    stats: Arc<ExecutionStats>,
}

impl ExecutionReplayHandler {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        strategy: Arc<dyn ExecutionStrategy>,
        instance: InstanceId,
        stats: Arc<ExecutionStats>,
    ) -> Self {
        Self {
            broker,
            strategy,
            instance,
            stats,
        }
    }
}

#[async_trait]
impl DeadLetterHandler for ExecutionReplayHandler {
    fn handles(&self, operation: &str) -> bool {
        operation == operations::EXECUTE
    }

    async fn replay(&self, entry: &DeadLetterEntry) -> ReplayOutcome {
        let request = match ExecutionRequest::from_fields(&entry.payload) {
            Ok(request) => request,
            Err(e) => return ReplayOutcome::Failed(e.to_string()),
        };

        match self.strategy.execute(&request).await {
            Ok(outcome) => {
                ExecutionStats::incr(&self.stats.executed);
                info!(id = %request.id(), detail = %outcome.detail, "✅ Executed on replay");
                let report = ExecutionReport {
                    id: request.id().clone(),
                    status: ExecutionStatus::Succeeded,
                    detail: outcome.detail,
                    executed_by: self.instance.clone(),
                    completed_at_ms: current_time_ms(),
                };
                // The entry is recovered either way; the report is informational here.
                if let Err(e) = self
                    .broker
                    .append(streams::EXECUTION_RESULTS, report.to_fields())
                    .await
                {
                    warn!(id = %request.id(), error = %e, "Publishing replayed result failed");
                }
                ReplayOutcome::Recovered
            }
            Err(e) => ReplayOutcome::Failed(e.to_string()),
        }
    }
}
