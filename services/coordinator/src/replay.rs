use crate::leader::LeaderElector;
use crate::service::FORWARDING_CAPABILITY;
use crate::stages::operations;
use crate::stats::CoordinatorStats;
use async_trait::async_trait;
use resilience::{BreakerError, CircuitBreaker, DeadLetterHandler, DegradationManager, ReplayOutcome};
use std::sync::Arc;
use stream_broker::StreamBroker;
use tracing::{debug, info};
use types::{current_time_ms, streams, DeadLetterEntry, ExecutionRequest, InstanceId, Opportunity};

/// Replays parked hand-offs and forwards.
///
/// Only the leader forwards. A follower holding a parked forward (it was
/// deposed after parking it) hands the opportunity back to the hand-off
/// stream, where the current leader picks it up. The leader defers, without
/// spending a retry, while the forwarding breaker would reject the call.
pub struct ForwardReplayHandler {
    broker: Arc<dyn StreamBroker>,
    breaker: Arc<CircuitBreaker>,
    leader: Arc<LeaderElector>,
    degradation: Arc<DegradationManager>,
    instance: InstanceId,
    stats: Arc<CoordinatorStats>,
}

impl ForwardReplayHandler {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        breaker: Arc<CircuitBreaker>,
        leader: Arc<LeaderElector>,
        degradation: Arc<DegradationManager>,
        instance: InstanceId,
        stats: Arc<CoordinatorStats>,
    ) -> Self {
        Self {
            broker,
            breaker,
            leader,
            degradation,
            instance,
            stats,
        }
    }

    async fn hand_off(&self, entry: &DeadLetterEntry) -> Result<(), String> {
        self.broker
            .append(streams::COORDINATOR_HANDOFF, entry.payload.clone())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn replay_handoff(&self, entry: &DeadLetterEntry) -> ReplayOutcome {
        match self.hand_off(entry).await {
            Ok(()) => ReplayOutcome::Recovered,
            Err(e) => ReplayOutcome::Failed(e),
        }
    }

    async fn replay_forward(&self, entry: &DeadLetterEntry) -> ReplayOutcome {
        if !self.leader.is_leader() {
            return match self.hand_off(entry).await {
                Ok(()) => {
                    CoordinatorStats::incr(&self.stats.handed_back);
                    info!(id = %entry.operation_id, "Handed parked forward back to the leader");
                    ReplayOutcome::Recovered
                }
                Err(e) => ReplayOutcome::Failed(e),
            };
        }
        if !self.breaker.is_call_permitted() {
            return ReplayOutcome::Deferred;
        }
        let opportunity = match Opportunity::from_fields(&entry.payload) {
            Ok(opportunity) => opportunity,
            Err(e) => return ReplayOutcome::Failed(e.to_string()),
        };

        let request = ExecutionRequest::new(opportunity, self.instance.clone(), current_time_ms());
        let fields = request.to_fields();
        match self
            .breaker
            .call(|| self.broker.append(streams::EXECUTION_REQUESTS, fields))
            .await
        {
            Ok(id) => {
                debug!(id = %entry.operation_id, request = %id, "Replayed forward");
                CoordinatorStats::incr(&self.stats.replayed);
                self.degradation.restore(FORWARDING_CAPABILITY);
                ReplayOutcome::Recovered
            }
            Err(BreakerError::Open(_)) => ReplayOutcome::Deferred,
            Err(BreakerError::Inner(e)) => ReplayOutcome::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl DeadLetterHandler for ForwardReplayHandler {
    fn handles(&self, operation: &str) -> bool {
        operation == operations::FORWARD || operation == operations::HANDOFF
    }

    async fn replay(&self, entry: &DeadLetterEntry) -> ReplayOutcome {
        match entry.operation.as_str() {
            operations::HANDOFF => self.replay_handoff(entry).await,
            operations::FORWARD => self.replay_forward(entry).await,
            _ => ReplayOutcome::Deferred,
        }
    }
}
