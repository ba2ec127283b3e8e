use super::{message_key, operations, run_stage, StageContext};
use crate::dedup::{DedupCache, DedupOutcome};
use crate::error::CoordinatorError;
use crate::stats::CoordinatorStats;
use resilience::{retry, RetryError};
use std::sync::Arc;
use stream_broker::{BrokerError, StartPolicy};
use tokio::sync::watch;
use tracing::{debug, warn};
use types::fields::allow_listed;
use types::{current_time_ms, streams, Opportunity, StreamMessage, Validation};

/// Reads `stream:opportunities` in the shared coordinator group, drops
/// duplicates, and hands each new opportunity to the leader's stream.
///
/// The source entry is acked only after the hand-off append succeeded, or
/// after the opportunity was parked in the dead-letter queue.
pub struct IntakeStage {
    ctx: StageContext,
    dedup: Arc<DedupCache>,
}

impl IntakeStage {
    pub fn new(ctx: StageContext, dedup: Arc<DedupCache>) -> Self {
        Self { ctx, dedup }
    }

    pub async fn prepare(&self) -> Result<(), CoordinatorError> {
        self.ctx
            .broker
            .create_group(streams::OPPORTUNITIES, streams::COORDINATOR_GROUP, StartPolicy::Beginning)
            .await?;
        Ok(())
    }

    /// Read and route one batch; returns how many entries were read
    pub async fn process_batch(&self) -> Result<usize, CoordinatorError> {
        let messages = self
            .ctx
            .read(streams::OPPORTUNITIES, streams::COORDINATOR_GROUP)
            .await?;
        for message in &messages {
            self.handle(message).await;
        }
        Ok(messages.len())
    }

    async fn handle(&self, message: &StreamMessage) {
        let ctx = &self.ctx;
        CoordinatorStats::incr(&ctx.stats.received);

        let opportunity = match Opportunity::validate_fields(&message.fields) {
            Validation::Valid(opportunity) => opportunity,
            Validation::Invalid { reason, .. } => {
                CoordinatorStats::incr(&ctx.stats.invalid);
                let key = message_key(message);
                warn!(id = %key, %reason, "Invalid opportunity, dead-lettering");
                let payload = allow_listed(&message.fields, &Opportunity::FIELDS);
                ctx.park(ctx.dead_letter(&key, operations::INTAKE, payload, reason).terminal())
                    .await;
                self.ack(message).await;
                return;
            }
        };

        if self.dedup.check_and_insert(&opportunity.id, current_time_ms()) == DedupOutcome::Duplicate {
            CoordinatorStats::incr(&ctx.stats.intake_duplicates);
            debug!(id = %opportunity.id, "Duplicate opportunity dropped at intake");
            self.ack(message).await;
            return;
        }

        let broker = &ctx.broker;
        let fields = opportunity.to_fields();
        let appended = retry(&ctx.retry, BrokerError::is_retryable, |_| {
            broker.append(streams::COORDINATOR_HANDOFF, fields.clone())
        })
        .await;

        match appended {
            Ok(id) => {
                CoordinatorStats::incr(&ctx.stats.handed_off);
                debug!(id = %opportunity.id, handoff = %id, "Handed off");
            }
            Err(e) => {
                let error = match e {
                    RetryError::Exhausted { attempts, last } => {
                        format!("hand-off failed after {attempts} attempts: {last}")
                    }
                    RetryError::Terminal(e) => format!("hand-off failed: {e}"),
                };
                warn!(id = %opportunity.id, %error, "Hand-off failed, dead-lettering");
                ctx.park(ctx.dead_letter(opportunity.id.as_str(), operations::HANDOFF, fields, error))
                    .await;
            }
        }
        self.ack(message).await;
    }

    async fn ack(&self, message: &StreamMessage) {
        self.ctx
            .ack(streams::OPPORTUNITIES, streams::COORDINATOR_GROUP, message.id)
            .await;
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let backoff = self.ctx.reads.block;
        run_stage("intake", backoff, shutdown, || self.process_batch()).await;
    }
}
