use super::{run_stage, StageContext};
use crate::dedup::DedupCache;
use crate::error::CoordinatorError;
use crate::stats::CoordinatorStats;
use std::sync::Arc;
use stream_broker::StartPolicy;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use types::{current_time_ms, streams, ExecutionRequest, SequenceId};

/// Tails `stream:execution-requests` in a per-instance group and records every
/// forwarded id in the forward dedup cache, so an instance promoted to leader
/// already knows what the previous leader forwarded within the window.
///
/// The group is deleted on shutdown; a restart rejoins at the stream's tail.
pub struct WarmupStage {
    ctx: StageContext,
    dedup: Arc<DedupCache>,
    group: String,
}

impl WarmupStage {
    pub fn new(ctx: StageContext, dedup: Arc<DedupCache>) -> Self {
        let group = streams::warmup_group(ctx.instance.as_str());
        Self { ctx, dedup, group }
    }

    pub async fn prepare(&self) -> Result<(), CoordinatorError> {
        self.ctx
            .broker
            .create_group(streams::EXECUTION_REQUESTS, &self.group, StartPolicy::NewOnly)
            .await?;
        Ok(())
    }

    pub async fn process_batch(&self) -> Result<usize, CoordinatorError> {
        let messages = self.ctx.read(streams::EXECUTION_REQUESTS, &self.group).await?;
        if messages.is_empty() {
            return Ok(0);
        }

        let now = current_time_ms();
        for message in &messages {
            match ExecutionRequest::from_fields(&message.fields) {
                Ok(request) => {
                    self.dedup.record(request.id(), now);
                    CoordinatorStats::incr(&self.ctx.stats.warmed);
                }
                Err(e) => debug!(id = %message.id, error = %e, "Skipping undecodable execution request"),
            }
        }

        let ids: Vec<SequenceId> = messages.iter().map(|m| m.id).collect();
        self.ctx
            .broker
            .ack(streams::EXECUTION_REQUESTS, &self.group, &ids)
            .await?;
        Ok(messages.len())
    }

    /// Drop this instance's group, so groups of past instances do not pile up
    pub async fn teardown(&self) {
        match self
            .ctx
            .broker
            .delete_group(streams::EXECUTION_REQUESTS, &self.group)
            .await
        {
            Ok(true) => info!(group = %self.group, "Warm-up group removed"),
            Ok(false) => {}
            Err(e) => warn!(group = %self.group, error = %e, "Failed to remove warm-up group"),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let backoff = self.ctx.reads.block;
        run_stage("warmup", backoff, shutdown, || self.process_batch()).await;
    }
}
