//! The coordinator's three stages, each an independent read loop:
//!
//! ```text
//! stream:opportunities ──[intake, every instance]──▶ stream:coordinator-handoff
//!                                                          │
//!                                          [forward, leader only]
//!                                                          ▼
//!                                             stream:execution-requests
//!                                                          │
//!                                  [warm-up, every instance: records ids]
//! ```

mod forward;
mod intake;
mod warmup;

pub use forward::ForwardStage;
pub use intake::IntakeStage;
pub use warmup::WarmupStage;

use crate::error::CoordinatorError;
use crate::stats::CoordinatorStats;
use resilience::{DeadLetterQueue, RetryPolicy};
use service_config::{BrokerSettings, DeadLetterSettings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{BrokerError, StartPolicy, StreamBroker};
use tokio::sync::watch;
use tracing::{info, warn};
use types::{DeadLetterEntry, FieldMap, InstanceId, SequenceId, StreamMessage};

/// Dead-letter `operation` names the coordinator produces
pub mod operations {
    /// Undecodable opportunity; terminal
    pub const INTAKE: &str = "intake";
    /// Append to the hand-off stream failed
    pub const HANDOFF: &str = "handoff";
    /// Append to the execution stream failed or the breaker was open
    pub const FORWARD: &str = "forward";
}

#[derive(Debug, Clone)]
pub struct ReadSettings {
    pub batch: usize,
    pub block: Duration,
    pub claim_batch: usize,
}

impl From<&BrokerSettings> for ReadSettings {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            batch: settings.read_batch,
            block: settings.block_timeout(),
            claim_batch: settings.claim_batch,
        }
    }
}

/// Retry budget and TTL stamped on entries the stages dead-letter
#[derive(Debug, Clone)]
pub struct ParkingPolicy {
    pub max_retries: u32,
    pub ttl_ms: u64,
}

impl From<&DeadLetterSettings> for ParkingPolicy {
    fn from(settings: &DeadLetterSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            ttl_ms: settings.ttl_ms,
        }
    }
}

/// What every stage shares
#[derive(Clone)]
pub struct StageContext {
    pub broker: Arc<dyn StreamBroker>,
    pub instance: InstanceId,
    pub reads: ReadSettings,
    pub retry: RetryPolicy,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub parking: ParkingPolicy,
    pub stats: Arc<CoordinatorStats>,
}

impl StageContext {
    pub(crate) fn dead_letter(
        &self,
        id: &str,
        operation: &str,
        payload: FieldMap,
        error: impl Into<String>,
    ) -> DeadLetterEntry {
        DeadLetterEntry::new(id, operation, payload, error)
            .with_max_retries(self.parking.max_retries)
            .with_ttl_ms(self.parking.ttl_ms)
    }

    pub(crate) async fn park(&self, entry: DeadLetterEntry) {
        CoordinatorStats::incr(&self.stats.dead_lettered);
        self.dead_letters.enqueue(entry).await;
    }

    /// Ack one entry; a failed ack only means it will be delivered again
    pub(crate) async fn ack(&self, stream: &str, group: &str, id: SequenceId) {
        if let Err(e) = self.broker.ack(stream, group, &[id]).await {
            warn!(stream, group, %id, error = %e, "Ack failed, entry stays pending");
        }
    }

    pub(crate) async fn read(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Vec<StreamMessage>, CoordinatorError> {
        let result = self
            .broker
            .read_group(stream, group, self.instance.as_str(), self.reads.batch, self.reads.block)
            .await;
        self.stats.record_read(result.is_ok());
        match result {
            Err(BrokerError::NoSuchGroup { .. }) => {
                self.recreate_group(stream, group).await?;
                Ok(Vec::new())
            }
            result => Ok(result?),
        }
    }

    /// Put back a group the broker lost (flushed, or deleted by an operator).
    ///
    /// The group restarts at the stream's tail; entries appended while it was
    /// missing are not delivered.
    pub(crate) async fn recreate_group(&self, stream: &str, group: &str) -> Result<(), CoordinatorError> {
        warn!(stream, group, "Consumer group missing, re-creating it");
        self.broker
            .create_group(stream, group, StartPolicy::NewOnly)
            .await?;
        Ok(())
    }
}

/// Id to file an undecodable message under
pub(crate) fn message_key(message: &StreamMessage) -> String {
    message
        .fields
        .get("id")
        .filter(|id| !id.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| format!("{}#{}", message.stream, message.id))
}

/// Drive `step` until `shutdown` flips to `true`.
///
/// A failing step is logged and retried after `error_backoff`; an in-flight
/// step is abandoned on shutdown, leaving its unacked entries pending.
pub(crate) async fn run_stage<F, Fut>(
    name: &'static str,
    error_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut step: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, CoordinatorError>>,
{
    info!(stage = name, "Stage started");
    while !*shutdown.borrow() {
        tokio::select! {
            result = step() => {
                if let Err(e) = result {
                    warn!(stage = name, error = %e, retryable = e.is_retryable(), "Stage step failed");
                    tokio::select! {
                        _ = tokio::time::sleep(error_backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(stage = name, "Stage stopped");
}
