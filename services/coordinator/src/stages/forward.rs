use super::{message_key, operations, StageContext};
use crate::dedup::{DedupCache, DedupOutcome};
use crate::error::CoordinatorError;
use crate::leader::LeaderElector;
use crate::service::FORWARDING_CAPABILITY;
use crate::stats::CoordinatorStats;
use resilience::{retry, BreakerError, CircuitBreaker, DegradationManager, RetryError};
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{BrokerError, StartPolicy};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::fields::allow_listed;
use types::{
    current_time_ms, streams, DeadLetterPriority, ExecutionRequest, Opportunity, SequenceId,
    StreamMessage, Term, Validation,
};

/// Why a forward did not reach the execution stream
#[derive(Debug, thiserror::Error)]
enum ForwardFailure {
    #[error("leadership term {0} ended before the append")]
    Deposed(Term),

    #[error("execution forwarding degraded")]
    Degraded,

    #[error("{0}")]
    Breaker(BreakerError<BrokerError>),
}

impl ForwardFailure {
    fn is_retryable(&self) -> bool {
        matches!(self, ForwardFailure::Breaker(BreakerError::Inner(e)) if e.is_retryable())
    }
}

/// Whether a batch may go on after one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Done,
    /// Leadership ended; the entry was left pending for the next leader
    Deposed,
}

/// Leader-only stage: reads the hand-off stream and appends execution
/// requests, behind the forwarding circuit breaker.
///
/// Every append runs under the term the batch started with. The term is
/// checked again before each attempt, so a leader whose lease lapsed during
/// a retry backoff leaves the entry pending instead of appending it after
/// its successor already has.
///
/// On promotion, and again every `claim_min_idle` while leading, it claims
/// hand-off entries another instance read but never acked.
pub struct ForwardStage {
    ctx: StageContext,
    dedup: Arc<DedupCache>,
    breaker: Arc<CircuitBreaker>,
    leader: Arc<LeaderElector>,
    degradation: Arc<DegradationManager>,
    claim_min_idle: Duration,
}

impl ForwardStage {
    pub fn new(
        ctx: StageContext,
        dedup: Arc<DedupCache>,
        breaker: Arc<CircuitBreaker>,
        leader: Arc<LeaderElector>,
        degradation: Arc<DegradationManager>,
        claim_min_idle: Duration,
    ) -> Self {
        Self {
            ctx,
            dedup,
            breaker,
            leader,
            degradation,
            claim_min_idle,
        }
    }

    pub async fn prepare(&self) -> Result<(), CoordinatorError> {
        self.ctx
            .broker
            .create_group(
                streams::COORDINATOR_HANDOFF,
                streams::COORDINATOR_FORWARDERS,
                StartPolicy::Beginning,
            )
            .await?;
        Ok(())
    }

    /// Forward one batch of new hand-off entries; a no-op unless leading
    pub async fn process_batch(&self) -> Result<usize, CoordinatorError> {
        let Some(term) = self.leader.current_term() else {
            return Ok(0);
        };
        let messages = self
            .ctx
            .read(streams::COORDINATOR_HANDOFF, streams::COORDINATOR_FORWARDERS)
            .await?;
        let count = messages.len();
        self.forward_all(messages, term).await;
        Ok(count)
    }

    /// Take over hand-off entries left pending by a previous leader
    pub async fn claim_orphans(&self) -> Result<usize, CoordinatorError> {
        let mut claimed = 0;
        while let Some(term) = self.leader.current_term() {
            let messages = self
                .ctx
                .broker
                .claim_stale(
                    streams::COORDINATOR_HANDOFF,
                    streams::COORDINATOR_FORWARDERS,
                    self.ctx.instance.as_str(),
                    self.claim_min_idle,
                    self.ctx.reads.claim_batch,
                )
                .await
                .inspect_err(|_| self.ctx.stats.record_read(false))?;
            if messages.is_empty() {
                break;
            }
            claimed += messages.len();
            self.ctx
                .stats
                .claimed
                .fetch_add(messages.len() as u64, std::sync::atomic::Ordering::Relaxed);
            if self.forward_all(messages, term).await == Settled::Deposed {
                break;
            }
        }
        if claimed > 0 {
            info!(instance = %self.ctx.instance, claimed, "Claimed orphaned hand-off entries");
        }
        Ok(claimed)
    }

    async fn forward_all(&self, messages: Vec<StreamMessage>, term: Term) -> Settled {
        for message in messages {
            if self.forward(&message, term).await == Settled::Deposed {
                // The next leader claims whatever is left pending.
                info!(instance = %self.ctx.instance, %term, "Lost leadership mid-batch, leaving entries pending");
                return Settled::Deposed;
            }
        }
        Settled::Done
    }

    async fn forward(&self, message: &StreamMessage, term: Term) -> Settled {
        if self.leader.current_term() != Some(term) {
            return Settled::Deposed;
        }

        let ctx = &self.ctx;
        let opportunity = match Opportunity::validate_fields(&message.fields) {
            Validation::Valid(opportunity) => opportunity,
            Validation::Invalid { reason, .. } => {
                CoordinatorStats::incr(&ctx.stats.invalid);
                let payload = allow_listed(&message.fields, &Opportunity::FIELDS);
                let entry = ctx.dead_letter(&message_key(message), operations::INTAKE, payload, reason);
                ctx.park(entry.terminal()).await;
                self.ack(message).await;
                return Settled::Done;
            }
        };

        let now = current_time_ms();
        if self.dedup.check_and_insert(&opportunity.id, now) == DedupOutcome::Duplicate {
            CoordinatorStats::incr(&ctx.stats.forward_duplicates);
            debug!(id = %opportunity.id, "Already forwarded within the window");
            self.ack(message).await;
            return Settled::Done;
        }

        let request = ExecutionRequest::new(opportunity, ctx.instance.clone(), now);
        let started = Instant::now();
        let forwarded = self
            .degradation
            .run_or_fallback(
                FORWARDING_CAPABILITY,
                || self.append(&request, term),
                || async { Err(RetryError::Terminal(ForwardFailure::Degraded)) },
            )
            .await;

        let opportunity = &request.opportunity;
        let failure = match forwarded {
            Ok(id) => {
                ctx.stats
                    .record_forward(&opportunity.pair_key, opportunity.age_ms(current_time_ms()));
                debug!(
                    id = %opportunity.id,
                    request = %id,
                    elapsed = ?started.elapsed(),
                    "➡️ Forwarded to execution"
                );
                self.ack(message).await;
                return Settled::Done;
            }
            Err(RetryError::Terminal(ForwardFailure::Deposed(term))) => {
                CoordinatorStats::incr(&ctx.stats.deposed_forwards);
                self.dedup.forget(&opportunity.id);
                warn!(id = %opportunity.id, %term, "Leadership lapsed before forwarding, leaving entry pending");
                return Settled::Deposed;
            }
            Err(RetryError::Terminal(ForwardFailure::Breaker(BreakerError::Open(open)))) => {
                CoordinatorStats::incr(&ctx.stats.breaker_rejections);
                self.degradation
                    .degrade(FORWARDING_CAPABILITY, "forwarding breaker open");
                warn!(id = %opportunity.id, breaker = %open.name, "Forwarding breaker open, parking");
                open.to_string()
            }
            Err(RetryError::Terminal(ForwardFailure::Degraded)) => {
                CoordinatorStats::incr(&ctx.stats.degraded_parks);
                debug!(id = %opportunity.id, "Forwarding degraded, parking without an attempt");
                ForwardFailure::Degraded.to_string()
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let error = format!("forward failed after {attempts} attempts: {last}");
                warn!(id = %opportunity.id, %error, "Forward failed, parking");
                error
            }
            Err(RetryError::Terminal(e)) => {
                let error = format!("forward failed: {e}");
                warn!(id = %opportunity.id, %error, "Forward failed, parking");
                error
            }
        };

        // Never forwarded, so a later hand-off of the same id must not count as a duplicate.
        self.dedup.forget(&opportunity.id);
        let entry = ctx
            .dead_letter(opportunity.id.as_str(), operations::FORWARD, opportunity.to_fields(), failure)
            .with_priority(DeadLetterPriority::High);
        ctx.park(entry).await;
        self.ack(message).await;
        Settled::Done
    }

    /// Append `request` with retries, each attempt gated on `term` still being held
    async fn append(
        &self,
        request: &ExecutionRequest,
        term: Term,
    ) -> Result<SequenceId, RetryError<ForwardFailure>> {
        let broker = &self.ctx.broker;
        let breaker = self.breaker.as_ref();
        let leader = self.leader.as_ref();
        let fields = request.to_fields();
        retry(&self.ctx.retry, ForwardFailure::is_retryable, |_| {
            let fields = fields.clone();
            async move {
                if leader.current_term() != Some(term) {
                    return Err(ForwardFailure::Deposed(term));
                }
                breaker
                    .call(move || broker.append(streams::EXECUTION_REQUESTS, fields))
                    .await
                    .map_err(ForwardFailure::Breaker)
            }
        })
        .await
    }

    async fn ack(&self, message: &StreamMessage) {
        self.ctx
            .ack(streams::COORDINATOR_HANDOFF, streams::COORDINATOR_FORWARDERS, message.id)
            .await;
    }

    /// Forward while leading; idle (without reading) while following
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut leadership = self.leader.subscribe();
        let backoff = self.ctx.reads.block;
        let mut last_claim: Option<Instant> = None;

        info!(stage = "forward", "Stage started");
        while !*shutdown.borrow() {
            if !self.leader.is_leader() {
                last_claim = None;
                tokio::select! {
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    // Local lease expiry does not publish a state change.
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }

            let claim_due = last_claim.map_or(true, |at| at.elapsed() >= self.claim_min_idle);
            if claim_due {
                last_claim = Some(Instant::now());
                if let Err(e) = self.claim_orphans().await {
                    warn!(error = %e, "Claiming orphaned hand-off entries failed");
                }
            }

            tokio::select! {
                result = self.process_batch() => {
                    if let Err(e) = result {
                        warn!(stage = "forward", error = %e, "Stage step failed");
                        tokio::time::sleep(backoff).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(stage = "forward", "Stage stopped");
    }
}
