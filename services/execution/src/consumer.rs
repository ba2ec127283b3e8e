//! # Execution Consumer
//!
//! ```text
//! stream:execution-requests ──read (permit per message)──▶ validate ──▶ rules ──▶ [work queue]
//!                                                            │           │            │
//!                                                   DLQ (terminal)   results +    workers ──▶ strategy
//!                                                                      ack                      │
//!                                               results + ack, then the permit is released ◄───┘
//! ```
//!
//! Backpressure comes from the permit pool, not from the queue: a message
//! takes a permit before it is read and gives it back only after its ack.
//! With every permit out the read loop stops reading, and everything past
//! the group cursor stays in the stream until capacity frees up.
//!
//! Reads also stop while [`RESULTS_CAPABILITY`] is degraded: an outcome that
//! cannot be appended to the results stream would leave its request pending
//! anyway, so new requests wait in the stream until the results stream
//! answers again.

use crate::error::ExecutionError;
use crate::replay::ExecutionReplayHandler;
use crate::rules::{validate, BusinessRules, REQUEST_FIELDS};
use crate::stats::{ExecutionStats, ExecutionStatsSnapshot};
use crate::strategy::{ExecutionStrategy, StrategyError};
use health_check::{HealthStatus, SharedHealth};
use parking_lot::Mutex;
use resilience::{
    retry, DeadLetterQueue, DeadLetterStats, DegradationManager, RetryError, RetryPolicy,
};
use service_config::ServiceConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{BrokerError, StartPolicy, StreamBroker};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use types::fields::allow_listed;
use types::{
    current_time_ms, streams, DeadLetterEntry, ExecutionReport, ExecutionRequest, ExecutionStatus,
    InstanceId, SequenceId, StreamMessage, Validation,
};

/// Dead-letter `operation` names the consumer produces
pub mod operations {
    /// Malformed request; terminal
    pub const VALIDATE: &str = "validate";
    /// Strategy failed terminally or ran out of retries
    pub const EXECUTE: &str = "execute";
}

/// Consecutive failed reads before the service reports itself unhealthy
const UNHEALTHY_READ_FAILURES: u64 = 3;

/// Capability switched off while outcomes cannot be appended to the results stream
pub const RESULTS_CAPABILITY: &str = "results-publishing";

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub drain_timeout: Duration,
    pub read_batch: usize,
    pub block: Duration,
    pub claim_min_idle: Duration,
    pub claim_batch: usize,
    pub dead_letter_sweep_interval: Duration,
    pub dead_letter_max_retries: u32,
    pub dead_letter_ttl_ms: u64,
}

impl From<&ServiceConfig> for ConsumerSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            queue_capacity: config.execution.queue_capacity,
            worker_count: config.execution.worker_count,
            drain_timeout: config.execution.drain_timeout(),
            read_batch: config.broker.read_batch,
            block: config.broker.block_timeout(),
            claim_min_idle: config.broker.claim_min_idle(),
            claim_batch: config.broker.claim_batch,
            dead_letter_sweep_interval: config.dead_letter.sweep_interval(),
            dead_letter_max_retries: config.dead_letter.max_retries,
            dead_letter_ttl_ms: config.dead_letter.ttl_ms,
        }
    }
}

/// One admitted request on its way to a worker
struct WorkItem {
    message_id: SequenceId,
    request: ExecutionRequest,
    permit: OwnedSemaphorePermit,
}

pub struct ExecutionConsumer {
    broker: Arc<dyn StreamBroker>,
    strategy: Arc<dyn ExecutionStrategy>,
    instance: InstanceId,
    rules: BusinessRules,
    settings: ConsumerSettings,
    retry: RetryPolicy,
    dead_letters: Arc<DeadLetterQueue>,
    stats: Arc<ExecutionStats>,
    degradation: Arc<DegradationManager>,
    permits: Arc<Semaphore>,
    /// Entries admitted here and not yet acked
    in_flight_ids: Mutex<HashSet<SequenceId>>,
}

impl ExecutionConsumer {
    pub fn new(
        config: &ServiceConfig,
        instance: InstanceId,
        broker: Arc<dyn StreamBroker>,
        strategy: Arc<dyn ExecutionStrategy>,
    ) -> Self {
        let settings = ConsumerSettings::from(config);
        let degradation = Arc::new(DegradationManager::new());
        degradation.register(RESULTS_CAPABILITY, "stop reading new requests; unrecorded ones stay pending");
        Self {
            dead_letters: Arc::new(DeadLetterQueue::with_journal(
                config.dead_letter.queue_config(),
                broker.clone(),
                instance.as_str(),
            )),
            permits: Arc::new(Semaphore::new(settings.queue_capacity)),
            rules: BusinessRules::from(&config.execution),
            retry: config.retry.policy(),
            stats: Arc::new(ExecutionStats::new()),
            degradation,
            in_flight_ids: Mutex::new(HashSet::new()),
            broker,
            strategy,
            instance,
            settings,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Admitted requests not yet acked: queued, executing, or publishing
    pub fn in_flight(&self) -> usize {
        self.in_flight_ids.lock().len()
    }

    pub fn stats(&self) -> ExecutionStatsSnapshot {
        self.stats
            .snapshot(self.in_flight(), self.settings.queue_capacity)
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }

    pub fn replay_handler(&self) -> ExecutionReplayHandler {
        ExecutionReplayHandler::new(
            self.broker.clone(),
            self.strategy.clone(),
            self.instance.clone(),
            self.stats.clone(),
        )
    }

    /// Join the execution group (only requests routed after this are read)
    /// and take back the dead-letter entries this instance left parked
    pub async fn prepare(&self) -> Result<(), ExecutionError> {
        let created = self
            .broker
            .create_group(
                streams::EXECUTION_REQUESTS,
                streams::EXECUTION_GROUP,
                StartPolicy::NewOnly,
            )
            .await?;
        if created {
            info!(group = streams::EXECUTION_GROUP, "Created execution consumer group");
        }
        self.dead_letters.recover().await?;
        Ok(())
    }

    /// Consume until `shutdown` flips to `true`, then drain the workers.
    ///
    /// A broker that is down at startup is waited out: joining the group is
    /// retried with backoff, each failure counting as a failed read, so only
    /// shutdown or a non-retryable error ends the call. Reads stop at once
    /// on shutdown. Workers finish what is queued until `drain_timeout`;
    /// anything unacked after that stays pending and is redelivered to
    /// whichever consumer claims it.
    pub async fn run(
        self: Arc<Self>,
        health: Option<(SharedHealth, Duration)>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ExecutionError> {
        let mut background = Vec::new();
        if let Some((health, interval)) = health {
            background.push(tokio::spawn(self.clone().run_health_publisher(
                health,
                interval,
                shutdown.clone(),
            )));
        }

        let joined = self.join_group(shutdown.clone()).await;
        if !matches!(joined, Ok(true)) {
            for task in background {
                task.abort();
            }
            return joined.map(|_| ());
        }
        info!(
            instance = %self.instance,
            capacity = self.settings.queue_capacity,
            workers = self.settings.worker_count,
            "🚀 Execution consumer running"
        );

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(self.settings.queue_capacity);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let workers: Vec<JoinHandle<()>> = (0..self.settings.worker_count)
            .map(|index| tokio::spawn(self.clone().worker(index, work_rx.clone())))
            .collect();

        background.push(tokio::spawn(self.dead_letters.clone().run_sweeper(
            self.settings.dead_letter_sweep_interval,
            Arc::new(self.replay_handler()),
            shutdown.clone(),
        )));

        let result = self.read_loop(&work_tx, shutdown).await;
        drop(work_tx);
        self.drain(workers).await;
        for task in background {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        info!(stats = ?self.stats(), "Execution consumer stopped");
        result
    }

    /// Join the group, retrying retryable failures until it works.
    ///
    /// `Ok(false)` means shutdown arrived first.
    async fn join_group(&self, mut shutdown: watch::Receiver<bool>) -> Result<bool, ExecutionError> {
        let mut attempt = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(false);
            }
            match self.prepare().await {
                Ok(()) => {
                    self.stats.record_read(true);
                    return Ok(true);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    self.stats.record_read(false);
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, ?delay, error = %e, "Joining execution group failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return Ok(false);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Whether the results stream answers again; restores the capability if so
    async fn results_stream_back(&self) -> bool {
        match self.broker.len(streams::EXECUTION_RESULTS).await {
            Ok(_) => {
                self.degradation.restore(RESULTS_CAPABILITY);
                true
            }
            Err(e) => {
                debug!(error = %e, "Results stream still unavailable, holding reads");
                false
            }
        }
    }

    async fn read_loop(
        &self,
        work_tx: &mpsc::Sender<WorkItem>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ExecutionError> {
        let mut last_claim = Instant::now();

        while !*shutdown.borrow() {
            if !self.degradation.is_available(RESULTS_CAPABILITY) && !self.results_stream_back().await {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.block) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            // Hold one permit before reading at all; with none left the loop parks here.
            let first = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(ExecutionError::QueueClosed),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let room = 1 + self.permits.available_permits();

            let batch = tokio::select! {
                batch = self.next_batch(room, &mut last_claim) => batch,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match batch {
                Ok(messages) => self.admit_batch(messages, first, work_tx).await?,
                Err(e) => {
                    drop(first);
                    warn!(error = %e, retryable = e.is_retryable(), "Reading execution requests failed");
                    if matches!(e, ExecutionError::Broker(BrokerError::NoSuchGroup { .. })) {
                        match self.prepare().await {
                            Ok(()) => warn!(group = streams::EXECUTION_GROUP, "Execution group was missing, re-created"),
                            Err(e) => warn!(error = %e, "Re-creating execution group failed"),
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.block) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Stale entries from a dead consumer when a claim is due, else new ones
    async fn next_batch(
        &self,
        room: usize,
        last_claim: &mut Instant,
    ) -> Result<Vec<StreamMessage>, ExecutionError> {
        if last_claim.elapsed() >= self.settings.claim_min_idle {
            *last_claim = Instant::now();
            let claimed = self
                .broker
                .claim_stale(
                    streams::EXECUTION_REQUESTS,
                    streams::EXECUTION_GROUP,
                    self.instance.as_str(),
                    self.settings.claim_min_idle,
                    room.min(self.settings.claim_batch),
                )
                .await
                .inspect_err(|_| self.stats.record_read(false))?;
            // Entries we are still working on may be claimed back to us; they are already queued.
            let claimed: Vec<StreamMessage> = {
                let in_flight = self.in_flight_ids.lock();
                claimed
                    .into_iter()
                    .filter(|m| !in_flight.contains(&m.id))
                    .collect()
            };
            if !claimed.is_empty() {
                self.stats
                    .reclaimed
                    .fetch_add(claimed.len() as u64, std::sync::atomic::Ordering::Relaxed);
                info!(instance = %self.instance, count = claimed.len(), "Reclaimed stale execution requests");
                return Ok(claimed);
            }
        }

        let result = self
            .broker
            .read_group(
                streams::EXECUTION_REQUESTS,
                streams::EXECUTION_GROUP,
                self.instance.as_str(),
                room.min(self.settings.read_batch),
                self.settings.block,
            )
            .await;
        self.stats.record_read(result.is_ok());
        Ok(result?)
    }

    async fn admit_batch(
        &self,
        messages: Vec<StreamMessage>,
        first: OwnedSemaphorePermit,
        work_tx: &mpsc::Sender<WorkItem>,
    ) -> Result<(), ExecutionError> {
        let mut first = Some(first);
        for message in messages {
            // Batches never exceed the permits free at read time, so this does not wait.
            let permit = match first.take() {
                Some(permit) => permit,
                None => self
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ExecutionError::QueueClosed)?,
            };
            self.admit(message, permit, work_tx).await?;
        }
        Ok(())
    }

    async fn admit(
        &self,
        message: StreamMessage,
        permit: OwnedSemaphorePermit,
        work_tx: &mpsc::Sender<WorkItem>,
    ) -> Result<(), ExecutionError> {
        ExecutionStats::incr(&self.stats.received);

        let request = match validate(&message.fields) {
            Validation::Valid(request) => request,
            Validation::Invalid { reason, .. } => {
                ExecutionStats::incr(&self.stats.invalid);
                let id = message
                    .fields
                    .get("id")
                    .filter(|id| !id.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("{}#{}", message.stream, message.id));
                warn!(%id, %reason, "Invalid execution request, dead-lettering");
                let payload = allow_listed(&message.fields, &REQUEST_FIELDS);
                self.park(self.dead_letter(&id, operations::VALIDATE, payload, reason).terminal())
                    .await;
                self.ack(message.id).await;
                return Ok(());
            }
        };

        if let Err(rejection) = self.rules.check(&request, current_time_ms()) {
            ExecutionStats::incr(&self.stats.rejected);
            debug!(id = %request.id(), kind = rejection.kind(), %rejection, "Execution request rejected");
            let report = self.report(&request, ExecutionStatus::Rejected, rejection.to_string());
            if self.publish(&report).await {
                self.ack(message.id).await;
            } else {
                ExecutionStats::incr(&self.stats.unacked);
                warn!(id = %request.id(), entry = %message.id, "Rejection not recorded, leaving request pending");
            }
            return Ok(());
        }

        self.in_flight_ids.lock().insert(message.id);
        work_tx
            .send(WorkItem {
                message_id: message.id,
                request,
                permit,
            })
            .await
            .map_err(|_| ExecutionError::QueueClosed)
    }

    async fn worker(
        self: Arc<Self>,
        index: usize,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    ) {
        debug!(worker = index, "Execution worker started");
        loop {
            let item = queue.lock().await.recv().await;
            match item {
                Some(item) => self.execute(item).await,
                None => break,
            }
        }
        debug!(worker = index, "Execution worker stopped");
    }

    async fn execute(&self, item: WorkItem) {
        let WorkItem {
            message_id,
            request,
            permit,
        } = item;
        let strategy = self.strategy.as_ref();
        let started = Instant::now();
        let result = retry(&self.retry, StrategyError::is_retryable, |_| {
            strategy.execute(&request)
        })
        .await;
        self.stats
            .record_execution(started.elapsed().as_secs_f64() * 1_000.0);

        let report = match result {
            Ok(outcome) => {
                ExecutionStats::incr(&self.stats.executed);
                info!(id = %request.id(), detail = %outcome.detail, elapsed = ?started.elapsed(), "✅ Executed");
                self.report(&request, ExecutionStatus::Succeeded, outcome.detail)
            }
            Err(e) => {
                ExecutionStats::incr(&self.stats.failed);
                let (error, terminal) = match e {
                    RetryError::Exhausted { attempts, last } => {
                        (format!("execution failed after {attempts} attempts: {last}"), false)
                    }
                    RetryError::Terminal(e) => (e.to_string(), true),
                };
                warn!(id = %request.id(), %error, terminal, "Execution failed, dead-lettering");
                let entry = self.dead_letter(
                    request.id().as_str(),
                    operations::EXECUTE,
                    request.to_fields(),
                    error.clone(),
                );
                self.park(if terminal { entry.terminal() } else { entry }).await;
                self.report(&request, ExecutionStatus::Failed, error)
            }
        };

        // Ack only once the outcome is on the results stream.
        if self.publish(&report).await {
            self.ack(message_id).await;
        } else {
            ExecutionStats::incr(&self.stats.unacked);
            warn!(id = %request.id(), entry = %message_id, "Result not recorded, leaving request pending");
        }
        self.in_flight_ids.lock().remove(&message_id);
        drop(permit);
    }

    async fn drain(&self, mut workers: Vec<JoinHandle<()>>) {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!(in_flight, timeout = ?self.settings.drain_timeout, "Draining execution workers");
        }
        let drained = tokio::time::timeout(
            self.settings.drain_timeout,
            futures::future::join_all(workers.iter_mut()),
        )
        .await;
        if drained.is_err() {
            for worker in &workers {
                worker.abort();
            }
            warn!(
                left_pending = self.in_flight(),
                "Drain timed out; unfinished requests stay pending for redelivery"
            );
        }
    }

    fn report(&self, request: &ExecutionRequest, status: ExecutionStatus, detail: String) -> ExecutionReport {
        ExecutionReport {
            id: request.id().clone(),
            status,
            detail,
            executed_by: self.instance.clone(),
            completed_at_ms: current_time_ms(),
        }
    }

    /// Append to the results stream; `false` if it could not be recorded.
    ///
    /// While the results stream is degraded a single attempt is made.
    async fn publish(&self, report: &ExecutionReport) -> bool {
        let broker = &self.broker;
        let fields = report.to_fields();
        let policy = if self.degradation.is_available(RESULTS_CAPABILITY) {
            self.retry.clone()
        } else {
            RetryPolicy::none()
        };
        let appended = retry(&policy, BrokerError::is_retryable, |_| {
            broker.append(streams::EXECUTION_RESULTS, fields.clone())
        })
        .await;
        match appended {
            Ok(_) => {
                self.degradation.restore(RESULTS_CAPABILITY);
                true
            }
            Err(e) => {
                warn!(id = %report.id, status = %report.status, error = %e, "Publishing execution result failed");
                self.degradation.degrade(RESULTS_CAPABILITY, &e.to_string());
                false
            }
        }
    }

    /// Ack one entry; a failed ack only means it will be delivered again
    async fn ack(&self, id: SequenceId) {
        if let Err(e) = self
            .broker
            .ack(streams::EXECUTION_REQUESTS, streams::EXECUTION_GROUP, &[id])
            .await
        {
            warn!(%id, error = %e, "Ack failed, entry stays pending");
        }
    }

    fn dead_letter(
        &self,
        id: &str,
        operation: &str,
        payload: types::FieldMap,
        error: impl Into<String>,
    ) -> DeadLetterEntry {
        DeadLetterEntry::new(id, operation, payload, error)
            .with_max_retries(self.settings.dead_letter_max_retries)
            .with_ttl_ms(self.settings.dead_letter_ttl_ms)
    }

    async fn park(&self, entry: DeadLetterEntry) {
        ExecutionStats::incr(&self.stats.dead_lettered);
        self.dead_letters.enqueue(entry).await;
    }

    /// Push current state onto the health document
    pub async fn publish_health(&self, health: &SharedHealth) {
        let stats = self.stats();
        let dead_letters: DeadLetterStats = self.dead_letters.stats();
        let saturated = stats.in_flight >= stats.capacity;
        let flags = self.degradation.flags();
        let mut health = health.lock().await;

        health.set_capability("execution", stats.read_failures < UNHEALTHY_READ_FAILURES);
        for (name, available) in &flags {
            health.set_capability(name, *available);
        }
        health.add_detail("execution", &stats);
        health.add_detail("dead_letters", &dead_letters);
        if stats.read_failures >= UNHEALTHY_READ_FAILURES {
            health.set_status(HealthStatus::Unhealthy);
            health.add_error(&format!(
                "{} consecutive broker read failures",
                stats.read_failures
            ));
        } else if saturated || flags.values().any(|available| !available) {
            health.set_status(HealthStatus::Degraded);
        } else {
            health.clear_errors();
            health.set_status(HealthStatus::Healthy);
        }
    }

    async fn run_health_publisher(
        self: Arc<Self>,
        health: SharedHealth,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_health(&health).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
