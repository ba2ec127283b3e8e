//! # Dead-Letter Queue
//!
//! Holds operations that failed past their retry budget, ordered by priority
//! and then age, each bounded by a TTL. A periodic sweep replays entries that
//! still have retries left and removes expired ones.
//!
//! Nothing leaves the queue silently: every entry removed without being
//! recovered (TTL expiry, or eviction when the queue is full) is logged at
//! `error` and broadcast as a [`TerminalFailure`].
//!
//! Entries are mirrored to `stream:dead-letter` on enqueue so they remain
//! inspectable outside the process.
//!
//! A queue built with [`DeadLetterQueue::with_journal`] also survives a
//! restart. Each mirrored entry carries its owner, and the owner reads the
//! stream through its own consumer group: an entry stays pending in that
//! group while it is parked and is acked once it leaves the queue. On start,
//! [`DeadLetterQueue::recover`] adopts whatever the previous process left
//! pending. Entries of other owners are acked unread.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{BrokerError, StartPolicy, StreamBroker};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use types::{current_time_ms, streams, DeadLetterEntry, SequenceId, StreamMessage};

/// Mirrored field naming the queue that parked the entry
pub const OWNER_FIELD: &str = "owner";

/// Journal entries read per broker call
const JOURNAL_BATCH: usize = 256;

/// What a replay attempt achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Done; the entry is removed
    Recovered,
    /// Attempt failed; consumes one retry
    Failed(String),
    /// Not attempted now (e.g. downstream still unavailable); consumes nothing
    Deferred,
}

/// Knows how to re-run one kind of dead-lettered operation
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    /// Whether this handler replays entries with the given `operation`
    fn handles(&self, operation: &str) -> bool {
        let _ = operation;
        true
    }

    async fn replay(&self, entry: &DeadLetterEntry) -> ReplayOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalReason {
    Expired,
    Evicted,
}

/// Signal for an entry that left the queue without being recovered
#[derive(Debug, Clone)]
pub struct TerminalFailure {
    pub entry: DeadLetterEntry,
    pub reason: TerminalReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Replay attempts made (recovered or not)
    pub retried: usize,
    pub recovered: usize,
    pub expired: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeadLetterStats {
    pub depth: usize,
    pub enqueued: u64,
    pub recovered: u64,
    pub terminal_failures: u64,
    pub mirror_failures: u64,
}

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub max_entries: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

/// Ordering key: higher priority first, then enqueue order
type Key = (Reverse<types::DeadLetterPriority>, u64);

#[derive(Debug, Clone)]
struct Parked {
    entry: DeadLetterEntry,
    parked_at: Instant,
    /// Position in `stream:dead-letter`, for journaled queues
    journal_id: Option<SequenceId>,
}

impl Parked {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.parked_at) >= Duration::from_millis(self.entry.ttl_ms)
    }
}

struct Journal {
    owner: String,
    group: String,
    state: Mutex<JournalState>,
}

#[derive(Default)]
struct JournalState {
    /// Highest id the owner's group has delivered to this process
    read_through: SequenceId,
    /// Entries that left the queue but whose journal ack is still owed
    resolved: BTreeSet<SequenceId>,
}

pub struct DeadLetterQueue {
    config: DeadLetterConfig,
    entries: Mutex<BTreeMap<Key, Parked>>,
    next_seq: AtomicU64,
    broker: Option<Arc<dyn StreamBroker>>,
    journal: Option<Journal>,
    terminal_tx: broadcast::Sender<TerminalFailure>,
    enqueued: AtomicU64,
    recovered: AtomicU64,
    terminal_failures: AtomicU64,
    mirror_failures: AtomicU64,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("config", &self.config)
            .field("depth", &self.len())
            .finish()
    }
}

impl DeadLetterQueue {
    /// Queue without a mirror stream
    pub fn new(config: DeadLetterConfig) -> Self {
        let (terminal_tx, _) = broadcast::channel(256);
        Self {
            config,
            entries: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            broker: None,
            journal: None,
            terminal_tx,
            enqueued: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            terminal_failures: AtomicU64::new(0),
            mirror_failures: AtomicU64::new(0),
        }
    }

    /// Queue that mirrors every enqueued entry to `stream:dead-letter`
    pub fn with_broker(config: DeadLetterConfig, broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            broker: Some(broker),
            ..Self::new(config)
        }
    }

    /// Queue whose entries outlive the process, owned by `owner`.
    ///
    /// Call [`DeadLetterQueue::recover`] before the first enqueue.
    pub fn with_journal(
        config: DeadLetterConfig,
        broker: Arc<dyn StreamBroker>,
        owner: impl Into<String>,
    ) -> Self {
        let owner = owner.into();
        Self {
            journal: Some(Journal {
                group: streams::dead_letter_group(&owner),
                owner,
                state: Mutex::new(JournalState::default()),
            }),
            ..Self::with_broker(config, broker)
        }
    }

    pub fn subscribe_terminal(&self) -> broadcast::Receiver<TerminalFailure> {
        self.terminal_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entries in sweep order
    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().values().map(|p| p.entry.clone()).collect()
    }

    pub fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            depth: self.len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
            mirror_failures: self.mirror_failures.load(Ordering::Relaxed),
        }
    }

    pub async fn enqueue(&self, entry: DeadLetterEntry) {
        info!(
            id = %entry.operation_id,
            operation = %entry.operation,
            priority = %entry.priority,
            terminal = entry.terminal,
            error = %entry.last_error,
            "📮 Dead-lettered"
        );
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        let Some(broker) = &self.broker else {
            let evicted = self.insert(entry, Instant::now(), None);
            self.retire(evicted, TerminalReason::Evicted).await;
            return;
        };

        let mut fields = entry.to_fields();
        if let Some(journal) = &self.journal {
            fields.insert(OWNER_FIELD.to_string(), journal.owner.clone());
        }
        let journal_id = match broker.append(streams::DEAD_LETTER, fields).await {
            Ok(id) => self.journal.as_ref().map(|_| id),
            Err(e) => {
                // Still parked in memory, so the entry is not lost.
                self.mirror_failures.fetch_add(1, Ordering::Relaxed);
                warn!(id = %entry.operation_id, error = %e, "Failed to mirror dead-letter entry");
                None
            }
        };

        if journal_id.is_some() {
            // Reading it back leaves it pending in the owner's group.
            match self.sync().await {
                Ok(_) => return,
                Err(e) => debug!(error = %e, "Journal read-back failed, parking locally"),
            }
        }
        let evicted = self.insert(entry, Instant::now(), journal_id);
        self.retire(evicted, TerminalReason::Evicted).await;
    }

    /// Park `entry` and trim to capacity; returns what was evicted
    fn insert(
        &self,
        entry: DeadLetterEntry,
        parked_at: Instant,
        journal_id: Option<SequenceId>,
    ) -> Vec<Parked> {
        let mut entries = self.entries.lock();
        if journal_id.is_some() && entries.values().any(|p| p.journal_id == journal_id) {
            return Vec::new();
        }
        let key = (
            Reverse(entry.priority),
            self.next_seq.fetch_add(1, Ordering::Relaxed),
        );
        entries.insert(
            key,
            Parked {
                entry,
                parked_at,
                journal_id,
            },
        );
        let mut evicted = Vec::new();
        while entries.len() > self.config.max_entries {
            match Self::eviction_victim(&entries).and_then(|k| entries.remove(&k)) {
                Some(parked) => evicted.push(parked),
                None => break,
            }
        }
        evicted
    }

    /// Signal entries that left unrecovered and settle their journal records
    async fn retire(&self, gone: Vec<Parked>, reason: TerminalReason) {
        let mut journal_ids = Vec::with_capacity(gone.len());
        for parked in gone {
            journal_ids.extend(parked.journal_id);
            self.signal_terminal(parked.entry, reason);
        }
        for id in journal_ids {
            self.settle(id).await;
        }
    }

    /// Ack a journal record whose entry left the queue
    async fn settle(&self, id: SequenceId) {
        let (Some(broker), Some(journal)) = (&self.broker, &self.journal) else {
            return;
        };
        let delivered = id <= journal.state.lock().read_through;
        let acked = delivered
            && match broker.ack_one(streams::DEAD_LETTER, &journal.group, id).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(%id, error = %e, "Journal ack failed, will retry");
                    false
                }
            };
        if !acked {
            journal.state.lock().resolved.insert(id);
        }
    }

    /// Pull journal records delivered since the last call.
    ///
    /// This owner's records not yet held locally are adopted; anything else is
    /// acked. Returns how many entries were adopted. A no-op without a journal.
    pub async fn sync(&self) -> Result<usize, BrokerError> {
        let (Some(broker), Some(journal)) = (&self.broker, &self.journal) else {
            return Ok(0);
        };
        let mut adopted = 0;
        loop {
            let batch = broker
                .read_group(
                    streams::DEAD_LETTER,
                    &journal.group,
                    &journal.owner,
                    JOURNAL_BATCH,
                    Duration::ZERO,
                )
                .await?;
            if batch.is_empty() {
                break;
            }
            adopted += self.absorb(broker.as_ref(), journal, batch).await;
        }
        self.flush_resolved(broker.as_ref(), journal).await;
        Ok(adopted)
    }

    /// Join the owner's group and adopt every entry a previous process left
    /// parked. Returns how many entries were adopted. A no-op without a journal.
    pub async fn recover(&self) -> Result<usize, BrokerError> {
        let (Some(broker), Some(journal)) = (&self.broker, &self.journal) else {
            return Ok(0);
        };
        broker
            .create_group(streams::DEAD_LETTER, &journal.group, StartPolicy::NewOnly)
            .await?;
        let pending = broker
            .claim_stale(
                streams::DEAD_LETTER,
                &journal.group,
                &journal.owner,
                Duration::ZERO,
                self.config.max_entries.max(1),
            )
            .await?;
        let mut adopted = self.absorb(broker.as_ref(), journal, pending).await;
        adopted += self.sync().await?;
        if adopted > 0 {
            info!(owner = %journal.owner, adopted, "📮 Recovered parked dead-letter entries");
        }
        Ok(adopted)
    }

    async fn absorb(
        &self,
        broker: &dyn StreamBroker,
        journal: &Journal,
        messages: Vec<StreamMessage>,
    ) -> usize {
        let known: HashSet<SequenceId> = self
            .entries
            .lock()
            .values()
            .filter_map(|p| p.journal_id)
            .collect();
        let mut settled = Vec::new();
        let mut evicted = Vec::new();
        let mut adopted = 0;

        for message in messages {
            let owned = {
                let mut state = journal.state.lock();
                state.read_through = state.read_through.max(message.id);
                let mine = message.fields.get(OWNER_FIELD) == Some(&journal.owner);
                mine && !state.resolved.remove(&message.id)
            };
            if !owned {
                settled.push(message.id);
                continue;
            }
            if known.contains(&message.id) {
                continue;
            }
            match DeadLetterEntry::from_fields(&message.fields) {
                Ok(entry) => {
                    let parked_at = parked_since(entry.enqueued_at_ms);
                    evicted.extend(self.insert(entry, parked_at, Some(message.id)));
                    adopted += 1;
                }
                Err(e) => {
                    warn!(id = %message.id, error = %e, "Dropping undecodable dead-letter record");
                    settled.push(message.id);
                }
            }
        }

        if !settled.is_empty() {
            if let Err(e) = broker.ack(streams::DEAD_LETTER, &journal.group, &settled).await {
                debug!(error = %e, count = settled.len(), "Journal ack failed");
                journal.state.lock().resolved.extend(settled);
            }
        }
        self.retire(evicted, TerminalReason::Evicted).await;
        adopted
    }

    /// Retry acks owed for delivered records
    async fn flush_resolved(&self, broker: &dyn StreamBroker, journal: &Journal) {
        let due: Vec<SequenceId> = {
            let state = journal.state.lock();
            state
                .resolved
                .range(..=state.read_through)
                .copied()
                .collect()
        };
        if due.is_empty() {
            return;
        }
        match broker.ack(streams::DEAD_LETTER, &journal.group, &due).await {
            Ok(_) => {
                let mut state = journal.state.lock();
                for id in &due {
                    state.resolved.remove(id);
                }
            }
            Err(e) => debug!(error = %e, count = due.len(), "Journal ack retry failed"),
        }
    }

    /// Oldest entry of the lowest priority present
    fn eviction_victim(entries: &BTreeMap<Key, Parked>) -> Option<Key> {
        let (Reverse(lowest), _) = *entries.keys().next_back()?;
        entries
            .range((Reverse(lowest), 0)..)
            .next()
            .map(|(k, _)| *k)
    }

    fn signal_terminal(&self, entry: DeadLetterEntry, reason: TerminalReason) {
        self.terminal_failures.fetch_add(1, Ordering::Relaxed);
        error!(
            id = %entry.operation_id,
            operation = %entry.operation,
            retries = entry.retry_count,
            max_retries = entry.max_retries,
            error = %entry.last_error,
            ?reason,
            "❌ Dead-letter entry failed terminally"
        );
        // No subscribers is fine; the log line above is the record.
        let _ = self.terminal_tx.send(TerminalFailure { entry, reason });
    }

    /// One pass: drop expired entries, then replay the retryable ones in order
    pub async fn sweep(&self, handler: &dyn DeadLetterHandler) -> SweepReport {
        if let Err(e) = self.sync().await {
            debug!(error = %e, "Dead-letter journal sync failed");
        }
        let now = Instant::now();
        let mut report = SweepReport::default();

        let (expired, due) = {
            let mut entries = self.entries.lock();
            let expired_keys: Vec<Key> = entries
                .iter()
                .filter(|(_, p)| p.is_expired(now))
                .map(|(k, _)| *k)
                .collect();
            let expired: Vec<Parked> = expired_keys
                .iter()
                .filter_map(|k| entries.remove(k))
                .collect();
            let due: Vec<(Key, DeadLetterEntry)> = entries
                .iter()
                .filter(|(_, p)| p.entry.can_retry() && handler.handles(&p.entry.operation))
                .map(|(k, p)| (*k, p.entry.clone()))
                .collect();
            (expired, due)
        };

        report.expired = expired.len();
        self.retire(expired, TerminalReason::Expired).await;

        for (key, entry) in due {
            match handler.replay(&entry).await {
                ReplayOutcome::Recovered => {
                    report.retried += 1;
                    report.recovered += 1;
                    let removed = self.entries.lock().remove(&key);
                    if let Some(parked) = removed {
                        self.recovered.fetch_add(1, Ordering::Relaxed);
                        info!(id = %entry.operation_id, operation = %entry.operation, "✅ Dead-letter entry recovered");
                        if let Some(id) = parked.journal_id {
                            self.settle(id).await;
                        }
                    }
                }
                ReplayOutcome::Failed(error) => {
                    report.retried += 1;
                    let mut entries = self.entries.lock();
                    if let Some(parked) = entries.get_mut(&key) {
                        parked.entry.record_attempt(error);
                        if !parked.entry.can_retry() {
                            warn!(
                                id = %parked.entry.operation_id,
                                retries = parked.entry.retry_count,
                                "Dead-letter retries exhausted, holding until TTL"
                            );
                        }
                    }
                }
                ReplayOutcome::Deferred => {
                    report.deferred += 1;
                }
            }
        }

        if report != SweepReport::default() {
            debug!(?report, depth = self.len(), "Dead-letter sweep");
        }
        report
    }

    /// Sweep every `interval` until `shutdown` flips to `true`
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        handler: Arc<dyn DeadLetterHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(?interval, "Dead-letter sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(handler.as_ref()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(depth = self.len(), "Dead-letter sweeper stopped");
    }
}

/// Local park time for an entry enqueued at `enqueued_at_ms`, so an adopted
/// entry keeps the TTL it had left
fn parked_since(enqueued_at_ms: u64) -> Instant {
    let now = Instant::now();
    let age = Duration::from_millis(current_time_ms().saturating_sub(enqueued_at_ms));
    now.checked_sub(age).unwrap_or(now)
}
