//! In-process stream broker.
//!
//! Keeps each stream as a capped `VecDeque` and every consumer group as a
//! cursor plus a pending map. Blocking reads park on a per-stream
//! [`Notify`] that every append wakes.

use crate::{BrokerError, PendingSummary, StartPolicy, StreamBroker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::{current_time_ms, FieldMap, SequenceId, StreamMessage};

#[derive(Debug, Clone)]
struct Entry {
    id: SequenceId,
    fields: FieldMap,
    published_at_ms: u64,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: SequenceId,
    pending: BTreeMap<SequenceId, PendingEntry>,
}

#[derive(Debug)]
struct Stream {
    entries: VecDeque<Entry>,
    last_id: SequenceId,
    groups: HashMap<String, Group>,
    notify: Arc<Notify>,
}

impl Stream {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_id: SequenceId::default(),
            groups: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn entry(&self, id: SequenceId) -> Option<&Entry> {
        // ids are dense and increasing, so the offset from the front is exact
        let first = self.entries.front()?.id.inner();
        let offset = id.inner().checked_sub(first)? as usize;
        self.entries.get(offset).filter(|e| e.id == id)
    }

    /// Index of the first retained entry with id >= `from`
    fn offset_from(&self, from: u64) -> usize {
        match self.entries.front() {
            Some(front) => from
                .saturating_sub(front.id.inner())
                .min(self.entries.len() as u64) as usize,
            None => 0,
        }
    }

    fn message(&self, stream: &str, entry: &Entry, delivery_count: u32) -> StreamMessage {
        StreamMessage {
            stream: stream.to_string(),
            id: entry.id,
            fields: entry.fields.clone(),
            published_at_ms: entry.published_at_ms,
            delivery_count,
        }
    }
}

/// In-memory [`StreamBroker`] shared by every task of one process (and by
/// every simulated instance in tests)
#[derive(Debug)]
pub struct InMemoryBroker {
    streams: Mutex<HashMap<String, Stream>>,
    max_len: usize,
    unavailable: AtomicBool,
    /// Streams that fail every call while the rest of the broker works
    unavailable_streams: Mutex<HashSet<String>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl InMemoryBroker {
    /// # Panics
    ///
    /// Panics if `max_len` is zero.
    pub fn new(max_len: usize) -> Self {
        assert!(max_len > 0, "stream max_len must be non-zero");
        Self {
            streams: Mutex::new(HashMap::new()),
            max_len,
            unavailable: AtomicBool::new(false),
            unavailable_streams: Mutex::new(HashSet::new()),
        }
    }

    /// Make every subsequent call fail with [`BrokerError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        let previous = self.unavailable.swap(unavailable, Ordering::SeqCst);
        if previous != unavailable {
            if unavailable {
                warn!("🔌 In-memory broker marked unavailable");
            } else {
                info!("🔌 In-memory broker available again");
            }
        }
    }

    /// Make calls touching `stream` fail with [`BrokerError::Unavailable`]
    pub fn set_stream_unavailable(&self, stream: &str, unavailable: bool) {
        let mut streams = self.unavailable_streams.lock();
        let changed = if unavailable {
            streams.insert(stream.to_string())
        } else {
            streams.remove(stream)
        };
        if changed {
            warn!(stream, unavailable, "🔌 In-memory stream availability changed");
        }
    }

    fn check_available(&self, stream: &str) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::unavailable("broker marked unavailable"));
        }
        if self.unavailable_streams.lock().contains(stream) {
            return Err(BrokerError::unavailable(format!("stream '{}' marked unavailable", stream)));
        }
        Ok(())
    }

    /// Notify handle for a group's stream, validating the group exists
    fn group_notify(&self, stream: &str, group: &str) -> Result<Arc<Notify>, BrokerError> {
        let streams = self.streams.lock();
        let s = streams
            .get(stream)
            .filter(|s| s.groups.contains_key(group))
            .ok_or_else(|| BrokerError::no_such_group(stream, group))?;
        Ok(s.notify.clone())
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_batch: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut streams = self.streams.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::no_such_group(stream, group))?;
        let cursor = s
            .groups
            .get(group)
            .ok_or_else(|| BrokerError::no_such_group(stream, group))?
            .last_delivered;

        let batch: Vec<Entry> = s
            .entries
            .range(s.offset_from(cursor.inner().saturating_add(1))..)
            .take(max_batch)
            .cloned()
            .collect();
        let Some(last) = batch.last() else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let last_id = last.id;
        let messages = batch.iter().map(|e| s.message(stream, e, 1)).collect();
        if let Some(g) = s.groups.get_mut(group) {
            g.last_delivered = last_id;
            for e in &batch {
                g.pending.insert(
                    e.id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn append(&self, stream: &str, fields: FieldMap) -> Result<SequenceId, BrokerError> {
        self.check_available(stream)?;
        let mut streams = self.streams.lock();
        let s = streams.entry(stream.to_string()).or_insert_with(Stream::new);

        let id = s.last_id.next();
        s.last_id = id;
        s.entries.push_back(Entry {
            id,
            fields,
            published_at_ms: current_time_ms(),
        });
        while s.entries.len() > self.max_len {
            s.entries.pop_front();
        }

        s.notify.notify_waiters();
        debug!(stream, id = %id, "appended");
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPolicy,
    ) -> Result<bool, BrokerError> {
        self.check_available(stream)?;
        let mut streams = self.streams.lock();
        let s = streams.entry(stream.to_string()).or_insert_with(Stream::new);
        if s.groups.contains_key(group) {
            return Ok(false);
        }

        let last_delivered = match start {
            StartPolicy::Beginning => SequenceId::default(),
            StartPolicy::NewOnly => s.last_id,
        };
        s.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        info!(stream, group, ?start, "Created consumer group");
        Ok(true)
    }

    async fn delete_group(&self, stream: &str, group: &str) -> Result<bool, BrokerError> {
        self.check_available(stream)?;
        let removed = self
            .streams
            .lock()
            .get_mut(stream)
            .and_then(|s| s.groups.remove(group))
            .is_some();
        if removed {
            info!(stream, group, "Deleted consumer group");
        }
        Ok(removed)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_batch: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        if max_batch == 0 {
            return Err(BrokerError::InvalidArgument("max_batch must be non-zero".into()));
        }
        let deadline = Instant::now() + block;
        self.check_available(stream)?;
        let notify = self.group_notify(stream, group)?;

        loop {
            // Register for wakeups before looking, so an append in between is not lost.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available(stream)?;
            let batch = self.deliver_new(stream, group, consumer, max_batch)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(
        &self,
        stream: &str,
        group: &str,
        ids: &[SequenceId],
    ) -> Result<usize, BrokerError> {
        self.check_available(stream)?;
        let mut streams = self.streams.lock();
        let g = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| BrokerError::no_such_group(stream, group))?;

        Ok(ids.iter().filter(|id| g.pending.remove(id).is_some()).count())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        self.check_available(stream)?;
        let mut streams = self.streams.lock();
        let s = streams
            .get_mut(stream)
            .filter(|s| s.groups.contains_key(group))
            .ok_or_else(|| BrokerError::no_such_group(stream, group))?;

        let now = Instant::now();
        let stale: Vec<SequenceId> = s
            .groups
            .get(group)
            .map(|g| {
                g.pending
                    .iter()
                    .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();

        let mut claimed = Vec::new();
        let mut trimmed = Vec::new();
        for id in stale {
            if claimed.len() >= max_count {
                break;
            }
            match s.entry(id) {
                Some(entry) => claimed.push((entry.clone(), id)),
                None => trimmed.push(id),
            }
        }

        let mut messages = Vec::with_capacity(claimed.len());
        if let Some(g) = s.groups.get_mut(group) {
            for id in &trimmed {
                g.pending.remove(id);
            }
            for (entry, id) in &claimed {
                if let Some(p) = g.pending.get_mut(id) {
                    if p.consumer != consumer {
                        debug!(stream, group, id = %id, from = %p.consumer, to = consumer, "claimed");
                    }
                    p.consumer = consumer.to_string();
                    p.delivered_at = now;
                    p.delivery_count = p.delivery_count.saturating_add(1);
                    messages.push((entry.clone(), p.delivery_count));
                }
            }
        }
        if !trimmed.is_empty() {
            warn!(stream, group, count = trimmed.len(), "Dropped pending entries trimmed from the log");
        }

        Ok(messages
            .iter()
            .map(|(entry, count)| s.message(stream, entry, *count))
            .collect())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError> {
        self.check_available(stream)?;
        let streams = self.streams.lock();
        let g = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| BrokerError::no_such_group(stream, group))?;

        let mut summary = PendingSummary {
            count: g.pending.len(),
            oldest: g.pending.keys().next().copied(),
            newest: g.pending.keys().next_back().copied(),
            per_consumer: BTreeMap::new(),
        };
        for p in g.pending.values() {
            *summary.per_consumer.entry(p.consumer.clone()).or_insert(0) += 1;
        }
        Ok(summary)
    }

    async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
        self.check_available(stream)?;
        Ok(self
            .streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0))
    }

    async fn range(
        &self,
        stream: &str,
        from: SequenceId,
        max: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        self.check_available(stream)?;
        let streams = self.streams.lock();
        Ok(streams
            .get(stream)
            .map(|s| {
                s.entries
                    .range(s.offset_from(from.inner())..)
                    .take(max)
                    .map(|e| s.message(stream, e, 0))
                    .collect()
            })
            .unwrap_or_default())
    }
}
