//! Redis Streams backend.
//!
//! Each stream is a Redis stream key and each consumer group a Redis
//! consumer group, so several processes pointed at one server share cursors,
//! pending lists and claims. Entry ids are appended as `0-*`, which keeps the
//! sequence part equal to the [`SequenceId`] the rest of the system sees.
//! Requires Redis 7 (`XAUTOCLAIM` with deleted-id reporting and `0-*` ids).
//!
//! Reads poll without `BLOCK`: a blocking `XREADGROUP` would stall every
//! other command multiplexed onto the shared connection.

use crate::{BrokerError, PendingSummary, StartPolicy, StreamBroker};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::{current_time_ms, FieldMap, SequenceId, StreamMessage};

/// Field carrying the append time; stripped before entries are handed out
const PUBLISHED_AT_FIELD: &str = "__publishedAt";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// `(id, [field, value, ...])` as Redis returns a stream entry
type RawEntry = (String, Vec<(String, String)>);

/// Open a multiplexed, self-reconnecting connection to `url`
pub async fn connect(url: &str) -> Result<ConnectionManager, BrokerError> {
    let client = redis::Client::open(url)
        .map_err(|e| BrokerError::InvalidArgument(format!("redis url '{url}': {e}")))?;
    let conn = ConnectionManager::new(client)
        .await
        .map_err(|e| classify(e, None))?;
    info!(url, "🔌 Connected to redis");
    Ok(conn)
}

/// [`StreamBroker`] over Redis Streams
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    max_len: usize,
    poll_interval: Duration,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("max_len", &self.max_len)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// # Panics
    ///
    /// Panics if `max_len` is zero.
    pub fn new(conn: ConnectionManager, max_len: usize) -> Self {
        assert!(max_len > 0, "stream max_len must be non-zero");
        Self {
            conn,
            max_len,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often an empty blocking read asks again
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_batch: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<(String, Vec<RawEntry>)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max_batch)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Some((stream, group))))?;

        reply
            .into_iter()
            .flatten()
            .flat_map(|(_, entries)| entries)
            .map(|entry| to_message(stream, entry, 1))
            .collect()
    }

    /// Delivery counts for pending `ids` of `consumer`
    async fn delivery_counts(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        first: SequenceId,
        last: SequenceId,
        count: usize,
    ) -> Result<BTreeMap<SequenceId, u32>, BrokerError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, String, u64, u32)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(format_id(first))
            .arg(format_id(last))
            .arg(count)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Some((stream, group))))?;

        rows.into_iter()
            .map(|(id, _, _, deliveries)| Ok((parse_id(&id)?, deliveries)))
            .collect()
    }
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn append(&self, stream: &str, fields: FieldMap) -> Result<SequenceId, BrokerError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream)
            .arg("MAXLEN")
            .arg(self.max_len)
            .arg("0-*")
            .arg(PUBLISHED_AT_FIELD)
            .arg(current_time_ms());
        for (field, value) in &fields {
            cmd.arg(field).arg(value);
        }

        let id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, None))?;
        let id = parse_id(&id)?;
        debug!(stream, id = %id, "appended");
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPolicy,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let from = match start {
            StartPolicy::Beginning => "0",
            StartPolicy::NewOnly => "$",
        };
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(from)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(stream, group, ?start, "Created consumer group");
                Ok(true)
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(classify(e, None)),
        }
    }

    async fn delete_group(&self, stream: &str, group: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        // XGROUP DESTROY rejects a missing key instead of answering 0.
        let exists: bool = redis::cmd("EXISTS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, None))?;
        if !exists {
            return Ok(false);
        }

        let destroyed: usize = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, None))?;
        if destroyed > 0 {
            info!(stream, group, "Deleted consumer group");
        }
        Ok(destroyed > 0)
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
        loop {
            let batch = self.read_new(stream, group, consumer, max_batch).await?;
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(
        &self,
        stream: &str,
        group: &str,
        ids: &[SequenceId],
    ) -> Result<usize, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(format_id(*id));
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Some((stream, group))))
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut cursor = String::from("0-0");
        let mut claimed = Vec::new();
        let mut trimmed = 0;

        while claimed.len() < max_count {
            let (next, entries, deleted): (String, Vec<RawEntry>, Vec<String>) =
                redis::cmd("XAUTOCLAIM")
                    .arg(stream)
                    .arg(group)
                    .arg(consumer)
                    .arg(min_idle.as_millis() as u64)
                    .arg(&cursor)
                    .arg("COUNT")
                    .arg(max_count - claimed.len())
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| classify(e, Some((stream, group))))?;

            trimmed += deleted.len();
            claimed.extend(entries);
            if next == "0-0" {
                break;
            }
            cursor = next;
        }
        if trimmed > 0 {
            warn!(stream, group, count = trimmed, "Dropped pending entries trimmed from the log");
        }
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = claimed
            .into_iter()
            .map(|entry| to_message(stream, entry, 1))
            .collect::<Result<Vec<_>, _>>()?;
        messages.sort_by_key(|m| m.id);

        let (first, last) = (messages[0].id, messages[messages.len() - 1].id);
        let counts = self
            .delivery_counts(stream, group, consumer, first, last, messages.len())
            .await?;
        for message in &mut messages {
            if let Some(count) = counts.get(&message.id) {
                message.delivery_count = *count;
            }
        }
        Ok(messages)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError> {
        let mut conn = self.conn.clone();
        let (count, oldest, newest, consumers): (
            usize,
            Option<String>,
            Option<String>,
            Option<Vec<(String, usize)>>,
        ) = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Some((stream, group))))?;

        Ok(PendingSummary {
            count,
            oldest: oldest.as_deref().map(parse_id).transpose()?,
            newest: newest.as_deref().map(parse_id).transpose()?,
            per_consumer: consumers.unwrap_or_default().into_iter().collect(),
        })
    }

    async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, None))
    }

    async fn range(
        &self,
        stream: &str,
        from: SequenceId,
        max: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<RawEntry> = redis::cmd("XRANGE")
            .arg(stream)
            .arg(format_id(from))
            .arg("+")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, None))?;

        entries
            .into_iter()
            .map(|entry| to_message(stream, entry, 0))
            .collect()
    }
}

fn format_id(id: SequenceId) -> String {
    format!("0-{}", id.inner())
}

/// Accepts only the `0-<seq>` ids this backend writes
fn parse_id(raw: &str) -> Result<SequenceId, BrokerError> {
    raw.strip_prefix("0-")
        .and_then(|seq| seq.parse::<u64>().ok())
        .map(SequenceId::new)
        .ok_or_else(|| BrokerError::Backend(format!("unexpected stream entry id '{raw}'")))
}

fn to_message(
    stream: &str,
    (id, pairs): RawEntry,
    delivery_count: u32,
) -> Result<StreamMessage, BrokerError> {
    let mut published_at_ms = 0;
    let mut fields = FieldMap::new();
    for (field, value) in pairs {
        if field == PUBLISHED_AT_FIELD {
            published_at_ms = value.parse().unwrap_or(0);
        } else {
            fields.insert(field, value);
        }
    }
    Ok(StreamMessage {
        stream: stream.to_string(),
        id: parse_id(&id)?,
        fields,
        published_at_ms,
        delivery_count,
    })
}

/// Map a redis error onto the broker's retryable/terminal split
pub(crate) fn classify(error: RedisError, group: Option<(&str, &str)>) -> BrokerError {
    if let (Some("NOGROUP"), Some((stream, group))) = (error.code(), group) {
        return BrokerError::no_such_group(stream, group);
    }
    if is_transient(&error) {
        BrokerError::unavailable(error.to_string())
    } else {
        BrokerError::Backend(error.to_string())
    }
}

pub(crate) fn is_transient(error: &RedisError) -> bool {
    error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || matches!(
            error.kind(),
            ErrorKind::TryAgain
                | ErrorKind::BusyLoadingError
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
        )
}
