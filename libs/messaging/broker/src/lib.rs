//! # Stream Broker
//!
//! The durable-log contract every service talks to, and the lease store
//! used for leader election.
//!
//! ## Delivery model
//!
//! - Appends to one stream get strictly increasing [`SequenceId`]s.
//! - A consumer group keeps one cursor; each entry past the cursor is handed
//!   to exactly one member and stays *pending* for that member until acked.
//! - Pending entries whose consumer went quiet are taken over with
//!   [`StreamBroker::claim_stale`], which is what makes delivery at-least-once.
//! - Blocking reads return `Ok(vec![])` when the block timeout passes.
//!
//! Clients are constructed explicitly and passed in; nothing here is global.
//!
//! ## Backends
//!
//! [`InMemoryBroker`] and [`InMemoryLeaseStore`] live inside one process and
//! back the tests. [`RedisBroker`] and [`RedisLeaseStore`] share streams,
//! groups and the lease between processes.

pub mod error;
pub mod lease;
pub mod memory;
pub mod redis_lease;
pub mod redis_stream;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use types::{FieldMap, SequenceId, StreamMessage};

pub use error::{BrokerError, LeaseError};
pub use lease::{InMemoryLeaseStore, LeaderLease, LeaseStore};
pub use memory::InMemoryBroker;
pub use redis_lease::RedisLeaseStore;
pub use redis_stream::{connect, RedisBroker};

/// Where a newly created group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    /// Deliver every entry still retained in the stream
    Beginning,
    /// Deliver only entries appended after the group is created
    NewOnly,
}

/// Pending-entry overview for one group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: usize,
    pub oldest: Option<SequenceId>,
    pub newest: Option<SequenceId>,
    pub per_consumer: BTreeMap<String, usize>,
}

/// Append-only log with consumer-group delivery
#[async_trait]
pub trait StreamBroker: Send + Sync + Debug {
    /// Append one entry, returning its sequence id
    async fn append(&self, stream: &str, fields: FieldMap) -> Result<SequenceId, BrokerError>;

    /// Create `group` on `stream` (creating the stream if needed).
    ///
    /// Returns `false` when the group already existed; its cursor is left
    /// untouched.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPolicy,
    ) -> Result<bool, BrokerError>;

    /// Remove `group` and its pending entries; `false` if it did not exist
    async fn delete_group(&self, stream: &str, group: &str) -> Result<bool, BrokerError>;

    /// Deliver up to `max_batch` new entries to `consumer`, waiting up to
    /// `block` for at least one
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_batch: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Acknowledge delivered entries; returns how many were pending
    async fn ack(&self, stream: &str, group: &str, ids: &[SequenceId])
        -> Result<usize, BrokerError>;

    /// Take over entries pending for at least `min_idle` on behalf of `consumer`
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError>;

    /// Entries currently retained in `stream`
    async fn len(&self, stream: &str) -> Result<usize, BrokerError>;

    /// Inspect retained entries with id >= `from`, oldest first
    async fn range(
        &self,
        stream: &str,
        from: SequenceId,
        max: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Acknowledge a single entry
    async fn ack_one(&self, stream: &str, group: &str, id: SequenceId) -> Result<bool, BrokerError> {
        Ok(self.ack(stream, group, &[id]).await? == 1)
    }
}
