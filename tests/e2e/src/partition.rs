//! Per-instance view of the shared lease store that can be cut off.
//!
//! Cutting one instance's view simulates a network partition between that
//! instance and the lease server: its renewals fail while every other
//! instance keeps talking to the same store.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{LeaderLease, LeaseError, LeaseStore};
use types::Term;

#[derive(Debug)]
pub struct PartitionableLeaseStore {
    inner: Arc<dyn LeaseStore>,
    partitioned: AtomicBool,
}

impl PartitionableLeaseStore {
    pub fn new(inner: Arc<dyn LeaseStore>) -> Self {
        Self {
            inner,
            partitioned: AtomicBool::new(false),
        }
    }

    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    fn reachable(&self) -> Result<(), LeaseError> {
        if self.is_partitioned() {
            Err(LeaseError::Unavailable("partitioned from lease store".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for PartitionableLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LeaderLease>, LeaseError> {
        self.reachable()?;
        self.inner.try_acquire(key, holder, ttl).await
    }

    async fn renew(
        &self,
        key: &str,
        holder: &str,
        term: Term,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        self.reachable()?;
        self.inner.renew(key, holder, term, ttl).await
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LeaseError> {
        self.reachable()?;
        self.inner.release(key, holder).await
    }

    async fn current(&self, key: &str) -> Result<Option<LeaderLease>, LeaseError> {
        self.reachable()?;
        self.inner.current(key).await
    }
}
