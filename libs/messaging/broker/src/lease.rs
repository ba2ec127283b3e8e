//! Leader lease store.
//!
//! A lease is `(holder, term, expires_at)` under a key. Acquisition is
//! set-if-absent-or-expired; renewal is conditional on the caller still
//! being the holder of the same term. The term only moves forward, so a
//! deposed holder can never renew its way back in.

use crate::LeaseError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use types::Term;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderLease {
    pub key: String,
    pub holder: String,
    pub term: Term,
    pub expires_at: Instant,
}

impl LeaderLease {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync + Debug {
    /// Take the lease if nobody holds a valid one.
    ///
    /// Returns the lease now held by `holder`, or `None` if another holder's
    /// lease is still valid. Re-acquiring a lease already held extends it
    /// without changing the term.
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LeaderLease>, LeaseError>;

    /// Extend the lease; `false` if `holder` no longer holds `term` or it expired
    async fn renew(
        &self,
        key: &str,
        holder: &str,
        term: Term,
        ttl: Duration,
    ) -> Result<bool, LeaseError>;

    /// Give the lease up early; `false` if `holder` did not hold it
    async fn release(&self, key: &str, holder: &str) -> Result<bool, LeaseError>;

    /// The valid lease under `key`, if any
    async fn current(&self, key: &str) -> Result<Option<LeaderLease>, LeaseError>;
}

#[derive(Debug, Default)]
struct Slot {
    lease: Option<LeaderLease>,
    last_term: Term,
}

/// Process-local [`LeaseStore`]
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    slots: Mutex<HashMap<String, Slot>>,
    unavailable: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`LeaseError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LeaseError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LeaseError::Unavailable("lease store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LeaderLease>, LeaseError> {
        self.check_available()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_default();

        let held_by_caller = slot
            .lease
            .as_ref()
            .filter(|l| l.is_valid_at(now))
            .map(|l| l.holder == holder);

        match (held_by_caller, slot.lease.as_mut()) {
            (Some(false), _) => Ok(None),
            (Some(true), Some(lease)) => {
                lease.expires_at = now + ttl;
                Ok(Some(lease.clone()))
            }
            _ => {
                let term = slot.last_term.next();
                slot.last_term = term;
                let lease = LeaderLease {
                    key: key.to_string(),
                    holder: holder.to_string(),
                    term,
                    expires_at: now + ttl,
                };
                slot.lease = Some(lease.clone());
                info!(key, holder, term = %term, "Lease acquired");
                Ok(Some(lease))
            }
        }
    }

    async fn renew(
        &self,
        key: &str,
        holder: &str,
        term: Term,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        self.check_available()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let Some(lease) = slots.get_mut(key).and_then(|s| s.lease.as_mut()) else {
            return Ok(false);
        };

        if lease.holder == holder && lease.term == term && lease.is_valid_at(now) {
            lease.expires_at = now + ttl;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LeaseError> {
        self.check_available()?;
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return Ok(false);
        };

        if slot.lease.as_ref().is_some_and(|l| l.holder == holder) {
            slot.lease = None;
            info!(key, holder, "Lease released");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn current(&self, key: &str) -> Result<Option<LeaderLease>, LeaseError> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .slots
            .lock()
            .get(key)
            .and_then(|s| s.lease.clone())
            .filter(|l| l.is_valid_at(now)))
    }
}
