//! Lease-based leader election.
//!
//! One elector per coordinator instance. Followers try to take the lease every
//! renewal interval; the leader renews on the same interval, which must be
//! shorter than the lease TTL. A renewal that fails for any reason (lost
//! lease, store unreachable) demotes the instance on the spot. Leadership is
//! also checked against the locally computed expiry, so a leader whose renew
//! calls hang stops forwarding once its lease would have lapsed.

use parking_lot::Mutex;
use serde::Serialize;
use service_config::LeaderSettings;
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{LeaderLease, LeaseStore};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::{InstanceId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum LeadershipState {
    Follower,
    Leader { term: Term },
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader { .. })
    }

    pub fn term(&self) -> Option<Term> {
        match self {
            LeadershipState::Leader { term } => Some(*term),
            LeadershipState::Follower => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub key: String,
    pub ttl: Duration,
    pub renewal_interval: Duration,
}

impl From<&LeaderSettings> for LeaderConfig {
    fn from(settings: &LeaderSettings) -> Self {
        Self {
            key: settings.lease_key.clone(),
            ttl: settings.lease_ttl(),
            renewal_interval: settings.renewal_interval(),
        }
    }
}

pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    instance: InstanceId,
    config: LeaderConfig,
    lease: Mutex<Option<LeaderLease>>,
    state_tx: watch::Sender<LeadershipState>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("instance", &self.instance)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LeaseStore>, instance: InstanceId, config: LeaderConfig) -> Self {
        let (state_tx, _) = watch::channel(LeadershipState::Follower);
        Self {
            store,
            instance,
            config,
            lease: Mutex::new(None),
            state_tx,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn config(&self) -> &LeaderConfig {
        &self.config
    }

    /// Leader with a lease that has not yet expired by the local clock
    pub fn is_leader(&self) -> bool {
        self.current_term().is_some()
    }

    /// Term of the lease held right now, if it has not expired by the local clock.
    ///
    /// Work started under one term checks this again before each side effect;
    /// a different answer means leadership lapsed in between.
    pub fn current_term(&self) -> Option<Term> {
        self.lease
            .lock()
            .as_ref()
            .filter(|lease| lease.is_valid_at(Instant::now()))
            .map(|lease| lease.term)
    }

    pub fn state(&self) -> LeadershipState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    /// One election round: renew if leading, otherwise try to acquire
    pub async fn tick(&self) {
        let held = self.lease.lock().clone();
        match held {
            Some(lease) => self.renew(lease).await,
            None => self.try_acquire().await,
        }
    }

    async fn renew(&self, lease: LeaderLease) {
        let started = Instant::now();
        if !lease.is_valid_at(started) {
            warn!(instance = %self.instance, term = %lease.term, "Lease expired before renewal");
            self.demote();
            return;
        }

        match self
            .store
            .renew(&self.config.key, self.instance.as_str(), lease.term, self.config.ttl)
            .await
        {
            Ok(true) => {
                let mut held = self.lease.lock();
                if let Some(current) = held.as_mut().filter(|l| l.term == lease.term) {
                    // Measured from before the call so the local view never outlives the store's.
                    current.expires_at = started + self.config.ttl;
                }
                debug!(instance = %self.instance, term = %lease.term, "Lease renewed");
            }
            Ok(false) => {
                warn!(instance = %self.instance, term = %lease.term, "Lease lost to another holder");
                self.demote();
            }
            Err(e) => {
                warn!(instance = %self.instance, error = %e, "Lease renewal failed, stepping down");
                self.demote();
            }
        }
    }

    async fn try_acquire(&self) {
        let started = Instant::now();
        match self
            .store
            .try_acquire(&self.config.key, self.instance.as_str(), self.config.ttl)
            .await
        {
            Ok(Some(mut lease)) => {
                lease.expires_at = lease.expires_at.min(started + self.config.ttl);
                let term = lease.term;
                *self.lease.lock() = Some(lease);
                self.state_tx.send_replace(LeadershipState::Leader { term });
                info!(instance = %self.instance, %term, "👑 Promoted to leader");
            }
            Ok(None) => {
                debug!(instance = %self.instance, "Lease held elsewhere");
            }
            Err(e) => {
                debug!(instance = %self.instance, error = %e, "Lease store unreachable");
            }
        }
    }

    fn demote(&self) {
        let was_leading = self.lease.lock().take().is_some();
        if was_leading {
            self.state_tx.send_replace(LeadershipState::Follower);
            warn!(instance = %self.instance, "Demoted to follower");
        }
    }

    /// Release the lease (best effort) and become a follower
    pub async fn step_down(&self) {
        let held = self.lease.lock().is_some();
        if !held {
            return;
        }
        self.demote();
        match self
            .store
            .release(&self.config.key, self.instance.as_str())
            .await
        {
            Ok(true) => info!(instance = %self.instance, "Lease released"),
            Ok(false) => debug!(instance = %self.instance, "Lease already gone"),
            Err(e) => warn!(instance = %self.instance, error = %e, "Lease release failed; it will expire"),
        }
    }

    /// Run election rounds until `shutdown` flips to `true`, then release the lease
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.renewal_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            instance = %self.instance,
            ttl = ?self.config.ttl,
            renewal = ?self.config.renewal_interval,
            "Leader election started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.step_down().await;
        info!(instance = %self.instance, "Leader election stopped");
    }
}
