//! Redis-held leader lease.
//!
//! The lease is a hash (`holder`, `term`) that expires with `PEXPIRE`; the
//! term comes from an `INCR` counter at `<key>:term` that outlives every
//! lease, so terms never repeat. Acquire, renew and release each run as one
//! Lua script and are atomic on the server.

use crate::redis_stream::is_transient;
use crate::{LeaderLease, LeaseError, LeaseStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use types::Term;

const ACQUIRE: &str = r"
local holder = redis.call('HGET', KEYS[1], 'holder')
if holder and holder ~= ARGV[1] then
  return {0, 0}
end
if holder then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return {1, tonumber(redis.call('HGET', KEYS[1], 'term'))}
end
local term = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'holder', ARGV[1], 'term', term)
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return {1, term}
";

const RENEW: &str = r"
local lease = redis.call('HMGET', KEYS[1], 'holder', 'term')
if lease[1] == ARGV[1] and lease[2] == ARGV[2] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return 0
";

const RELEASE: &str = r"
if redis.call('HGET', KEYS[1], 'holder') == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

const CURRENT: &str = r"
local lease = redis.call('HMGET', KEYS[1], 'holder', 'term')
if not lease[1] then
  return false
end
return {lease[1], lease[2], redis.call('PTTL', KEYS[1])}
";

/// [`LeaseStore`] shared by every instance connected to one Redis server
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
    acquire: Script,
    renew: Script,
    release: Script,
    current: Script,
}

impl fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLeaseStore").finish_non_exhaustive()
    }
}

impl RedisLeaseStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            acquire: Script::new(ACQUIRE),
            renew: Script::new(RENEW),
            release: Script::new(RELEASE),
            current: Script::new(CURRENT),
        }
    }
}

fn term_key(key: &str) -> String {
    format!("{key}:term")
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn unavailable(error: RedisError) -> LeaseError {
    if !is_transient(&error) {
        debug!(error = %error, "Lease store returned a non-transient error");
    }
    LeaseError::Unavailable(error.to_string())
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LeaderLease>, LeaseError> {
        let mut conn = self.conn.clone();
        // Measured before the call, so the local view never outlives the server's.
        let started = Instant::now();
        let (acquired, term): (u8, u64) = self
            .acquire
            .key(key)
            .key(term_key(key))
            .arg(holder)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if acquired == 0 {
            return Ok(None);
        }
        let term = Term::new(term);
        debug!(key, holder, %term, "Lease held");
        Ok(Some(LeaderLease {
            key: key.to_string(),
            holder: holder.to_string(),
            term,
            expires_at: started + ttl,
        }))
    }

    async fn renew(
        &self,
        key: &str,
        holder: &str,
        term: Term,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let renewed: u8 = self
            .renew
            .key(key)
            .arg(holder)
            .arg(term.inner())
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let released: u8 = self
            .release
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if released == 1 {
            info!(key, holder, "Released lease");
        }
        Ok(released == 1)
    }

    async fn current(&self, key: &str) -> Result<Option<LeaderLease>, LeaseError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let lease: Option<(String, u64, i64)> = self
            .current
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(lease
            .filter(|(_, _, remaining_ms)| *remaining_ms > 0)
            .map(|(holder, term, remaining_ms)| LeaderLease {
                key: key.to_string(),
                holder,
                term: Term::new(term),
                expires_at: started + Duration::from_millis(remaining_ms as u64),
            }))
    }
}
