//! Redis backend against a live server.
//!
//! Runs only when `OPPFLOW_TEST_REDIS_URL` points at a Redis 7 server;
//! otherwise every test returns immediately.

use std::time::Duration;
use stream_broker::{
    connect, LeaseStore, RedisBroker, RedisLeaseStore, StartPolicy, StreamBroker,
};
use types::fields::field_map;
use types::{FieldMap, SequenceId, Term};

const URL_VAR: &str = "OPPFLOW_TEST_REDIS_URL";

async fn connection() -> Option<redis::aio::ConnectionManager> {
    let url = std::env::var(URL_VAR).ok()?;
    Some(connect(&url).await.expect("redis reachable"))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}:{}", uuid::Uuid::new_v4())
}

fn payload(id: &str) -> FieldMap {
    field_map([("id", id)])
}

#[tokio::test]
async fn groups_deliver_ack_and_claim() {
    let Some(conn) = connection().await else {
        return;
    };
    let broker = RedisBroker::new(conn, 1_000).with_poll_interval(Duration::from_millis(5));
    let stream = unique("stream:test");

    assert!(broker.create_group(&stream, "g", StartPolicy::Beginning).await.unwrap());
    assert!(!broker.create_group(&stream, "g", StartPolicy::Beginning).await.unwrap());

    let first = broker.append(&stream, payload("a")).await.unwrap();
    let second = broker.append(&stream, payload("b")).await.unwrap();
    assert_eq!(first, SequenceId::new(1));
    assert_eq!(second, SequenceId::new(2));

    let read = broker.read_group(&stream, "g", "c1", 10, Duration::ZERO).await.unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(read[0].fields, payload("a"));
    assert!(read[0].published_at_ms > 0);

    assert_eq!(broker.ack(&stream, "g", &[first]).await.unwrap(), 1);
    let pending = broker.pending(&stream, "g").await.unwrap();
    assert_eq!(pending.count, 1);
    assert_eq!(pending.oldest, Some(second));
    assert_eq!(pending.per_consumer["c1"], 1);

    let claimed = broker
        .claim_stale(&stream, "g", "c2", Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, second);
    assert_eq!(claimed[0].delivery_count, 2);

    let empty = broker
        .read_group(&stream, "g", "c1", 10, Duration::from_millis(30))
        .await
        .unwrap();
    assert!(empty.is_empty());

    assert_eq!(broker.len(&stream).await.unwrap(), 2);
    assert_eq!(broker.range(&stream, second, 10).await.unwrap().len(), 1);
    assert!(broker.delete_group(&stream, "g").await.unwrap());
    assert!(!broker.delete_group(&unique("stream:missing"), "g").await.unwrap());
}

#[tokio::test]
async fn missing_group_is_reported_as_such() {
    let Some(conn) = connection().await else {
        return;
    };
    let broker = RedisBroker::new(conn, 1_000);
    let stream = unique("stream:test");
    broker.append(&stream, payload("a")).await.unwrap();

    let err = broker
        .read_group(&stream, "nope", "c1", 1, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, stream_broker::BrokerError::NoSuchGroup { .. }), "{err}");
}

#[tokio::test]
async fn lease_terms_only_move_forward() {
    let Some(conn) = connection().await else {
        return;
    };
    let store = RedisLeaseStore::new(conn);
    let key = unique("lease:test");
    let ttl = Duration::from_secs(5);

    let a = store.try_acquire(&key, "a", ttl).await.unwrap().unwrap();
    assert_eq!(a.term, Term::new(1));
    assert!(store.try_acquire(&key, "b", ttl).await.unwrap().is_none());
    assert_eq!(store.try_acquire(&key, "a", ttl).await.unwrap().unwrap().term, a.term);
    assert!(store.renew(&key, "a", a.term, ttl).await.unwrap());
    assert!(!store.renew(&key, "b", a.term, ttl).await.unwrap());
    assert_eq!(store.current(&key).await.unwrap().unwrap().holder, "a");

    assert!(!store.release(&key, "b").await.unwrap());
    assert!(store.release(&key, "a").await.unwrap());
    assert!(store.current(&key).await.unwrap().is_none());

    let b = store.try_acquire(&key, "b", ttl).await.unwrap().unwrap();
    assert_eq!(b.term, Term::new(2));
    assert!(!store.renew(&key, "a", a.term, ttl).await.unwrap());
}
