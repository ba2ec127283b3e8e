//! Intake, forwarding and dead-letter behaviour of a single coordinator.

use coordinator::{Coordinator, FORWARDING_CAPABILITY};
use health_check::{HealthStatus, ServiceHealth};
use resilience::CircuitState;
use service_config::ServiceConfig;
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{InMemoryBroker, InMemoryLeaseStore, StreamBroker};
use tokio::sync::{watch, Mutex};
use types::{
    current_time_ms, streams, DeadLetterPriority, ExecutionRequest, FieldMap, InstanceId,
    Opportunity, SequenceId,
};

const RECOVERY: Duration = Duration::from_secs(30);

fn config() -> ServiceConfig {
    ServiceConfig::from_toml_str(
        r#"
[broker]
block_timeout_ms = 10

[retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 2
jitter = 0.0

[breaker]
failure_threshold = 1
recovery_timeout_ms = 30000
"#,
    )
    .unwrap()
}

struct Harness {
    broker: Arc<InMemoryBroker>,
    coordinator: Arc<Coordinator>,
}

async fn harness(instance: &str) -> Harness {
    let broker = Arc::new(InMemoryBroker::default());
    let leases = Arc::new(InMemoryLeaseStore::new());
    let coordinator = Arc::new(Coordinator::new(
        &config(),
        InstanceId::new(instance),
        broker.clone(),
        leases,
    ));
    coordinator.prepare().await.unwrap();
    Harness {
        broker,
        coordinator,
    }
}

fn opportunity(id: &str) -> Opportunity {
    Opportunity::builder(id, "WETH/USDC")
        .source_partition("p0")
        .amount_in(1_000_000)
        .expected_profit(2_500)
        .profit_percentage(0.25)
        .gas_estimate(180_000)
        .created_at_ms(current_time_ms())
        .build()
}

async fn publish(broker: &InMemoryBroker, fields: FieldMap) {
    broker.append(streams::OPPORTUNITIES, fields).await.unwrap();
}

async fn forwarded(broker: &InMemoryBroker) -> Vec<ExecutionRequest> {
    broker
        .range(streams::EXECUTION_REQUESTS, SequenceId::new(0), 100)
        .await
        .unwrap()
        .iter()
        .map(|m| ExecutionRequest::from_fields(&m.fields).unwrap())
        .collect()
}

#[tokio::test]
async fn duplicate_opportunities_are_handed_off_once() {
    let h = harness("coord-a").await;
    for _ in 0..3 {
        publish(&h.broker, opportunity("opp-1").to_fields()).await;
    }
    publish(&h.broker, opportunity("opp-2").to_fields()).await;

    assert_eq!(h.coordinator.intake().process_batch().await.unwrap(), 4);

    assert_eq!(h.broker.len(streams::COORDINATOR_HANDOFF).await.unwrap(), 2);
    let stats = h.coordinator.stats();
    assert_eq!(stats.received, 4);
    assert_eq!(stats.intake_duplicates, 2);
    assert_eq!(stats.handed_off, 2);

    let pending = h
        .broker
        .pending(streams::OPPORTUNITIES, streams::COORDINATOR_GROUP)
        .await
        .unwrap();
    assert_eq!(pending.count, 0);
}

#[tokio::test]
async fn invalid_opportunity_is_dead_lettered_as_terminal() {
    let h = harness("coord-a").await;
    let mut fields = opportunity("opp-bad").to_fields();
    fields.remove(Opportunity::AMOUNT_IN);
    fields.insert("apiKey".into(), "do-not-forward".into());
    publish(&h.broker, fields).await;

    h.coordinator.intake().process_batch().await.unwrap();

    let parked = h.coordinator.dead_letters().snapshot();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].operation, "intake");
    assert_eq!(parked[0].operation_id.as_str(), "opp-bad");
    assert!(parked[0].terminal);
    assert!(!parked[0].payload.contains_key("apiKey"));

    assert_eq!(h.broker.len(streams::COORDINATOR_HANDOFF).await.unwrap(), 0);
    assert_eq!(h.broker.len(streams::DEAD_LETTER).await.unwrap(), 1);
    assert_eq!(h.coordinator.stats().invalid, 1);
}

#[tokio::test]
async fn negative_profit_percentage_never_reaches_hand_off() {
    let h = harness("coord-a").await;
    let mut fields = opportunity("opp-neg").to_fields();
    fields.insert(Opportunity::PROFIT_PERCENTAGE.into(), "-1.5".into());
    publish(&h.broker, fields).await;
    let mut zero = opportunity("opp-zero").to_fields();
    zero.insert(Opportunity::PROFIT_PERCENTAGE.into(), "-0.0".into());
    publish(&h.broker, zero).await;

    h.coordinator.intake().process_batch().await.unwrap();

    let parked = h.coordinator.dead_letters().snapshot();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].operation_id.as_str(), "opp-neg");
    assert!(parked[0].terminal);
    assert!(parked[0].last_error.contains("profitPercentage"));
    assert_eq!(h.broker.len(streams::COORDINATOR_HANDOFF).await.unwrap(), 1);
}

#[tokio::test]
async fn leader_forwards_handed_off_opportunities() {
    let h = harness("coord-a").await;
    publish(&h.broker, opportunity("opp-1").to_fields()).await;
    h.coordinator.intake().process_batch().await.unwrap();

    // Not yet elected: nothing is read from the hand-off stream.
    assert_eq!(h.coordinator.forward().process_batch().await.unwrap(), 0);

    h.coordinator.leader().tick().await;
    assert!(h.coordinator.leader().is_leader());
    assert_eq!(h.coordinator.forward().process_batch().await.unwrap(), 1);

    let requests = forwarded(&h.broker).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id().as_str(), "opp-1");
    assert_eq!(requests[0].routed_by.as_str(), "coord-a");
    assert_eq!(requests[0].opportunity.expected_profit, 2_500);
    assert_eq!(h.coordinator.stats().forwarded, 1);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_parks_forward_until_replay_recovers_it() {
    let h = harness("coord-a").await;
    h.coordinator.leader().tick().await;
    publish(&h.broker, opportunity("opp-1").to_fields()).await;
    h.coordinator.intake().process_batch().await.unwrap();

    h.coordinator.forward_breaker().force_open();
    h.coordinator.forward().process_batch().await.unwrap();

    assert!(forwarded(&h.broker).await.is_empty());
    let parked = h.coordinator.dead_letters().snapshot();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].operation, "forward");
    assert_eq!(parked[0].priority, DeadLetterPriority::High);
    assert!(!parked[0].terminal);
    assert_eq!(h.coordinator.stats().breaker_rejections, 1);

    // Still open: the sweep defers without spending a retry.
    let handler = h.coordinator.replay_handler();
    let report = h.coordinator.dead_letters().sweep(&handler).await;
    assert_eq!(report.deferred, 1);
    assert_eq!(h.coordinator.dead_letters().snapshot()[0].retry_count, 0);

    // The lease lapsed too: the first round demotes, the second re-acquires.
    tokio::time::advance(RECOVERY + Duration::from_millis(1)).await;
    h.coordinator.leader().tick().await;
    h.coordinator.leader().tick().await;
    assert!(h.coordinator.leader().is_leader());
    let report = h.coordinator.dead_letters().sweep(&handler).await;
    assert_eq!(report.recovered, 1);
    assert!(h.coordinator.dead_letters().is_empty());
    assert_eq!(h.coordinator.forward_breaker().state(), CircuitState::Closed);

    let requests = forwarded(&h.broker).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id().as_str(), "opp-1");
    assert_eq!(h.coordinator.stats().replayed, 1);
}

#[tokio::test]
async fn follower_hands_parked_forwards_back_to_the_leader() {
    let h = harness("coord-a").await;
    h.coordinator.leader().tick().await;
    publish(&h.broker, opportunity("opp-1").to_fields()).await;
    h.coordinator.intake().process_batch().await.unwrap();
    h.coordinator.forward_breaker().force_open();
    h.coordinator.forward().process_batch().await.unwrap();

    h.coordinator.leader().step_down().await;
    h.coordinator.forward_breaker().reset();

    let report = h
        .coordinator
        .dead_letters()
        .sweep(&h.coordinator.replay_handler())
        .await;
    assert_eq!(report.recovered, 1);
    assert!(h.coordinator.dead_letters().is_empty());
    assert_eq!(h.coordinator.stats().handed_back, 1);
    assert_eq!(h.broker.len(streams::COORDINATOR_HANDOFF).await.unwrap(), 2);
    assert!(forwarded(&h.broker).await.is_empty());

    // Health publishing notices the closed breaker; the next leader forwards.
    let health = Arc::new(Mutex::new(ServiceHealth::new("coordinator")));
    h.coordinator.publish_health(&health).await;
    h.coordinator.leader().tick().await;
    assert!(h.coordinator.leader().is_leader());
    assert_eq!(h.coordinator.forward().process_batch().await.unwrap(), 1);

    let requests = forwarded(&h.broker).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id().as_str(), "opp-1");
}

#[tokio::test]
async fn degraded_forwarding_parks_without_touching_the_breaker() {
    let h = harness("coord-a").await;
    h.coordinator.leader().tick().await;
    publish(&h.broker, opportunity("opp-1").to_fields()).await;
    h.coordinator.intake().process_batch().await.unwrap();

    h.coordinator.forward_breaker().force_open();
    h.coordinator.forward().process_batch().await.unwrap();
    assert!(!h.coordinator.degradation().is_available(FORWARDING_CAPABILITY));
    assert_eq!(h.coordinator.stats().breaker_rejections, 1);

    // Closed again, but the capability still says degraded: park, no call.
    h.coordinator.forward_breaker().reset();
    publish(&h.broker, opportunity("opp-2").to_fields()).await;
    h.coordinator.intake().process_batch().await.unwrap();
    h.coordinator.forward().process_batch().await.unwrap();

    let stats = h.coordinator.stats();
    assert_eq!(stats.degraded_parks, 1);
    assert_eq!(stats.breaker_rejections, 1);
    assert_eq!(h.coordinator.forward_breaker().stats().total_calls, 0);
    assert!(forwarded(&h.broker).await.is_empty());
    assert_eq!(h.coordinator.dead_letters().len(), 2);

    let report = h
        .coordinator
        .dead_letters()
        .sweep(&h.coordinator.replay_handler())
        .await;
    assert_eq!(report.recovered, 2);
    assert!(h.coordinator.degradation().is_available(FORWARDING_CAPABILITY));

    publish(&h.broker, opportunity("opp-3").to_fields()).await;
    h.coordinator.intake().process_batch().await.unwrap();
    h.coordinator.forward().process_batch().await.unwrap();
    assert_eq!(forwarded(&h.broker).await.len(), 3);
    assert_eq!(h.coordinator.stats().forwarded, 1);
}

#[tokio::test]
async fn parked_entries_survive_a_restart() {
    let h = harness("coord-a").await;
    h.coordinator.leader().tick().await;
    publish(&h.broker, opportunity("opp-1").to_fields()).await;
    h.coordinator.intake().process_batch().await.unwrap();
    h.coordinator.forward_breaker().force_open();
    h.coordinator.forward().process_batch().await.unwrap();
    assert_eq!(h.coordinator.dead_letters().len(), 1);

    let restarted = Coordinator::new(
        &config(),
        InstanceId::new("coord-a"),
        h.broker.clone(),
        Arc::new(InMemoryLeaseStore::new()),
    );
    restarted.prepare().await.unwrap();
    let parked = restarted.dead_letters().snapshot();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].operation_id.as_str(), "opp-1");
    assert_eq!(parked[0].operation, "forward");

    let neighbour = Coordinator::new(
        &config(),
        InstanceId::new("coord-b"),
        h.broker.clone(),
        Arc::new(InMemoryLeaseStore::new()),
    );
    neighbour.prepare().await.unwrap();
    assert!(neighbour.dead_letters().is_empty());
}

#[tokio::test]
async fn read_failures_are_counted_until_a_read_succeeds() {
    let h = harness("coord-a").await;
    h.broker.set_unavailable(true);
    tokio_test::assert_err!(h.coordinator.intake().process_batch().await);
    tokio_test::assert_err!(h.coordinator.intake().process_batch().await);
    assert_eq!(h.coordinator.stats().read_failures, 2);

    h.broker.set_unavailable(false);
    assert_eq!(h.coordinator.intake().process_batch().await.unwrap(), 0);
    assert_eq!(h.coordinator.stats().read_failures, 0);
}

#[tokio::test]
async fn health_reflects_the_forwarding_breaker() {
    let h = harness("coord-a").await;
    let health = Arc::new(Mutex::new(ServiceHealth::new("coordinator")));

    h.coordinator.publish_health(&health).await;
    {
        let health = health.lock().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.capabilities.get(FORWARDING_CAPABILITY), Some(&true));
        assert!(health.details.contains_key("coordinator"));
    }

    h.coordinator.forward_breaker().force_open();
    h.coordinator.publish_health(&health).await;
    {
        let health = health.lock().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.capabilities.get(FORWARDING_CAPABILITY), Some(&false));
    }

    h.coordinator.forward_breaker().reset();
    h.coordinator.publish_health(&health).await;
    assert_eq!(health.lock().await.status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn broker_outage_at_startup_is_waited_out() {
    let broker = Arc::new(InMemoryBroker::default());
    broker.set_unavailable(true);
    let coordinator = Arc::new(Coordinator::new(
        &config(),
        InstanceId::new("coord-a"),
        broker.clone(),
        Arc::new(InMemoryLeaseStore::new()),
    ));
    let health = Arc::new(Mutex::new(ServiceHealth::new("coordinator")));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(
        coordinator
            .clone()
            .run(Some((health.clone(), Duration::from_millis(10))), shutdown_rx),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert!(coordinator.stats().read_failures >= 3);
    assert_eq!(health.lock().await.status, HealthStatus::Unhealthy);

    broker.set_unavailable(false);
    publish(&broker, opportunity("opp-late").to_fields()).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let requests = forwarded(&broker).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id().as_str(), "opp-late");

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    // The per-instance warm-up group goes away with the instance.
    let warmup = streams::warmup_group("coord-a");
    assert_eq!(coordinator.warmup().group(), warmup);
    tokio_test::assert_err!(broker.pending(streams::EXECUTION_REQUESTS, &warmup).await);
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_the_broker_is_down_is_clean() {
    let broker = Arc::new(InMemoryBroker::default());
    broker.set_unavailable(true);
    let coordinator = Arc::new(Coordinator::new(
        &config(),
        InstanceId::new("coord-a"),
        broker.clone(),
        Arc::new(InMemoryLeaseStore::new()),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(coordinator.clone().run(None, shutdown_rx));

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(coordinator.stats().forwarded, 0);
}

#[tokio::test]
async fn lost_consumer_group_is_recreated() {
    let h = harness("coord-a").await;
    assert!(h
        .broker
        .delete_group(streams::OPPORTUNITIES, streams::COORDINATOR_GROUP)
        .await
        .unwrap());

    assert_eq!(h.coordinator.intake().process_batch().await.unwrap(), 0);
    publish(&h.broker, opportunity("opp-1").to_fields()).await;
    assert_eq!(h.coordinator.intake().process_batch().await.unwrap(), 1);
    assert_eq!(h.coordinator.stats().read_failures, 0);
}
