//! Leadership across a running cluster: one forwarder, bounded failover.

use e2e_tests::framework::{init_test_logging, wait_until};
use e2e_tests::{OpportunityFixture, PipelineValidator, TestCluster};
use execution_consumer::DryRunStrategy;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const LEASE_TTL: Duration = Duration::from_millis(10_000);
const RENEWAL: Duration = Duration::from_millis(3_000);
const POLL: Duration = Duration::from_millis(50);

const CONFIG: &str = r#"
[broker]
block_timeout_ms = 10

[leader]
lease_ttl_ms = 10000
renewal_interval_ms = 3000

[execution]
max_opportunity_age_ms = 120000
"#;

async fn result_count(cluster: &TestCluster) -> usize {
    cluster.results().await.map(|r| r.len()).unwrap_or(0)
}

async fn publish_batch(cluster: &TestCluster, prefix: &str, count: usize) {
    for opportunity in OpportunityFixture::batch(prefix, count) {
        cluster.publish(&opportunity).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn never_more_than_one_leader() {
    init_test_logging();
    let cluster = TestCluster::from_toml(CONFIG).unwrap();
    for name in ["coord-a", "coord-b", "coord-c"] {
        cluster.start_coordinator(name).await.unwrap();
    }
    cluster
        .start_execution("exec-a", Arc::new(DryRunStrategy))
        .await
        .unwrap();

    // Several lease lifetimes, publishing as we go.
    let started = Instant::now();
    let mut round = 0;
    while started.elapsed() < LEASE_TTL * 3 {
        let leaders = cluster.leaders().await;
        assert_eq!(leaders, vec!["coord-a".to_string()]);
        publish_batch(&cluster, &format!("opp-{round}"), 2).await;
        round += 1;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let expected = round * 2;
    let c = &cluster;
    wait_until(Duration::from_secs(5), POLL, move || async move {
        result_count(c).await >= expected
    })
    .await
    .unwrap();

    let validator = PipelineValidator::new(
        &cluster.forwarded().await.unwrap(),
        &cluster.results().await.unwrap(),
    );
    validator.validate_exactly_once().unwrap();
    assert_eq!(validator.executed_ids().len(), expected);
    assert_eq!(validator.routers(), BTreeSet::from(["coord-a".to_string()]));

    cluster.stop_all().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn partitioned_leader_is_replaced_within_one_lease_plus_one_renewal() {
    init_test_logging();
    let cluster = TestCluster::from_toml(CONFIG).unwrap();
    cluster.start_coordinator("coord-a").await.unwrap();
    cluster.start_coordinator("coord-b").await.unwrap();
    cluster
        .start_execution("exec-a", Arc::new(DryRunStrategy))
        .await
        .unwrap();
    assert_eq!(cluster.leaders().await, vec!["coord-a".to_string()]);

    publish_batch(&cluster, "before", 3).await;
    let c = &cluster;
    wait_until(Duration::from_secs(5), POLL, move || async move {
        result_count(c).await >= 3
    })
    .await
    .unwrap();

    cluster.set_partitioned("coord-a", true).await.unwrap();
    let cut_at = Instant::now();
    let mut overlap = false;
    let mut took_over = None;
    while cut_at.elapsed() <= LEASE_TTL + RENEWAL + Duration::from_secs(1) {
        let leaders = cluster.leaders().await;
        overlap |= leaders.len() > 1;
        if leaders == vec!["coord-b".to_string()] {
            took_over = Some(cut_at.elapsed());
            break;
        }
        tokio::time::sleep(POLL).await;
    }
    assert!(!overlap, "two instances believed they led at once");
    let took_over = took_over.expect("follower never took over");
    assert!(
        took_over <= LEASE_TTL + RENEWAL,
        "failover took {took_over:?}"
    );

    publish_batch(&cluster, "after", 3).await;
    wait_until(Duration::from_secs(5), POLL, move || async move {
        result_count(c).await >= 6
    })
    .await
    .unwrap();

    // Healing the partition does not hand leadership back.
    cluster.set_partitioned("coord-a", false).await.unwrap();
    tokio::time::sleep(RENEWAL * 2).await;
    assert_eq!(cluster.leaders().await, vec!["coord-b".to_string()]);

    let validator = PipelineValidator::new(
        &cluster.forwarded().await.unwrap(),
        &cluster.results().await.unwrap(),
    );
    validator.validate_exactly_once().unwrap();
    assert_eq!(validator.executed_ids().len(), 6);
    assert_eq!(
        validator.routers(),
        BTreeSet::from(["coord-a".to_string(), "coord-b".to_string()])
    );

    cluster.stop_all().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stopped_leader_hands_over_within_one_renewal() {
    init_test_logging();
    let cluster = TestCluster::from_toml(CONFIG).unwrap();
    cluster.start_coordinator("coord-a").await.unwrap();
    cluster.start_coordinator("coord-b").await.unwrap();
    cluster
        .start_execution("exec-a", Arc::new(DryRunStrategy))
        .await
        .unwrap();

    // A graceful stop releases the lease instead of letting it expire.
    cluster.stop_service("coord-a").await.unwrap();
    let c = &cluster;
    let took_over = wait_until(RENEWAL + Duration::from_secs(1), POLL, move || async move {
        c.leaders().await == vec!["coord-b".to_string()]
    })
    .await
    .unwrap();
    assert!(took_over <= RENEWAL + POLL, "handover took {took_over:?}");

    publish_batch(&cluster, "opp", 4).await;
    wait_until(Duration::from_secs(5), POLL, move || async move {
        result_count(c).await >= 4
    })
    .await
    .unwrap();
    let forwarded = cluster.forwarded().await.unwrap();
    assert_eq!(forwarded.len(), 4);
    assert!(forwarded.iter().all(|r| r.routed_by.as_str() == "coord-b"));

    cluster.stop_all().await.unwrap();
}
