//! Opportunities through the whole cluster: intake, hand-off, forward, execute.

use e2e_tests::fixtures::malformed_opportunity;
use e2e_tests::framework::{init_test_logging, wait_until};
use e2e_tests::{OpportunityFixture, PipelineValidator, TestCluster};
use execution_consumer::test_utils::BlockingStrategy;
use execution_consumer::DryRunStrategy;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use types::ExecutionStatus;

const CONFIG: &str = r#"
[broker]
block_timeout_ms = 10
claim_min_idle_ms = 2000

[leader]
lease_ttl_ms = 10000
renewal_interval_ms = 3000

[execution]
queue_capacity = 8
worker_count = 2
drain_timeout_ms = 200
max_opportunity_age_ms = 60000

[retry]
max_attempts = 3
base_delay_ms = 1
max_delay_ms = 4
jitter = 0.0
"#;

const SETTLE: Duration = Duration::from_millis(500);
const POLL: Duration = Duration::from_millis(50);

async fn result_count(cluster: &TestCluster) -> usize {
    cluster.results().await.map(|r| r.len()).unwrap_or(0)
}

#[tokio::test(start_paused = true)]
async fn each_opportunity_executes_once_across_the_cluster() {
    init_test_logging();
    let cluster = TestCluster::from_toml(CONFIG).unwrap();
    for name in ["coord-a", "coord-b", "coord-c"] {
        cluster.start_coordinator(name).await.unwrap();
    }
    cluster
        .start_execution("exec-a", Arc::new(DryRunStrategy))
        .await
        .unwrap();
    cluster
        .start_execution("exec-b", Arc::new(DryRunStrategy))
        .await
        .unwrap();
    assert_eq!(cluster.leaders().await, vec!["coord-a".to_string()]);

    // Two detector partitions report every opportunity.
    let batch = OpportunityFixture::batch("opp", 12);
    for opportunity in &batch {
        cluster.publish(opportunity).await.unwrap();
        cluster
            .publish(&opportunity.clone().from_partition("partition-1"))
            .await
            .unwrap();
    }

    let c = &cluster;
    wait_until(Duration::from_secs(10), POLL, move || async move {
        result_count(c).await >= 12
    })
    .await
    .unwrap();
    tokio::time::sleep(SETTLE).await;

    let validator = PipelineValidator::new(
        &cluster.forwarded().await.unwrap(),
        &cluster.results().await.unwrap(),
    );
    validator.validate_exactly_once().unwrap();
    let expected: BTreeSet<String> = batch.iter().map(|o| o.id.clone()).collect();
    validator.validate_succeeded(&expected).unwrap();
    assert_eq!(validator.routers(), BTreeSet::from(["coord-a".to_string()]));

    // Every second copy was caught by one of the two dedup layers.
    let coordinators = cluster.coordinators().await;
    let forwarded: u64 = coordinators.iter().map(|c| c.stats().forwarded).sum();
    let duplicates: u64 = coordinators
        .iter()
        .map(|c| {
            let stats = c.stats();
            stats.intake_duplicates + stats.forward_duplicates
        })
        .sum();
    assert_eq!(forwarded, 12);
    assert_eq!(duplicates, 12);

    let executed: u64 = cluster
        .executors()
        .await
        .iter()
        .map(|e| e.stats().executed)
        .sum();
    assert_eq!(executed, 12);

    cluster.stop_all().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn malformed_opportunity_is_dead_lettered_before_execution() {
    init_test_logging();
    let cluster = TestCluster::from_toml(CONFIG).unwrap();
    cluster.start_coordinator("coord-a").await.unwrap();
    cluster
        .start_execution("exec-a", Arc::new(DryRunStrategy))
        .await
        .unwrap();

    cluster.publish_fields(malformed_opportunity()).await.unwrap();
    cluster.publish(&OpportunityFixture::new("opp-good")).await.unwrap();

    let c = &cluster;
    wait_until(Duration::from_secs(5), POLL, move || async move {
        result_count(c).await >= 1
    })
    .await
    .unwrap();
    tokio::time::sleep(SETTLE).await;

    let forwarded = cluster.forwarded().await.unwrap();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].id().as_str(), "opp-good");
    assert_eq!(cluster.dead_letter_count().await.unwrap(), 1);

    let results = cluster.results().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExecutionStatus::Succeeded);

    cluster.stop_all().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unknown_pair_is_reported_as_rejected() {
    init_test_logging();
    let config = CONFIG.replace(
        "[execution]\n",
        "[execution]\nknown_pairs = [\"WETH/USDC\"]\n",
    );
    let cluster = TestCluster::from_toml(&config).unwrap();
    cluster.start_coordinator("coord-a").await.unwrap();
    let executor = cluster
        .start_execution("exec-a", Arc::new(DryRunStrategy))
        .await
        .unwrap();

    cluster
        .publish(&OpportunityFixture::new("opp-known"))
        .await
        .unwrap();
    cluster
        .publish(&OpportunityFixture::new("opp-unknown").with_pair("PEPE/USDC"))
        .await
        .unwrap();

    let c = &cluster;
    wait_until(Duration::from_secs(5), POLL, move || async move {
        result_count(c).await >= 2
    })
    .await
    .unwrap();

    let results = cluster.results().await.unwrap();
    let status_of = |id: &str| {
        results
            .iter()
            .find(|r| r.id.as_str() == id)
            .map(|r| r.status)
    };
    assert_eq!(status_of("opp-known"), Some(ExecutionStatus::Succeeded));
    assert_eq!(status_of("opp-unknown"), Some(ExecutionStatus::Rejected));
    assert_eq!(executor.stats().executed, 1);
    assert_eq!(executor.stats().rejected, 1);

    cluster.stop_all().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn work_left_by_a_stopped_executor_is_claimed_by_a_survivor() {
    init_test_logging();
    let cluster = TestCluster::from_toml(CONFIG).unwrap();
    cluster.start_coordinator("coord-a").await.unwrap();
    let stuck = Arc::new(BlockingStrategy::new());
    let doomed = cluster.start_execution("exec-a", stuck.clone()).await.unwrap();

    for opportunity in OpportunityFixture::batch("opp", 3) {
        cluster.publish(&opportunity).await.unwrap();
    }
    let d = &doomed;
    wait_until(Duration::from_secs(5), POLL, move || async move {
        d.in_flight() == 3
    })
    .await
    .unwrap();
    assert_eq!(stuck.started(), 2);

    let survivor = cluster
        .start_execution("exec-b", Arc::new(DryRunStrategy))
        .await
        .unwrap();
    // Drain times out with every request still unacked.
    cluster.stop_service("exec-a").await.unwrap();
    assert_eq!(result_count(&cluster).await, 0);

    let c = &cluster;
    wait_until(Duration::from_secs(10), POLL, move || async move {
        result_count(c).await >= 3
    })
    .await
    .unwrap();

    let results = cluster.results().await.unwrap();
    assert!(results.iter().all(|r| r.executed_by.as_str() == "exec-b"));
    let validator = PipelineValidator::new(&cluster.forwarded().await.unwrap(), &results);
    validator.validate_exactly_once().unwrap();
    assert_eq!(survivor.stats().reclaimed, 3);
    assert!(stuck.completed().is_empty());

    cluster.stop_all().await.unwrap();
}
