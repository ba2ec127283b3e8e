//! Supervisor driving real services: task restarts and HTTP health probes.

use coordinator::FORWARDING_CAPABILITY;
use e2e_tests::framework::{init_test_logging, wait_until};
use e2e_tests::{OpportunityFixture, PipelineValidator, TestCluster};
use execution_consumer::{DryRunStrategy, ExecutionConsumer};
use futures::FutureExt;
use health_check::HttpHealthProbe;
use resilience::{
    DegradationManager, ProbedUnit, RestartFn, Supervisor, SupervisorConfig, TaskFactory,
    TaskUnit,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use types::InstanceId;

const CONFIG: &str = r#"
[broker]
block_timeout_ms = 10
claim_min_idle_ms = 300

[leader]
lease_ttl_ms = 2000
renewal_interval_ms = 500

[execution]
drain_timeout_ms = 200
"#;

const POLL: Duration = Duration::from_millis(20);

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        poll_interval: Duration::from_millis(50),
        failure_threshold: 2,
        restart_base_delay: Duration::from_millis(50),
        restart_max_delay: Duration::from_millis(200),
        restart_multiplier: 2.0,
        max_direct_restarts: 3,
        probe_timeout: Duration::from_millis(500),
    }
}

async fn result_count(cluster: &TestCluster) -> usize {
    cluster.results().await.map(|r| r.len()).unwrap_or(0)
}

#[tokio::test]
async fn crashed_execution_unit_is_restarted_and_work_resumes() {
    init_test_logging();
    let cluster = Arc::new(TestCluster::from_toml(CONFIG).unwrap());
    cluster.start_coordinator("coord-a").await.unwrap();

    // Each incarnation leaves its stop switch here so the test can crash it.
    let current_stop: Arc<Mutex<Option<watch::Sender<bool>>>> = Arc::new(Mutex::new(None));
    let incarnations = Arc::new(AtomicU32::new(0));
    let factory: TaskFactory = {
        let cluster = cluster.clone();
        let current_stop = current_stop.clone();
        let incarnations = incarnations.clone();
        Arc::new(move || {
            let cluster = cluster.clone();
            let current_stop = current_stop.clone();
            let incarnations = incarnations.clone();
            async move {
                let consumer = Arc::new(ExecutionConsumer::new(
                    cluster.config(),
                    InstanceId::new("exec-supervised"),
                    cluster.broker().clone(),
                    Arc::new(DryRunStrategy),
                ));
                let (stop, shutdown) = watch::channel(false);
                *current_stop.lock().await = Some(stop);
                incarnations.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = consumer.run(None, shutdown).await {
                    tracing::warn!(error = %e, "Supervised consumer failed");
                }
            }
            .boxed()
        })
    };

    let supervisor = Arc::new(Supervisor::new(supervisor_config()));
    supervisor
        .register(Arc::new(TaskUnit::spawn("execution", factory)))
        .await;
    let (stop_supervisor, supervisor_shutdown) = watch::channel(false);
    let supervisor_task = tokio::spawn(supervisor.clone().run(supervisor_shutdown));

    let i = &incarnations;
    wait_until(Duration::from_secs(2), POLL, move || async move {
        i.load(Ordering::SeqCst) == 1
    })
    .await
    .unwrap();
    // Let the first incarnation join the group before anything is routed.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for opportunity in OpportunityFixture::batch("first", 2) {
        cluster.publish(&opportunity).await.unwrap();
    }
    let c = cluster.as_ref();
    wait_until(Duration::from_secs(5), POLL, move || async move {
        result_count(c).await >= 2
    })
    .await
    .unwrap();

    // The consumer exits; the supervisor sees a finished task.
    if let Some(stop) = current_stop.lock().await.take() {
        stop.send(true).unwrap();
    }
    let s = &supervisor;
    wait_until(Duration::from_secs(5), POLL, move || async move {
        s.stats("execution").await.is_some_and(|u| u.restarts >= 1)
    })
    .await
    .unwrap();
    wait_until(Duration::from_secs(2), POLL, move || async move {
        i.load(Ordering::SeqCst) == 2
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for opportunity in OpportunityFixture::batch("second", 2) {
        cluster.publish(&opportunity).await.unwrap();
    }
    wait_until(Duration::from_secs(5), POLL, move || async move {
        result_count(c).await >= 4
    })
    .await
    .unwrap();

    let validator = PipelineValidator::new(
        &cluster.forwarded().await.unwrap(),
        &cluster.results().await.unwrap(),
    );
    validator.validate_exactly_once().unwrap();
    assert_eq!(validator.executed_ids().len(), 4);
    wait_until(Duration::from_secs(2), POLL, move || async move {
        s.stats("execution").await.is_some_and(|u| u.healthy)
    })
    .await
    .unwrap();

    stop_supervisor.send(true).unwrap();
    supervisor_task.await.unwrap();
    if let Some(stop) = current_stop.lock().await.take() {
        stop.send(true).unwrap();
    }
    cluster.stop_all().await.unwrap();
}

#[tokio::test]
async fn http_probe_carries_coordinator_health_into_degradation_and_restarts() {
    init_test_logging();
    let cluster = TestCluster::from_toml(CONFIG).unwrap();
    let (node, addr) = cluster.start_coordinator_with_health("coord-a").await.unwrap();

    let restarts = Arc::new(AtomicU32::new(0));
    let restart: RestartFn = {
        let restarts = restarts.clone();
        let broker = cluster.broker().clone();
        Arc::new(move || {
            let restarts = restarts.clone();
            let broker = broker.clone();
            async move {
                restarts.fetch_add(1, Ordering::SeqCst);
                // Reconnecting is what a restart buys the coordinator here.
                broker.set_unavailable(false);
                Ok::<(), String>(())
            }
            .boxed()
        })
    };
    let probe = HttpHealthProbe::new(&format!("http://{addr}/health"), Duration::from_millis(500))
        .unwrap();
    let degradation = Arc::new(DegradationManager::new());
    degradation.register(FORWARDING_CAPABILITY, "opportunities wait on the hand-off stream");
    let supervisor = Supervisor::new(supervisor_config()).with_degradation(degradation.clone());
    supervisor
        .register(Arc::new(ProbedUnit::new("coordinator", Arc::new(probe), restart)))
        .await;

    let publish_round = Duration::from_millis(150);
    tokio::time::sleep(publish_round).await;
    supervisor.tick().await;
    assert!(degradation.is_available(FORWARDING_CAPABILITY));
    assert!(supervisor.stats("coordinator").await.unwrap().healthy);

    // An open forwarding breaker degrades the capability without failing the probe.
    node.forward_breaker().force_open();
    tokio::time::sleep(publish_round).await;
    supervisor.tick().await;
    assert!(!degradation.is_available(FORWARDING_CAPABILITY));
    assert!(supervisor.stats("coordinator").await.unwrap().healthy);

    node.forward_breaker().reset();
    tokio::time::sleep(publish_round).await;
    supervisor.tick().await;
    assert!(degradation.is_available(FORWARDING_CAPABILITY));

    // Persistent read failures turn /health into a 503.
    cluster.broker().set_unavailable(true);
    let n = &node;
    wait_until(Duration::from_secs(2), POLL, move || async move {
        n.stats().read_failures >= 3
    })
    .await
    .unwrap();
    tokio::time::sleep(publish_round).await;

    supervisor.tick().await;
    supervisor.tick().await;
    let stats = supervisor.stats("coordinator").await.unwrap();
    assert!(!stats.healthy);
    assert_eq!(restarts.load(Ordering::SeqCst), 0);

    tokio::time::sleep(supervisor_config().restart_base_delay + Duration::from_millis(10)).await;
    supervisor.tick().await;
    assert_eq!(restarts.load(Ordering::SeqCst), 1);

    let s = &supervisor;
    wait_until(Duration::from_secs(2), POLL, move || async move {
        s.tick().await;
        s.stats("coordinator").await.is_some_and(|u| u.healthy)
    })
    .await
    .unwrap();

    cluster.stop_all().await.unwrap();
}
