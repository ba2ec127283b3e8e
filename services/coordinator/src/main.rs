use anyhow::{Context, Result};
use coordinator::Coordinator;
use health_check::{HealthCheckServer, HealthStatus, ServiceHealth};
use resilience::retry;
use service_config::{BrokerBackend, ServiceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{
    connect, BrokerError, InMemoryBroker, InMemoryLeaseStore, LeaseStore, RedisBroker,
    RedisLeaseStore, StreamBroker,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use types::InstanceId;

const HEALTH_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Broker and lease store for the configured backend
async fn backend(config: &ServiceConfig) -> Result<(Arc<dyn StreamBroker>, Arc<dyn LeaseStore>)> {
    match config.broker.backend {
        BrokerBackend::Memory => {
            warn!("In-memory broker: streams and the leader lease are local to this process");
            Ok((
                Arc::new(InMemoryBroker::new(config.broker.stream_max_len)),
                Arc::new(InMemoryLeaseStore::new()),
            ))
        }
        BrokerBackend::Redis => {
            let url = config.broker.url.as_str();
            let conn = retry(&config.retry.policy(), BrokerError::is_retryable, |_| connect(url))
                .await
                .with_context(|| format!("Failed to connect to redis at {url}"))?;
            Ok((
                Arc::new(RedisBroker::new(conn.clone(), config.broker.stream_max_len)),
                Arc::new(RedisLeaseStore::new(conn)),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let environment = std::env::var("OPPFLOW_ENV").ok();
    let config = ServiceConfig::load(config_path.as_deref(), environment.as_deref())
        .context("Failed to load coordinator configuration")?;
    config.validate()?;
    config.logging.init()?;

    let instance = config
        .instance
        .id
        .clone()
        .map(InstanceId::new)
        .unwrap_or_else(|| InstanceId::generate("coordinator"));
    info!(%instance, "🚀 Starting coordinator");

    if config.instance.id.is_none() {
        warn!("No instance.id configured; parked entries will not be recovered after a restart");
    }

    let (broker, leases) = backend(&config).await?;
    let coordinator = Arc::new(Coordinator::new(&config, instance, broker, leases));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut health = ServiceHealth::new("coordinator");
    health.set_status(HealthStatus::Starting);
    let server = HealthCheckServer::new(health, config.instance.health_port);
    let (addr, server_task) = server.spawn(shutdown_rx.clone())?;
    info!(%addr, "🩺 Health endpoint listening");

    let service = tokio::spawn(
        coordinator
            .clone()
            .run(Some((server.shared(), HEALTH_PUBLISH_INTERVAL)), shutdown_rx),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    match service.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Coordinator failed"),
        Err(e) => error!(error = %e, "Coordinator task panicked"),
    }
    let _ = server_task.await;

    info!(stats = ?coordinator.stats(), "👋 Coordinator exited");
    Ok(())
}
