//! Cluster harness: named service instances over one broker and lease store

use crate::fixtures::OpportunityFixture;
use crate::partition::PartitionableLeaseStore;
use anyhow::{anyhow, bail, Context, Result};
use coordinator::Coordinator;
use execution_consumer::{ExecutionConsumer, ExecutionStrategy};
use health_check::{HealthCheckServer, ServiceHealth};
use service_config::ServiceConfig;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{InMemoryBroker, InMemoryLeaseStore, StreamBroker};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use types::{
    streams, ExecutionReport, ExecutionRequest, FieldMap, InstanceId, SequenceId, StreamMessage,
};

/// Settle time after spawning a service so its first rounds have run
const STARTUP_GRACE: Duration = Duration::from_millis(50);
const HEALTH_PUBLISH_INTERVAL: Duration = Duration::from_millis(50);
const RANGE_LIMIT: usize = 10_000;

/// What a named instance in the cluster is
#[derive(Clone)]
pub enum ServiceKind {
    Coordinator(Arc<Coordinator>),
    Execution(Arc<ExecutionConsumer>),
}

struct ServiceHandle {
    kind: ServiceKind,
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
    health_server: Option<JoinHandle<()>>,
    leases: Option<Arc<PartitionableLeaseStore>>,
}

/// Several service instances sharing one in-process broker and lease store
pub struct TestCluster {
    config: ServiceConfig,
    broker: Arc<InMemoryBroker>,
    leases: Arc<InMemoryLeaseStore>,
    services: Mutex<BTreeMap<String, ServiceHandle>>,
}

impl TestCluster {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            broker: Arc::new(InMemoryBroker::new(config.broker.stream_max_len)),
            leases: Arc::new(InMemoryLeaseStore::new()),
            services: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    pub fn from_toml(toml: &str) -> Result<Self> {
        let config = ServiceConfig::from_toml_str(toml).context("parsing test cluster config")?;
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    pub fn leases(&self) -> &Arc<InMemoryLeaseStore> {
        &self.leases
    }

    /// Start a coordinator named `name` and give it time for a first election round
    pub async fn start_coordinator(&self, name: &str) -> Result<Arc<Coordinator>> {
        self.launch_coordinator(name, false).await.map(|(node, _)| node)
    }

    /// Start a coordinator that publishes its state on a health server bound to a free port
    pub async fn start_coordinator_with_health(
        &self,
        name: &str,
    ) -> Result<(Arc<Coordinator>, SocketAddr)> {
        let (node, addr) = self.launch_coordinator(name, true).await?;
        let addr = addr.ok_or_else(|| anyhow!("health server for {name} did not bind"))?;
        Ok((node, addr))
    }

    async fn launch_coordinator(
        &self,
        name: &str,
        with_health: bool,
    ) -> Result<(Arc<Coordinator>, Option<SocketAddr>)> {
        self.ensure_unused(name).await?;
        info!(service = name, "Starting coordinator");

        let leases = Arc::new(PartitionableLeaseStore::new(self.leases.clone()));
        let node = Arc::new(Coordinator::new(
            &self.config,
            InstanceId::new(name),
            self.broker.clone(),
            leases.clone(),
        ));
        node.prepare().await?;

        let (stop, shutdown) = watch::channel(false);
        let (health, addr, health_server) = if with_health {
            let server = HealthCheckServer::new(ServiceHealth::new(name), 0);
            let (addr, handle) = server.spawn(shutdown.clone())?;
            (
                Some((server.shared(), HEALTH_PUBLISH_INTERVAL)),
                Some(addr),
                Some(handle),
            )
        } else {
            (None, None, None)
        };

        let runner = node.clone();
        let handle = tokio::spawn(async move {
            runner.run(health, shutdown).await.map_err(anyhow::Error::from)
        });
        self.services.lock().await.insert(
            name.to_string(),
            ServiceHandle {
                kind: ServiceKind::Coordinator(node.clone()),
                stop,
                handle,
                health_server,
                leases: Some(leases),
            },
        );

        tokio::time::sleep(STARTUP_GRACE).await;
        Ok((node, addr))
    }

    /// Start an execution consumer; it joins the group before this returns
    pub async fn start_execution(
        &self,
        name: &str,
        strategy: Arc<dyn ExecutionStrategy>,
    ) -> Result<Arc<ExecutionConsumer>> {
        self.ensure_unused(name).await?;
        info!(service = name, "Starting execution consumer");

        let consumer = Arc::new(ExecutionConsumer::new(
            &self.config,
            InstanceId::new(name),
            self.broker.clone(),
            strategy,
        ));
        consumer.prepare().await?;

        let (stop, shutdown) = watch::channel(false);
        let runner = consumer.clone();
        let handle = tokio::spawn(async move {
            runner.run(None, shutdown).await.map_err(anyhow::Error::from)
        });
        self.services.lock().await.insert(
            name.to_string(),
            ServiceHandle {
                kind: ServiceKind::Execution(consumer.clone()),
                stop,
                handle,
                health_server: None,
                leases: None,
            },
        );

        tokio::time::sleep(STARTUP_GRACE).await;
        Ok(consumer)
    }

    async fn ensure_unused(&self, name: &str) -> Result<()> {
        if self.services.lock().await.contains_key(name) {
            bail!("service {name} is already running");
        }
        Ok(())
    }

    /// Signal shutdown and wait for the service to finish draining
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let service = self
            .services
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| anyhow!("no running service named {name}"))?;
        info!(service = name, "Stopping service");

        // The receiver may already be gone if the service exited on its own.
        let _ = service.stop.send(true);
        service
            .handle
            .await
            .with_context(|| format!("service {name} panicked"))??;
        if let Some(server) = service.health_server {
            server.await.with_context(|| format!("health server of {name} panicked"))?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        let names: Vec<String> = self.services.lock().await.keys().cloned().collect();
        for name in names {
            debug!(service = %name, "Stopping service");
            self.stop_service(&name).await?;
        }
        Ok(())
    }

    /// Cut (or restore) a coordinator's connection to the lease store
    pub async fn set_partitioned(&self, name: &str, partitioned: bool) -> Result<()> {
        let services = self.services.lock().await;
        let leases = services
            .get(name)
            .and_then(|s| s.leases.as_ref())
            .ok_or_else(|| anyhow!("{name} is not a running coordinator"))?;
        leases.set_partitioned(partitioned);
        info!(service = name, partitioned, "Lease store partition changed");
        Ok(())
    }

    pub async fn service(&self, name: &str) -> Option<ServiceKind> {
        self.services.lock().await.get(name).map(|s| s.kind.clone())
    }

    pub async fn coordinators(&self) -> Vec<Arc<Coordinator>> {
        self.services
            .lock()
            .await
            .values()
            .filter_map(|s| match &s.kind {
                ServiceKind::Coordinator(node) => Some(node.clone()),
                ServiceKind::Execution(_) => None,
            })
            .collect()
    }

    pub async fn executors(&self) -> Vec<Arc<ExecutionConsumer>> {
        self.services
            .lock()
            .await
            .values()
            .filter_map(|s| match &s.kind {
                ServiceKind::Execution(consumer) => Some(consumer.clone()),
                ServiceKind::Coordinator(_) => None,
            })
            .collect()
    }

    /// Names of the running coordinators that currently believe they lead
    pub async fn leaders(&self) -> Vec<String> {
        self.coordinators()
            .await
            .iter()
            .filter(|node| node.leader().is_leader())
            .map(|node| node.instance().to_string())
            .collect()
    }

    pub async fn publish(&self, opportunity: &OpportunityFixture) -> Result<SequenceId> {
        self.publish_fields(opportunity.fields()).await
    }

    pub async fn publish_fields(&self, fields: FieldMap) -> Result<SequenceId> {
        Ok(self.broker.append(streams::OPPORTUNITIES, fields).await?)
    }

    async fn entries(&self, stream: &str) -> Result<Vec<StreamMessage>> {
        Ok(self
            .broker
            .range(stream, SequenceId::new(0), RANGE_LIMIT)
            .await?)
    }

    /// Everything routed to `stream:execution-requests` so far
    pub async fn forwarded(&self) -> Result<Vec<ExecutionRequest>> {
        self.entries(streams::EXECUTION_REQUESTS)
            .await?
            .iter()
            .map(|m| ExecutionRequest::from_fields(&m.fields).map_err(anyhow::Error::from))
            .collect()
    }

    /// Everything published to `stream:execution-results` so far
    pub async fn results(&self) -> Result<Vec<ExecutionReport>> {
        self.entries(streams::EXECUTION_RESULTS)
            .await?
            .iter()
            .map(|m| ExecutionReport::from_fields(&m.fields).map_err(anyhow::Error::from))
            .collect()
    }

    pub async fn dead_letter_count(&self) -> Result<usize> {
        Ok(self.broker.len(streams::DEAD_LETTER).await?)
    }
}

/// Poll `check` until it holds, failing after `timeout`.
///
/// Returns how long the condition took to hold.
pub async fn wait_until<F, Fut>(timeout: Duration, poll: Duration, mut check: F) -> Result<Duration>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if check().await {
            return Ok(started.elapsed());
        }
        if started.elapsed() >= timeout {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(poll).await;
    }
}

/// Route service logs to the test output; `RUST_LOG` picks the level
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
