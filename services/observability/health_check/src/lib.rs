//! # Health Check
//!
//! Every service embeds a [`HealthCheckServer`] exposing:
//! - `/health` - liveness plus capability flags (503 when unhealthy)
//! - `/ready` - readiness for traffic (503 while starting or unhealthy)
//! - `/status` - the full [`ServiceHealth`] document
//!
//! The supervisor polls `/health` through [`HttpHealthProbe`]; capability flags
//! in the response drive graceful degradation.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use health_check::{HealthCheckServer, HealthStatus, ServiceHealth};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let mut health = ServiceHealth::new("coordinator");
//! health.set_capability("execution-forwarding", true);
//!
//! let server = HealthCheckServer::new(health, 8001);
//! server.update_health(|h| h.status = HealthStatus::Healthy).await;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

mod probe;
mod server;
mod status;

pub use probe::HttpHealthProbe;
pub use server::{HealthCheckServer, SharedHealth};
pub use status::{HealthStatus, ServiceHealth};
