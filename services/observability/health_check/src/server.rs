use crate::status::{HealthStatus, ServiceHealth};
use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Health document shared between a service and its health server
pub type SharedHealth = Arc<Mutex<ServiceHealth>>;

/// HTTP health check server
pub struct HealthCheckServer {
    health: SharedHealth,
    port: u16,
}

impl HealthCheckServer {
    pub fn new(health: ServiceHealth, port: u16) -> Self {
        Self::with_shared(Arc::new(Mutex::new(health)), port)
    }

    /// Serve a health document the service already holds
    pub fn with_shared(health: SharedHealth, port: u16) -> Self {
        Self { health, port }
    }

    /// Handle for updating the served document
    pub fn shared(&self) -> SharedHealth {
        Arc::clone(&self.health)
    }

    /// Serve on `127.0.0.1:port` until the server fails
    pub async fn start(&self) -> Result<()> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let health = Arc::clone(&self.health);
        let make_svc = make_service_fn(move |_conn| {
            let health = Arc::clone(&health);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, Arc::clone(&health))
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .with_context(|| format!("binding health server to {addr}"))?
            .serve(make_svc);

        info!("Health check server listening on http://{}", addr);
        info!("Endpoints: /health, /ready, /status");

        if let Err(e) = server.await {
            error!("Health check server error: {}", e);
        }
        Ok(())
    }

    /// Bind now and serve in the background until `shutdown` flips to `true`.
    ///
    /// Returns the bound address, so port `0` can be used to pick a free port.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let health = Arc::clone(&self.health);
        let make_svc = make_service_fn(move |_conn| {
            let health = Arc::clone(&health);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, Arc::clone(&health))
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .with_context(|| format!("binding health server to {addr}"))?
            .serve(make_svc);
        let bound = server.local_addr();
        info!("Health check server listening on http://{}", bound);

        let graceful = server.with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        });
        let handle = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                error!("Health check server error: {}", e);
            }
            info!(addr = %bound, "Health check server stopped");
        });
        Ok((bound, handle))
    }

    pub async fn get_health(&self) -> ServiceHealth {
        self.health.lock().await.clone()
    }

    pub async fn update_health<F>(&self, updater: F)
    where
        F: FnOnce(&mut ServiceHealth),
    {
        let mut health = self.health.lock().await;
        updater(&mut health);
    }
}

async fn handle_request(req: Request<Body>, health: SharedHealth) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path();
    let method = req.method();
    debug!("Health check request: {} {}", method, path);

    if method != Method::GET {
        return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
    }

    let snapshot = health.lock().await.clone();
    let response = match path {
        "/health" => health_endpoint(&snapshot),
        "/ready" => ready_endpoint(&snapshot),
        "/status" => status_endpoint(&snapshot),
        _ => text_response(StatusCode::NOT_FOUND, "Not found"),
    };
    Ok(response)
}

/// Liveness plus the capability flags the supervisor feeds into degradation
fn health_endpoint(health: &ServiceHealth) -> Response<Body> {
    let status = if health.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(
        status,
        &serde_json::json!({
            "status": health.status,
            "service": health.service_name,
            "uptime_seconds": health.uptime_seconds(),
            "capabilities": health.capabilities,
            "errors": health.errors,
        }),
    )
}

fn ready_endpoint(health: &ServiceHealth) -> Response<Body> {
    if health.is_ready() {
        json_response(
            StatusCode::OK,
            &serde_json::json!({ "status": "ready", "service": health.service_name }),
        )
    } else {
        json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({
                "status": "not ready",
                "service": health.service_name,
                "current_status": health.status,
            }),
        )
    }
}

fn status_endpoint(health: &ServiceHealth) -> Response<Body> {
    let status = if health.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    json_response(status, health)
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_string_pretty(body) {
        Ok(json) => {
            let mut response = Response::new(Body::from(json));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode health response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding error")
        }
    }
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
}
