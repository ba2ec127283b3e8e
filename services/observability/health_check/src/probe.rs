use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Client, Uri};
use resilience::{HealthProbe, HealthReport};
use std::time::Duration;
use tracing::debug;

/// Polls a `/health` endpoint for the supervisor.
///
/// A 2xx answer within the timeout is healthy. The `capabilities` object of
/// the JSON body, when present, becomes the report's capability flags.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: Client<HttpConnector>,
    uri: Uri,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, hyper::http::uri::InvalidUri> {
        Ok(Self {
            client: Client::new(),
            uri: url.parse()?,
            timeout,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    async fn fetch(&self) -> Result<(bool, serde_json::Value), String> {
        let response = self
            .client
            .get(self.uri.clone())
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let ok = response.status().is_success();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| format!("reading body failed: {e}"))?;
        // A non-JSON body still counts by status code alone.
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        Ok((ok, body))
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> HealthReport {
        let (ok, body) = match tokio::time::timeout(self.timeout, self.fetch()).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(reason)) => {
                debug!(uri = %self.uri, %reason, "Health probe failed");
                return HealthReport::unhealthy(reason);
            }
            Err(_) => {
                return HealthReport::unhealthy(format!("no answer within {:?}", self.timeout));
            }
        };

        let mut report = if ok {
            HealthReport::healthy()
        } else {
            HealthReport::unhealthy(format!("{} reported unhealthy", self.uri))
        };
        if let Some(flags) = body.get("capabilities").and_then(|c| c.as_object()) {
            for (name, available) in flags {
                if let Some(available) = available.as_bool() {
                    report = report.with_capability(name.clone(), available);
                }
            }
        }
        report
    }
}
