//! Worker liveness probing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use fleet_common::protocol::LIVENESS_PATH;

/// Liveness check against a worker port.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True when the worker on `port` answers its liveness endpoint.
    ///
    /// Must return within the prober's timeout.
    async fn probe(&self, port: u16) -> bool;
}

/// HTTP prober issuing `GET /` with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpProber {
    http_client: Client,
    host: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(host: &str, timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build probe client, using defaults: {}", e);
                Client::new()
            });
        Self {
            http_client,
            host: host.to_string(),
            timeout,
        }
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, LIVENESS_PATH)
    }
}

#[async_trait]
impl HealthProbe for HttpProber {
    async fn probe(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        let request = self.http_client.get(self.url(port)).send();
        // The client timeout already bounds the request; the outer timeout
        // covers the fallback client built without one.
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(resp)) if resp.status().is_success() => true,
            Ok(Ok(resp)) => {
                tracing::debug!("Probe of port {} returned {}", port, resp.status());
                false
            }
            Ok(Err(e)) => {
                tracing::debug!("Probe of port {} failed: {}", port, e);
                false
            }
            Err(_) => {
                tracing::debug!("Probe of port {} timed out after {:?}", port, self.timeout);
                false
            }
        }
    }
}
