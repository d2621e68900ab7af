//! HTTP client for the worker contract.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use fleet_common::protocol::{COMPLETION_PATH, NEXT_TOKEN_PATH, TOKENIZE_PATH};
use fleet_common::NextToken;

use crate::error::{Error, Result};

/// Client for worker processes on one host, bounded by a per-request timeout.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    http_client: Client,
    host: String,
}

impl WorkerClient {
    pub fn new(host: &str, timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build worker client, using defaults: {}", e);
                Client::new()
            });
        Self {
            http_client,
            host: host.to_string(),
        }
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }

    /// Pull the next fragment. With `stop`, the worker halts the generation.
    pub async fn next_token(&self, port: u16, stop: bool) -> Result<NextToken> {
        let mut request = self.http_client.get(self.url(port, NEXT_TOKEN_PATH));
        if stop {
            request = request.query(&[("stop", "true")]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "worker on port {} answered {} to next-token",
                port,
                response.status()
            )));
        }
        response.json::<NextToken>().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("invalid next-token response: {}", e))
        })
    }

    /// Start a generation job. The body is forwarded untouched.
    pub async fn completion(&self, port: u16, body: &Value) -> Result<Value> {
        self.post_json(port, COMPLETION_PATH, body).await
    }

    /// Tokenize text. The body is forwarded untouched.
    pub async fn tokenize(&self, port: u16, body: &Value) -> Result<Value> {
        self.post_json(port, TOKENIZE_PATH, body).await
    }

    async fn post_json(&self, port: u16, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .http_client
            .post(self.url(port, path))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamUnavailable(format!(
                "worker on port {} answered {} to {}: {}",
                port, status, path, text
            )));
        }

        // Workers may answer with an empty body
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::UpstreamUnavailable(format!("invalid response from {}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> WorkerClient {
        WorkerClient::new("127.0.0.1", Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_next_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/next-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"content": "Hi", "stop": false})),
            )
            .mount(&server)
            .await;

        let token = client().next_token(server.address().port(), false).await.unwrap();
        assert_eq!(token, NextToken::fragment("Hi"));
    }

    #[tokio::test]
    async fn test_next_token_stop_sends_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/next-token"))
            .and(query_param("stop", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stop": true})))
            .expect(1)
            .mount(&server)
            .await;

        let token = client().next_token(server.address().port(), true).await.unwrap();
        assert!(token.stop);
    }

    #[tokio::test]
    async fn test_next_token_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/next-token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = client().next_token(server.address().port(), false).await;
        assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_next_token_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/next-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"stop": true}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = WorkerClient::new("127.0.0.1", Duration::from_millis(200));
        let result = client.next_token(server.address().port(), false).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_completion_pass_through() {
        let server = MockServer::start().await;
        let body = json!({"prompt": "Hello", "n_predict": 16});
        Mock::given(method("POST"))
            .and(path("/completion"))
            .and(body_json(body.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let result = client().completion(server.address().port(), &body).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_completion_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let result = client()
            .completion(server.address().port(), &json!({"prompt": "x"}))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_tokenize() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tokenize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tokens": [1, 2, 3]})))
            .mount(&server)
            .await;

        let result = client()
            .tokenize(server.address().port(), &json!({"content": "abc"}))
            .await
            .unwrap();
        assert_eq!(result["tokens"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        // Distinguished from a worker that answered, so a starting worker can be retried
        let result = client().next_token(port, false).await;
        assert!(matches!(result, Err(Error::WorkerNotReady(_))));
    }
}
