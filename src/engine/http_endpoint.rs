// HTTP client for the agent platform's trigger endpoint

use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use crate::engine::invoker::{CallMeta, ExternalEndpoint};
use crate::engine::retry::CallError;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// POSTs the payload as JSON and classifies the response for the retry loop
pub struct HttpTriggerEndpoint {
    name: String,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: Client,
}

impl HttpTriggerEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            name: name.into(),
            url: url.into(),
            api_key: None,
            timeout,
            client,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl ExternalEndpoint for HttpTriggerEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, payload: &Value, meta: &CallMeta) -> Result<Value, CallError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CORRELATION_HEADER, &meta.correlation_id)
            .json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!(endpoint = %self.name, url = %self.url, correlation_id = %meta.correlation_id, "POST trigger");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout(self.timeout)
            } else {
                CallError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| CallError::Network(e.to_string()))?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_slice(&bytes).map_err(|e| CallError::Client {
                status: status.as_u16(),
                message: format!("invalid JSON response: {}", e),
            });
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        error!(endpoint = %self.name, status = status.as_u16(), "Trigger endpoint returned error: {}", body);
        Err(CallError::from_status(status.as_u16(), body, retry_after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::post,
        Json, Router,
    };
    use serde_json::json;
    use std::net::TcpListener;

    async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });
        format!("http://{}/trigger", addr)
    }

    #[tokio::test]
    async fn test_success_returns_json_and_forwards_correlation_id() {
        let app = Router::new().route(
            "/trigger",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let correlation = headers
                    .get(CORRELATION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({"accepted": true, "correlation": correlation, "scope": body["scope"]}))
            }),
        );
        let endpoint = HttpTriggerEndpoint::new("platform", spawn(app).await, Duration::from_secs(5));

        let response = endpoint
            .call(&json!({"scope": "quick"}), &CallMeta::new("corr-42", "quick"))
            .await
            .unwrap();
        assert_eq!(response["correlation"], "corr-42");
        assert_eq!(response["scope"], "quick");
    }

    #[tokio::test]
    async fn test_error_statuses_are_classified() {
        let app = Router::new().route(
            "/trigger",
            post(|Json(body): Json<Value>| async move {
                match body["mode"].as_str() {
                    Some("throttle") => {
                        (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "7")], "slow down").into_response()
                    }
                    Some("down") => (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response(),
                    _ => (StatusCode::UNPROCESSABLE_ENTITY, "unknown scope").into_response(),
                }
            }),
        );
        let endpoint = HttpTriggerEndpoint::new("platform", spawn(app).await, Duration::from_secs(5));
        let meta = CallMeta::new("corr-1", "quick");

        let throttled = endpoint.call(&json!({"mode": "throttle"}), &meta).await.unwrap_err();
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(7)));

        let down = endpoint.call(&json!({"mode": "down"}), &meta).await.unwrap_err();
        assert!(matches!(down, CallError::Server { status: 503, .. }));

        let rejected = endpoint.call(&json!({"mode": "bad"}), &meta).await.unwrap_err();
        assert!(!rejected.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let endpoint = HttpTriggerEndpoint::new("platform", "http://127.0.0.1:1/trigger", Duration::from_secs(2));
        let err = endpoint
            .call(&json!({}), &CallMeta::new("corr-1", "quick"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
