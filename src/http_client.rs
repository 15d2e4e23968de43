use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::auth::renewal::calculate_backoff_delay;
use crate::auth::{AuthRequest, AuthTransport, ResponseFormat};
use crate::error::TransportFailure;

/// Upper bound for a single retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// reqwest-backed transport for authorization server exchanges
pub struct ReqwestTransport {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Maximum number of retries (0 disables retrying)
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ReqwestTransport {
    /// Create a new transport
    pub fn new(connect_timeout: u64, request_timeout: u64, max_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    fn build(&self, request: &AuthRequest) -> RequestBuilder {
        let accept = match request.response_format {
            ResponseFormat::Json => "application/json",
            ResponseFormat::Text => "text/plain, */*",
        };

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .header(header::ACCEPT, accept)
            .form(&request.body);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
    }

    /// Exponential backoff delay with jitter, capped at `MAX_RETRY_DELAY`
    fn retry_delay(&self, attempt: u32) -> Duration {
        calculate_backoff_delay(attempt, Duration::from_millis(self.base_delay_ms), MAX_RETRY_DELAY)
    }
}

#[async_trait]
impl AuthTransport for ReqwestTransport {
    /// Execute a request, retrying 429/5xx and network errors with backoff
    async fn send(&self, request: AuthRequest) -> Result<Value, TransportFailure> {
        let mut attempt = 0;

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            "Sending authorization server request"
        );

        loop {
            match self.build(&request).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Authorization server request successful");
                        let text = response.text().await.map_err(|e| {
                            TransportFailure::new(
                                Some(status.as_u16()),
                                format!("Failed to read response body: {}", e),
                                Value::Null,
                            )
                        })?;
                        return parse_success(status, text, request.response_format);
                    }

                    if is_retryable(status) && attempt < self.max_retries {
                        let delay = self.retry_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay.as_millis(),
                            attempt + 1,
                            self.max_retries
                        );

                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();

                    tracing::error!(
                        status = status.as_u16(),
                        url = %request.url,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "Authorization server request failed with error response"
                    );

                    let body = serde_json::from_str(&error_text)
                        .unwrap_or_else(|_| Value::String(error_text.clone()));
                    return Err(TransportFailure::new(
                        Some(status.as_u16()),
                        format!("{} - {}", status, error_text),
                        body,
                    ));
                }

                Err(e) => {
                    // Categorize the error for better debugging
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else if e.is_decode() {
                        "decode_error"
                    } else {
                        "unknown"
                    };

                    tracing::warn!(
                        error_kind = error_kind,
                        error = %e,
                        url = %request.url,
                        attempt = attempt + 1,
                        "Authorization server request error"
                    );

                    if attempt < self.max_retries {
                        tokio::time::sleep(self.retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(TransportFailure::new(
                        None,
                        format!("HTTP request failed: {} (kind: {})", e, error_kind),
                        Value::Null,
                    ));
                }
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Decode a 2xx body according to the expected format
fn parse_success(status: StatusCode, text: String, format: ResponseFormat) -> Result<Value, TransportFailure> {
    match format {
        ResponseFormat::Text => Ok(Value::String(text)),
        ResponseFormat::Json => serde_json::from_str(&text).map_err(|e| {
            tracing::error!("Authorization server returned invalid JSON: {}", e);
            TransportFailure::new(
                Some(status.as_u16()),
                format!("Invalid JSON response: {}", e),
                Value::String(text),
            )
        }),
    }
}
