use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::{Value, json};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }
}

/// The OpenAI-compatible gateway that fronts the inference backend.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Forwards a chat completion body as-is. Any HTTP status is returned to the
/// caller; only transport failures are errors.
///
/// Non-streaming calls are bounded as a whole by the gateway timeout. For
/// streaming calls it only bounds the wait for response headers; gaps
/// between body chunks are the stream driver's concern.
pub async fn call_chat_completions_raw(
    client: &reqwest::Client,
    gateway: &GatewayConfig,
    body: Bytes,
    stream: bool,
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = join_url(&gateway.base_url, "/v1/chat/completions");
    let mut request = client
        .post(url)
        .bearer_auth(&gateway.api_key)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    if !stream {
        request = request.timeout(gateway.timeout());
    }
    let network = |message: String| UpstreamCallError::new(UpstreamErrorKind::Network, None, message);
    match tokio::time::timeout(gateway.timeout(), request.send()).await {
        Ok(result) => result.map_err(|err| network(err.to_string())),
        Err(_) => Err(network(format!(
            "upstream did not respond within {}ms",
            gateway.timeout_ms
        ))),
    }
}

/// `true` only for an HTTP 200 within `timeout`.
pub async fn probe_health(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(resp) => resp.status() == StatusCode::OK,
        Err(err) => {
            tracing::debug!(url, error = %err, "health probe failed");
            false
        }
    }
}

/// Token count of `text` according to the backend's own tokenizer.
pub async fn tokenize_count(
    client: &reqwest::Client,
    url: &str,
    model: &str,
    text: &str,
) -> Result<u64, UpstreamCallError> {
    if text.is_empty() {
        return Ok(0);
    }
    let resp = client
        .post(url)
        .timeout(Duration::from_secs(10))
        .json(&json!({ "model": model, "prompt": text }))
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("tokenize status {status}"),
        ));
    }
    let value: Value = resp.json().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })?;
    value
        .get("count")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            value
                .get("tokens")
                .and_then(|v| v.as_array())
                .map(|tokens| tokens.len() as u64)
        })
        .ok_or_else(|| {
            UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(status),
                "tokenize response without count".to_string(),
            )
        })
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}
