//! Outbound communication with inference backends.
//!
//! [`UpstreamClient`] is the seam between the routing engine and the wire:
//! the production implementation wraps one pooled reqwest client, and tests
//! substitute a scripted mock. Responses come back as a tagged variant so
//! the dispatcher can pass streams through without buffering while still
//! extracting token counts opportunistically.

use crate::models::error::OrchestratorError;
use crate::models::server::{HardwareSnapshot, LoadedModel, ServerRecord};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;

/// Which upstream operation a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Generate,
    Chat,
    Embeddings,
}

impl EndpointKind {
    pub fn path(&self) -> &'static str {
        match self {
            EndpointKind::Generate => "/api/generate",
            EndpointKind::Chat => "/api/chat",
            EndpointKind::Embeddings => "/api/embeddings",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Generate => "generate",
            EndpointKind::Chat => "chat",
            EndpointKind::Embeddings => "embeddings",
        }
    }

    /// Whether the endpoint requires generation capability (as opposed to
    /// embedding capability).
    pub fn requires_generation(&self) -> bool {
        !matches!(self, EndpointKind::Embeddings)
    }
}

/// Response body: fully buffered, or a chunk stream passed through as-is.
pub enum UpstreamBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, OrchestratorError>>),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            UpstreamBody::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// One upstream response with opportunistically extracted token counts.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: UpstreamBody,
    pub tokens_generated: Option<u64>,
    pub tokens_prompt: Option<u64>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Error text for non-success responses: the upstream `error` field when
    /// the body is JSON, otherwise the raw body prefix.
    pub fn error_message(&self) -> String {
        match &self.body {
            UpstreamBody::Full(bytes) => {
                if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
                    if let Some(message) = value.get("error").and_then(Value::as_str) {
                        return message.to_string();
                    }
                }
                String::from_utf8_lossy(&bytes[..bytes.len().min(200)]).to_string()
            }
            UpstreamBody::Stream(_) => format!("upstream returned status {}", self.status),
        }
    }
}

/// Pulls generation/prompt token counts out of a response body, tolerating
/// both native (`eval_count`) and OpenAI-compatible (`usage.*`) shapes.
pub fn extract_token_counts(value: &Value) -> (Option<u64>, Option<u64>) {
    let generated = value
        .get("eval_count")
        .and_then(Value::as_u64)
        .or_else(|| {
            value
                .pointer("/usage/completion_tokens")
                .and_then(Value::as_u64)
        });
    let prompt = value
        .get("prompt_eval_count")
        .and_then(Value::as_u64)
        .or_else(|| value.pointer("/usage/prompt_tokens").and_then(Value::as_u64));
    (generated, prompt)
}

/// Loaded-models payload entry as backends report it.
#[derive(Debug, Deserialize)]
struct LoadedModelWire {
    name: String,
    #[serde(default)]
    size_vram: Option<u64>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ModelsWire {
    #[serde(default)]
    models: Vec<Value>,
}

/// Outbound client for one kind of homogeneous backend fleet.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetches the model list (names only).
    async fn list_models(
        &self,
        server: &ServerRecord,
        timeout: Duration,
    ) -> Result<Vec<String>, OrchestratorError>;

    /// Fetches the backend version string.
    async fn version(
        &self,
        server: &ServerRecord,
        timeout: Duration,
    ) -> Result<String, OrchestratorError>;

    /// Fetches the loaded-models hardware snapshot.
    async fn loaded_models(
        &self,
        server: &ServerRecord,
        timeout: Duration,
    ) -> Result<HardwareSnapshot, OrchestratorError>;

    /// Forwards an inference request. Network-level failures and timeouts
    /// are `Err`; HTTP error statuses come back as responses so the
    /// dispatcher can classify them from the body.
    async fn forward(
        &self,
        server: &ServerRecord,
        endpoint: EndpointKind,
        payload: Value,
        streaming: bool,
        timeout: Duration,
    ) -> Result<UpstreamResponse, OrchestratorError>;
}

/// Production implementation over a pooled reqwest client.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new() -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| OrchestratorError::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    fn apply_credentials(
        &self,
        server: &ServerRecord,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match &server.api_key {
            Some(key) => {
                let header = server
                    .api_key_header
                    .as_deref()
                    .unwrap_or("authorization");
                if header.eq_ignore_ascii_case("authorization") {
                    request.header(header, format!("Bearer {}", key))
                } else {
                    request.header(header, key.as_str())
                }
            }
            None => request,
        }
    }

    async fn get_json(
        &self,
        server: &ServerRecord,
        path: &str,
        limit: Duration,
    ) -> Result<Value, OrchestratorError> {
        let url = format!("{}{}", server.url, path);
        let request = self.apply_credentials(server, self.client.get(&url));
        let response = timeout(limit, request.send())
            .await
            .map_err(|_| OrchestratorError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })?
            .map_err(|e| OrchestratorError::Upstream {
                message: e.to_string(),
                url: url.clone(),
                status: None,
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Upstream {
                message: body.chars().take(200).collect(),
                url,
                status: Some(status.as_u16()),
            });
        }
        timeout(limit, response.json::<Value>())
            .await
            .map_err(|_| OrchestratorError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })?
            .map_err(|e| OrchestratorError::Upstream {
                message: e.to_string(),
                url,
                status: Some(status.as_u16()),
            })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn list_models(
        &self,
        server: &ServerRecord,
        limit: Duration,
    ) -> Result<Vec<String>, OrchestratorError> {
        let value = self.get_json(server, "/api/tags", limit).await?;
        let wire: ModelsWire = serde_json::from_value(value).unwrap_or(ModelsWire { models: vec![] });
        Ok(wire
            .models
            .iter()
            .filter_map(|m| m.get("name").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn version(
        &self,
        server: &ServerRecord,
        limit: Duration,
    ) -> Result<String, OrchestratorError> {
        let value = self.get_json(server, "/api/version", limit).await?;
        Ok(value
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    async fn loaded_models(
        &self,
        server: &ServerRecord,
        limit: Duration,
    ) -> Result<HardwareSnapshot, OrchestratorError> {
        let value = self.get_json(server, "/api/ps", limit).await?;
        let wire: ModelsWire = serde_json::from_value(value).unwrap_or(ModelsWire { models: vec![] });
        let models = wire
            .models
            .into_iter()
            .filter_map(|m| serde_json::from_value::<LoadedModelWire>(m).ok())
            .map(|m| LoadedModel {
                vram_bytes: m.size_vram.or(m.size).unwrap_or(0),
                name: m.name,
                expires_at: m.expires_at,
            })
            .collect();
        Ok(HardwareSnapshot {
            models,
            captured_at: Utc::now(),
        })
    }

    async fn forward(
        &self,
        server: &ServerRecord,
        endpoint: EndpointKind,
        payload: Value,
        streaming: bool,
        limit: Duration,
    ) -> Result<UpstreamResponse, OrchestratorError> {
        let url = format!("{}{}", server.url, endpoint.path());
        debug!("forwarding {} request to {}", endpoint.as_str(), url);
        let request = self
            .apply_credentials(server, self.client.post(&url))
            .json(&payload);

        // The per-attempt timeout covers connection and response headers;
        // stream bodies are allowed to run past it and are bounded by the
        // streaming timeout at the orchestrator level.
        let response = timeout(limit, request.send())
            .await
            .map_err(|_| OrchestratorError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })?
            .map_err(|e| OrchestratorError::Upstream {
                message: e.to_string(),
                url: url.clone(),
                status: None,
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if streaming && (200..300).contains(&status) {
            let stream = response
                .bytes_stream()
                .map(move |chunk| {
                    chunk.map_err(|e| OrchestratorError::Upstream {
                        message: e.to_string(),
                        url: url.clone(),
                        status: None,
                    })
                })
                .boxed();
            return Ok(UpstreamResponse {
                status,
                content_type,
                body: UpstreamBody::Stream(stream),
                tokens_generated: None,
                tokens_prompt: None,
            });
        }

        let bytes = timeout(limit, response.bytes())
            .await
            .map_err(|_| OrchestratorError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })?
            .map_err(|e| OrchestratorError::Upstream {
                message: e.to_string(),
                url: url.clone(),
                status: Some(status),
            })?;

        let (tokens_generated, tokens_prompt) = serde_json::from_slice::<Value>(&bytes)
            .map(|value| extract_token_counts(&value))
            .unwrap_or((None, None));

        Ok(UpstreamResponse {
            status,
            content_type,
            body: UpstreamBody::Full(bytes),
            tokens_generated,
            tokens_prompt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_counts_from_native_shape() {
        let value = json!({ "eval_count": 42, "prompt_eval_count": 7 });
        assert_eq!(extract_token_counts(&value), (Some(42), Some(7)));
    }

    #[test]
    fn token_counts_from_openai_shape() {
        let value = json!({ "usage": { "completion_tokens": 11, "prompt_tokens": 3 } });
        assert_eq!(extract_token_counts(&value), (Some(11), Some(3)));
    }

    #[test]
    fn error_message_prefers_json_error_field() {
        let response = UpstreamResponse {
            status: 500,
            content_type: None,
            body: UpstreamBody::Full(Bytes::from_static(
                br#"{"error":"not enough RAM to load model"}"#,
            )),
            tokens_generated: None,
            tokens_prompt: None,
        };
        assert_eq!(response.error_message(), "not enough RAM to load model");
    }
}
