//! Backend server records and hardware snapshots.
//!
//! A [`ServerRecord`] is the orchestrator's view of one inference backend:
//! identity, declared capacity, discovered capabilities and model list, and
//! the health/draining/maintenance bits the candidate filter consults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of workload a model can serve.
///
/// Learned from probes (a generation probe that gets refused with an
/// embedding-only message flips the type) and persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Generation,
    Embedding,
}

/// One model resident in backend memory, as reported by the loaded-models
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedModel {
    /// Model name as reported by the backend
    pub name: String,
    /// VRAM occupied by the model, in bytes
    pub vram_bytes: u64,
    /// When the backend expects to evict the model, if reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of what a backend holds in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    /// Models currently loaded with their VRAM sizes
    pub models: Vec<LoadedModel>,
    /// When this snapshot was taken
    pub captured_at: DateTime<Utc>,
}

impl HardwareSnapshot {
    /// VRAM occupied by `model`, if the snapshot knows it.
    pub fn vram_for(&self, model: &str) -> Option<u64> {
        self.models
            .iter()
            .find(|m| m.name == model)
            .map(|m| m.vram_bytes)
    }
}

/// The orchestrator's record of one inference backend.
///
/// # Invariants
///
/// - `id` and the normalized `url` are unique across the fleet (enforced by
///   the fleet registry on insert).
/// - `healthy == true` implies the most recent probe succeeded and the
///   server-level breaker is not open.
/// - `draining == true` admits no new requests but lets in-flight work finish.
/// - `maintenance == true` excludes the server from routing entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Stable identifier, unique across the fleet
    pub id: String,
    /// Normalized base URL (scheme + host + port, no trailing slash)
    pub url: String,
    /// Maximum concurrent regular requests this backend should receive
    pub max_concurrency: u32,
    /// Whether the backend serves generation requests
    pub supports_generation: bool,
    /// Whether the backend also exposes an OpenAI-compatible surface
    pub supports_openai_compatible: bool,
    /// Liveness bit maintained by the health checker
    pub healthy: bool,
    /// Drain bit: no new admissions, in-flight continues
    pub draining: bool,
    /// Maintenance bit: full exclusion from routing
    pub maintenance: bool,
    /// Models discovered via the model-listing endpoint
    pub models: Vec<String>,
    /// Models discovered on the OpenAI-compatible surface, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_models: Option<Vec<String>>,
    /// Per-server credential, sent via `api_key_header` when present
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Header used to pass the credential (defaults to `authorization`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_header: Option<String>,
    /// Backend version from the version endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Last hardware snapshot (loaded models with VRAM sizes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareSnapshot>,
    /// Latency of the last successful health probe, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_latency_ms: Option<u64>,
    /// When the last probe (success or failure) completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Consecutive failed health probes
    #[serde(default)]
    pub consecutive_probe_failures: u32,
    /// Consecutive successful health probes
    #[serde(default)]
    pub consecutive_probe_successes: u32,
}

impl ServerRecord {
    /// Whether the candidate filter may consider this server at all.
    pub fn routable(&self) -> bool {
        self.healthy && !self.draining && !self.maintenance
    }

    /// Whether the server lists `model` (exact name match; tag resolution is
    /// the fleet registry's job).
    pub fn hosts_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Validates identity and capacity fields.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("server id cannot be empty".to_string());
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!(
                "server url must include protocol (http:// or https://): {}",
                self.url
            ));
        }
        if self.max_concurrency == 0 {
            return Err(format!("server {} max_concurrency must be >= 1", self.id));
        }
        Ok(())
    }
}

/// Normalizes a base URL for uniqueness comparisons: lowercases the scheme
/// and host and strips any trailing slashes.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = match rest.split_once('/') {
                Some((host, path)) => (host, Some(path)),
                None => (rest, None),
            };
            let mut normalized = format!("{}://{}", scheme.to_lowercase(), host.to_lowercase());
            if let Some(path) = path {
                normalized.push('/');
                normalized.push_str(path);
            }
            normalized
        }
        None => trimmed.to_string(),
    }
}

/// Admin-facing specification for registering a backend. Fields the
/// orchestrator discovers on its own (models, version, hardware) are absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerSpec {
    /// Stable identifier; generated when omitted
    #[serde(default)]
    pub id: Option<String>,
    /// Base URL of the backend
    pub url: String,
    /// Maximum concurrent regular requests; falls back to
    /// `cooldown.defaultMaxConcurrency` when omitted
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    /// Credential passed on outbound requests, if the backend needs one
    #[serde(default)]
    pub api_key: Option<String>,
    /// Header used for the credential
    #[serde(default)]
    pub api_key_header: Option<String>,
}

impl ServerSpec {
    /// Builds a fresh record from this spec. New servers start unhealthy until
    /// the first probe succeeds.
    pub fn into_record(self, default_max_concurrency: u32) -> ServerRecord {
        ServerRecord {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            url: normalize_url(&self.url),
            max_concurrency: self.max_concurrency.unwrap_or(default_max_concurrency),
            supports_generation: true,
            supports_openai_compatible: false,
            healthy: false,
            draining: false,
            maintenance: false,
            models: Vec::new(),
            openai_models: None,
            api_key: self.api_key,
            api_key_header: self.api_key_header,
            version: None,
            hardware: None,
            last_probe_latency_ms: None,
            last_probe_at: None,
            consecutive_probe_failures: 0,
            consecutive_probe_successes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_normalization_strips_trailing_slash_and_case() {
        assert_eq!(
            normalize_url("HTTP://Backend-1:11434/"),
            "http://backend-1:11434"
        );
        assert_eq!(
            normalize_url("https://Host/v1/"),
            "https://host/v1"
        );
    }

    #[test]
    fn spec_defaults_are_applied() {
        let spec = ServerSpec {
            id: None,
            url: "http://b1:11434".to_string(),
            max_concurrency: None,
            api_key: None,
            api_key_header: None,
        };
        let record = spec.into_record(4);
        assert_eq!(record.max_concurrency, 4);
        assert!(!record.healthy);
        assert!(!record.id.is_empty());
    }

    #[test]
    fn validation_rejects_bad_urls() {
        let record = ServerSpec {
            id: Some("a".to_string()),
            url: "backend:11434".to_string(),
            max_concurrency: Some(2),
            api_key: None,
            api_key_header: None,
        }
        .into_record(4);
        assert!(record.validate().is_err());
    }
}
