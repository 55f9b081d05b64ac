//! Error taxonomy and HTTP error mapping for the orchestrator.
//!
//! Two concerns live here: the [`ErrorCategory`] classification used by the
//! circuit breakers and the dispatcher's retry policy, and the
//! [`OrchestratorError`] type that maps internal failures onto client-facing
//! HTTP responses.

use actix_web::{http::StatusCode, HttpResponse};
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Classification of an upstream failure, driving breaker accounting and
/// retry decisions.
///
/// # Variants
///
/// * `Permanent` - the backend cannot serve this model until an operator
///   intervenes (out of memory, dead runner, missing model)
/// * `NonRetryable` - the request itself is at fault (4xx, auth, validation);
///   retrying the same payload elsewhere will not help
/// * `Transient` - momentary upstream trouble (5xx, timeouts, resets);
///   failover and same-server retries are worthwhile
/// * `Retryable` - unknown errors; treated optimistically like transient for
///   failover but tracked separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Permanent,
    NonRetryable,
    Transient,
    Retryable,
}

impl ErrorCategory {
    /// Whether the dispatcher may retry this failure on the *same* server.
    pub fn allows_same_server_retry(&self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Retryable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::NonRetryable => "non_retryable",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Retryable => "retryable",
        }
    }
}

static PERMANENT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)out of memory",
        r"(?i)not enough (ram|memory|vram)",
        r"(?i)runner process (has )?terminated",
        r"(?i)model .* not found",
        r"(?i)no such model",
        r"(?i)resource exhaust",
        r"(?i)no space left",
    ])
    .expect("permanent error patterns must compile")
});

static NON_RETRYABLE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)unauthorized",
        r"(?i)authentication",
        r"(?i)invalid (request|argument|json|payload)",
        r"(?i)bad request",
        r"(?i)unsupported",
    ])
    .expect("non-retryable error patterns must compile")
});

static TRANSIENT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)timed? ?out",
        r"(?i)exceeded \d+ms",
        r"(?i)connection (reset|refused|closed|aborted)",
        r"(?i)broken pipe",
        r"(?i)rate.?limit",
        r"(?i)too many requests",
        r"(?i)temporarily unavailable",
        r"(?i)unexpected eof",
        r"(?i)dns error",
    ])
    .expect("transient error patterns must compile")
});

static EMBEDDING_ONLY_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r#"(?i)does not support generat"#,
        r#"(?i)embedding.?only"#,
        r#"(?i)embedding model"#,
        r#"(?i)only supports? embedding"#,
    ])
    .expect("embedding-only patterns must compile")
});

/// Extra operator-supplied classification patterns, compiled from the
/// `circuitBreaker.errorPatterns` configuration section.
#[derive(Debug, Default)]
pub struct ErrorPatternOverrides {
    non_retryable: Option<RegexSet>,
    transient: Option<RegexSet>,
}

impl ErrorPatternOverrides {
    /// Compiles the configured pattern lists. Invalid expressions are dropped
    /// individually with a warning rather than failing the whole set.
    pub fn compile(non_retryable: &[String], transient: &[String]) -> Self {
        let build = |patterns: &[String]| -> Option<RegexSet> {
            let valid: Vec<&String> = patterns
                .iter()
                .filter(|p| match regex::Regex::new(p) {
                    Ok(_) => true,
                    Err(e) => {
                        log::warn!("Ignoring invalid error pattern {:?}: {}", p, e);
                        false
                    }
                })
                .collect();
            if valid.is_empty() {
                None
            } else {
                RegexSet::new(valid).ok()
            }
        };
        Self {
            non_retryable: build(non_retryable),
            transient: build(transient),
        }
    }

    fn matches_non_retryable(&self, message: &str) -> bool {
        self.non_retryable
            .as_ref()
            .map(|s| s.is_match(message))
            .unwrap_or(false)
    }

    fn matches_transient(&self, message: &str) -> bool {
        self.transient
            .as_ref()
            .map(|s| s.is_match(message))
            .unwrap_or(false)
    }
}

/// Classifies an upstream failure from its message and (if present) HTTP
/// status code.
///
/// Precedence: permanent patterns, then operator overrides, then built-in
/// non-retryable/transient patterns, then the status-code class, and finally
/// the `Retryable` default for anything unknown.
pub fn classify_error(
    message: &str,
    status: Option<u16>,
    overrides: &ErrorPatternOverrides,
) -> ErrorCategory {
    if PERMANENT_PATTERNS.is_match(message) {
        return ErrorCategory::Permanent;
    }
    if overrides.matches_non_retryable(message) {
        return ErrorCategory::NonRetryable;
    }
    if overrides.matches_transient(message) {
        return ErrorCategory::Transient;
    }
    if NON_RETRYABLE_PATTERNS.is_match(message) {
        return ErrorCategory::NonRetryable;
    }
    if TRANSIENT_PATTERNS.is_match(message) {
        return ErrorCategory::Transient;
    }
    match status {
        Some(code) if (400..500).contains(&code) => ErrorCategory::NonRetryable,
        Some(code) if code >= 500 => ErrorCategory::Transient,
        _ => ErrorCategory::Retryable,
    }
}

/// Detects the "embedding-only model refused generation" refusal.
///
/// This is a client-routing error, not a backend failure: it must not count
/// against the breaker, and it teaches the orchestrator the model's type.
pub fn is_embedding_only_refusal(message: &str) -> bool {
    EMBEDDING_ONLY_PATTERNS.is_match(message)
}

/// One failed dispatch attempt, carried inside exhaustion errors so clients
/// and operators can see what was tried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Backend that failed
    pub server_id: String,
    /// Error classification for the attempt
    pub category: ErrorCategory,
    /// Truncated upstream error message
    pub message: String,
    /// Upstream HTTP status, if a response was received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

const ATTEMPT_MESSAGE_LIMIT: usize = 200;

impl AttemptFailure {
    pub fn new(
        server_id: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
        status: Option<u16>,
    ) -> Self {
        let mut message = message.into();
        if message.len() > ATTEMPT_MESSAGE_LIMIT {
            let mut cut = ATTEMPT_MESSAGE_LIMIT;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
            message.push_str("...");
        }
        Self {
            server_id: server_id.into(),
            category,
            message,
            status,
        }
    }
}

/// Orchestrator-level errors with HTTP response mapping.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Model not found in fleet: {model}")]
    ModelNotFound { model: String },

    #[error("Model {model} cannot serve {endpoint} requests")]
    CapabilityMismatch { model: String, endpoint: String },

    #[error("Invalid request: {message}")]
    BadRequest { message: String },

    #[error("No healthy candidates for model {model}")]
    NoHealthyCandidates { model: String },

    #[error("All candidates for model {model} are at capacity")]
    AtCapacity { model: String },

    #[error("All candidates exhausted for model {model}")]
    CandidatesExhausted {
        model: String,
        attempts: Vec<AttemptFailure>,
    },

    #[error("Request queue is full")]
    QueueFull,

    #[error("Request timed out in queue")]
    QueueTimeout,

    #[error("Queue is not accepting requests")]
    QueueClosed,

    #[error("Orchestrator is draining")]
    Draining,

    #[error("Upstream error from {url}: {message}")]
    Upstream {
        message: String,
        url: String,
        status: Option<u16>,
    },

    #[error("Upstream request exceeded {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Missing or invalid API key")]
    Unauthorized,

    #[error("Persistence error: {message}")]
    Persistence { message: String },
}

impl OrchestratorError {
    /// Status for exhaustion: 502 when every attempt was transient, 503 for
    /// pure capacity/queue exhaustion, 500 for mixed or unknown mixes.
    fn exhaustion_status(attempts: &[AttemptFailure]) -> StatusCode {
        if attempts.is_empty() {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        let all_transient = attempts
            .iter()
            .all(|a| matches!(a.category, ErrorCategory::Transient));
        if all_transient {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::ModelNotFound { .. } => "model_not_found",
            OrchestratorError::CapabilityMismatch { .. } => "capability_mismatch",
            OrchestratorError::BadRequest { .. } => "bad_request",
            OrchestratorError::NoHealthyCandidates { .. } => "no_healthy_candidates",
            OrchestratorError::AtCapacity { .. } => "at_capacity",
            OrchestratorError::CandidatesExhausted { .. } => "candidates_exhausted",
            OrchestratorError::QueueFull => "queue_full",
            OrchestratorError::QueueTimeout => "queue_timeout",
            OrchestratorError::QueueClosed => "queue_closed",
            OrchestratorError::Draining => "draining",
            OrchestratorError::Upstream { .. } => "upstream",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::Config { .. } => "config",
            OrchestratorError::Unauthorized => "unauthorized",
            OrchestratorError::Persistence { .. } => "persistence",
        }
    }
}

impl actix_web::error::ResponseError for OrchestratorError {
    fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::CapabilityMismatch { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::NoHealthyCandidates { .. } => StatusCode::BAD_GATEWAY,
            OrchestratorError::AtCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::CandidatesExhausted { attempts, .. } => {
                Self::exhaustion_status(attempts)
            }
            OrchestratorError::QueueFull | OrchestratorError::QueueTimeout => {
                StatusCode::TOO_MANY_REQUESTS
            }
            OrchestratorError::QueueClosed | OrchestratorError::Draining => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            OrchestratorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::Config { .. } | OrchestratorError::Persistence { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            OrchestratorError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = json!({
            "error": self.to_string(),
            "type": self.kind(),
        });

        match self {
            OrchestratorError::CandidatesExhausted { attempts, .. } => {
                body["attempts"] = serde_json::to_value(attempts).unwrap_or_default();
            }
            OrchestratorError::QueueFull | OrchestratorError::QueueTimeout => {
                body["retry_after_ms"] = json!(1000);
            }
            _ => {}
        }

        HttpResponse::build(self.status_code()).json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_before_status() {
        let overrides = ErrorPatternOverrides::default();
        assert_eq!(
            classify_error("model 'llama3' not found", Some(500), &overrides),
            ErrorCategory::Permanent
        );
        assert_eq!(
            classify_error("not enough RAM to load model", None, &overrides),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn classifies_by_status_when_message_is_unknown() {
        let overrides = ErrorPatternOverrides::default();
        assert_eq!(
            classify_error("weird upstream failure", Some(503), &overrides),
            ErrorCategory::Transient
        );
        assert_eq!(
            classify_error("weird upstream failure", Some(422), &overrides),
            ErrorCategory::NonRetryable
        );
        assert_eq!(
            classify_error("weird upstream failure", None, &overrides),
            ErrorCategory::Retryable
        );
    }

    #[test]
    fn operator_overrides_take_effect() {
        let overrides =
            ErrorPatternOverrides::compile(&["(?i)quota exceeded".to_string()], &[]);
        assert_eq!(
            classify_error("Quota exceeded for tenant", None, &overrides),
            ErrorCategory::NonRetryable
        );
    }

    #[test]
    fn embedding_refusal_is_detected() {
        assert!(is_embedding_only_refusal(
            "\"nomic-embed-text\" does not support generate"
        ));
        assert!(!is_embedding_only_refusal("connection reset by peer"));
    }

    #[test]
    fn attempt_messages_are_truncated() {
        let attempt =
            AttemptFailure::new("a", ErrorCategory::Transient, "x".repeat(500), None);
        assert!(attempt.message.len() <= ATTEMPT_MESSAGE_LIMIT + 3);
    }
}
