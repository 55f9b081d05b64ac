//! The orchestrator: candidate filtering, failover-first dispatch, queue
//! admission, cooldowns, bans, adaptive timeouts and draining.
//!
//! Dispatch runs in three phases: every ranked candidate is tried once
//! (failover first), then the ranked list is retried once more, and finally
//! bounded same-server retries run against the best-ranked candidate with
//! exponential backoff. Same-server retries are reserved for transient and
//! unknown errors with retryable upstream statuses.
//!
//! Streaming responses pass through chunk-by-chunk. Once the first byte has
//! been written the orchestrator never retries; a mid-stream failure emits a
//! terminal error frame and records a transient failure.

use crate::models::error::{
    classify_error, is_embedding_only_refusal, AttemptFailure, ErrorCategory,
    ErrorPatternOverrides, OrchestratorError,
};
use crate::models::server::ModelType;
use crate::models::settings::Settings;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use crate::services::fleet::Fleet;
use crate::services::history::{DecisionLogEntry, HistoryStore, RequestHistoryEntry};
use crate::services::load_balancer::{Candidate, LoadBalancer, LoadBalancerFactory, RankedCandidate};
use crate::services::metrics::{InFlightGuard, MetricsAggregator, RequestObservation};
use crate::services::persistence::{PersistKind, PersistenceManager};
use crate::services::queue::RequestQueue;
use crate::services::recovery::RecoveryTestCoordinator;
use crate::services::upstream::{
    extract_token_counts, EndpointKind, UpstreamBody, UpstreamClient, UpstreamResponse,
};
use crate::utils::model::model_key;
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default per-attempt outbound timeout before any adaptation, and the
/// clamp bounds for adapted timeouts.
const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 120_000;
const MIN_ADAPTED_TIMEOUT_MS: u64 = 15_000;
const MAX_ADAPTED_TIMEOUT_MS: u64 = 600_000;

/// One inbound inference request, already parsed by the front door.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model: String,
    pub endpoint: EndpointKind,
    pub payload: Value,
    pub streaming: bool,
    pub priority: i32,
}

/// Routing details surfaced through the opt-in debug headers.
#[derive(Debug, Clone)]
pub struct DispatchDebug {
    pub server_id: String,
    pub server_breaker: CircuitState,
    pub model_breaker: CircuitState,
    pub candidate_count: usize,
    pub retry_count: u32,
}

/// Response handed back to the front door.
pub enum ClientResponse {
    Buffered {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },
    Streaming {
        content_type: Option<String>,
        stream: BoxStream<'static, Result<Bytes, OrchestratorError>>,
    },
}

impl std::fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientResponse::Buffered {
                status,
                content_type,
                body,
            } => f
                .debug_struct("Buffered")
                .field("status", status)
                .field("content_type", content_type)
                .field("body_len", &body.len())
                .finish(),
            ClientResponse::Streaming { content_type, .. } => f
                .debug_struct("Streaming")
                .field("content_type", content_type)
                .finish(),
        }
    }
}

/// A successful dispatch.
#[derive(Debug)]
pub struct DispatchSuccess {
    pub response: ClientResponse,
    pub debug: DispatchDebug,
}

/// Why a single attempt failed.
#[derive(Debug, Clone)]
struct AttemptError {
    category: ErrorCategory,
    message: String,
    status: Option<u16>,
    /// The model refused generation because it is embedding-only
    embedding_refusal: bool,
    /// The breaker blocked the attempt; nothing was sent upstream
    blocked: bool,
}

/// Candidate filter outcome with enough detail to pick the right error.
struct FilterOutcome {
    candidates: Vec<Candidate>,
    hosting_count: usize,
    capability_blocked: usize,
    capacity_blocked: usize,
}

/// Aggregate statistics for one (server,model) key on the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeyStats {
    pub server_id: String,
    pub model: String,
    pub in_flight: u64,
    pub in_cooldown: bool,
    pub banned: bool,
    pub timeout_ms: Option<u64>,
    pub breaker: Option<crate::services::circuit_breaker::BreakerSnapshot>,
    pub metrics: crate::services::metrics::KeyMetricsSnapshot,
}

pub struct Orchestrator {
    settings: RwLock<Settings>,
    fleet: Arc<Fleet>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
    balancer: RwLock<Arc<dyn LoadBalancer>>,
    queue: Arc<RequestQueue>,
    recovery: Arc<RecoveryTestCoordinator>,
    upstream: Arc<dyn UpstreamClient>,
    history: Arc<HistoryStore>,
    persistence: Arc<PersistenceManager>,
    overrides: ErrorPatternOverrides,
    cooldowns: Mutex<AHashMap<String, Instant>>,
    bans: Mutex<AHashSet<String>>,
    timeouts: RwLock<AHashMap<String, u64>>,
    draining: AtomicBool,
    pump_notify: Arc<Notify>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        fleet: Arc<Fleet>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<MetricsAggregator>,
        queue: Arc<RequestQueue>,
        recovery: Arc<RecoveryTestCoordinator>,
        upstream: Arc<dyn UpstreamClient>,
        history: Arc<HistoryStore>,
        persistence: Arc<PersistenceManager>,
    ) -> Arc<Self> {
        let balancer = LoadBalancerFactory::create(&settings.load_balancer);
        let overrides = ErrorPatternOverrides::compile(
            &settings.circuit_breaker.error_patterns.non_retryable,
            &settings.circuit_breaker.error_patterns.transient,
        );
        Arc::new(Self {
            settings: RwLock::new(settings),
            fleet,
            breakers,
            metrics,
            balancer: RwLock::new(balancer),
            queue,
            recovery,
            upstream,
            history,
            persistence,
            overrides,
            cooldowns: Mutex::new(AHashMap::new()),
            bans: Mutex::new(AHashSet::new()),
            timeouts: RwLock::new(AHashMap::new()),
            draining: AtomicBool::new(false),
            pump_notify: Arc::new(Notify::new()),
        })
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    /// Replaces the in-memory configuration atomically and rebuilds the
    /// balancer. Persistence of the config file is the caller's concern.
    pub fn update_settings(&self, new_settings: Settings) {
        let balancer = LoadBalancerFactory::create(&new_settings.load_balancer);
        *self.balancer.write().unwrap() = balancer;
        *self.settings.write().unwrap() = new_settings;
        info!("configuration updated");
    }

    // ------------------------------------------------------------------
    // Candidate filter
    // ------------------------------------------------------------------

    /// Applies the admission filter for `(model, endpoint)`.
    fn filter_candidates(&self, model: &str, endpoint: EndpointKind) -> FilterOutcome {
        let settings = self.settings.read().unwrap();
        let cooldown = Duration::from_millis(settings.cooldown.failure_cooldown_ms);
        let breakers_enabled = settings.enable_circuit_breaker;
        drop(settings);

        let hosting = self.fleet.servers_hosting(model);
        let hosting_count = hosting.len();
        let mut outcome = FilterOutcome {
            candidates: Vec::new(),
            hosting_count,
            capability_blocked: 0,
            capacity_blocked: 0,
        };

        for (server, resolved) in hosting {
            if !server.routable() {
                continue;
            }

            let key = model_key(&server.id, &resolved);
            let model_breaker = self.breakers.get_or_create(&key);

            // Capability: the endpoint must match what the server and the
            // learned model type can serve.
            let type_mismatch = match model_breaker.model_type() {
                Some(ModelType::Embedding) => endpoint.requires_generation(),
                Some(ModelType::Generation) => !endpoint.requires_generation(),
                None => false,
            };
            if type_mismatch || (endpoint.requires_generation() && !server.supports_generation) {
                outcome.capability_blocked += 1;
                continue;
            }

            if self.bans.lock().unwrap().contains(&key) {
                continue;
            }
            if let Some(last_failure) = self.cooldowns.lock().unwrap().get(&key) {
                if last_failure.elapsed() < cooldown {
                    continue;
                }
            }

            let server_breaker = self.breakers.get_or_create(&server.id);
            if breakers_enabled
                && !(server_breaker.admission_preview() && model_breaker.admission_preview())
            {
                continue;
            }

            let in_flight = self.metrics.in_flight(&server.id, &resolved);
            if in_flight >= server.max_concurrency as u64 {
                outcome.capacity_blocked += 1;
                continue;
            }

            let breaker_state = match (server_breaker.state(), model_breaker.state()) {
                (CircuitState::Open, _) | (_, CircuitState::Open) => CircuitState::Open,
                (CircuitState::HalfOpen, _) | (_, CircuitState::HalfOpen) => CircuitState::HalfOpen,
                _ => CircuitState::Closed,
            };

            outcome.candidates.push(Candidate {
                metrics: self.metrics.metrics_for(&server.id, &resolved),
                in_flight,
                server_in_flight: self.metrics.in_flight_for_server(&server.id),
                breaker_state,
                resolved_model: resolved,
                server,
            });
        }
        outcome
    }

    /// Whether any candidate could serve the model right now. Used by the
    /// queue pump to decide which waiting items to release.
    pub fn has_capacity_for(&self, model: &str, endpoint: EndpointKind) -> bool {
        !self.filter_candidates(model, endpoint).candidates.is_empty()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatches one request through the three-phase failover policy,
    /// queueing first when every candidate is merely at capacity.
    pub async fn dispatch(
        self: &Arc<Self>,
        request: InferenceRequest,
    ) -> Result<DispatchSuccess, OrchestratorError> {
        if self.draining.load(Ordering::Relaxed) {
            return Err(OrchestratorError::Draining);
        }
        let settings = self.settings();
        if request.streaming && !(settings.enable_streaming && settings.streaming.enabled) {
            return Err(OrchestratorError::BadRequest {
                message: "streaming is disabled".to_string(),
            });
        }

        let mut outcome = self.filter_candidates(&request.model, request.endpoint);
        if outcome.candidates.is_empty() {
            if outcome.hosting_count == 0 {
                return Err(OrchestratorError::ModelNotFound {
                    model: request.model,
                });
            }
            if outcome.capability_blocked == outcome.hosting_count {
                return Err(OrchestratorError::CapabilityMismatch {
                    model: request.model,
                    endpoint: request.endpoint.as_str().to_string(),
                });
            }
            if outcome.capacity_blocked > 0 && !settings.enable_queue {
                return Err(OrchestratorError::AtCapacity {
                    model: request.model,
                });
            }
            if outcome.capacity_blocked > 0 {
                // All viable servers are busy: wait for a slot.
                let ticket = self.queue.enqueue(
                    &request.model,
                    request.endpoint,
                    request.priority,
                    false,
                )?;
                self.pump_notify.notify_one();
                ticket
                    .await
                    .map_err(|_| OrchestratorError::QueueClosed)??;
                outcome = self.filter_candidates(&request.model, request.endpoint);
                if outcome.candidates.is_empty() {
                    return Err(OrchestratorError::NoHealthyCandidates {
                        model: request.model,
                    });
                }
            } else {
                return Err(OrchestratorError::NoHealthyCandidates {
                    model: request.model,
                });
            }
        }

        let ranked = {
            let balancer = self.balancer.read().unwrap().clone();
            let ranked = balancer.rank(outcome.candidates, request.streaming);
            self.record_decision(&request.model, balancer.name(), &ranked);
            ranked
        };
        let candidate_count = ranked.len();
        let mut attempts: Vec<AttemptFailure> = Vec::new();
        let mut retry_count: u32 = 0;

        // Phase 1 and 2: failover across the ranked list, each candidate
        // once per phase, never retrying in place.
        for phase in 0..2 {
            for candidate in &ranked {
                if phase > 0 && self.is_banned(&candidate.candidate) {
                    continue;
                }
                if phase > 0 {
                    retry_count += 1;
                }
                match self.attempt(candidate, &request, candidate_count, retry_count).await {
                    Ok(success) => return Ok(success),
                    Err(error) => {
                        if error.embedding_refusal {
                            return Err(OrchestratorError::CapabilityMismatch {
                                model: request.model,
                                endpoint: request.endpoint.as_str().to_string(),
                            });
                        }
                        if !error.blocked {
                            attempts.push(AttemptFailure::new(
                                &candidate.candidate.server.id,
                                error.category,
                                &error.message,
                                error.status,
                            ));
                        }
                    }
                }
            }
        }

        // Phase 3: bounded same-server retries against the best-ranked
        // candidate, transient/retryable errors with retryable statuses only.
        if let Some(best) = ranked.first() {
            let retry = settings.retry.clone();
            let mut delay = retry.retry_delay_ms as f64;
            for _ in 0..retry.max_retries_per_server {
                let last_for_best = attempts
                    .iter()
                    .rev()
                    .find(|a| a.server_id == best.candidate.server.id);
                let eligible = match last_for_best {
                    Some(last) => {
                        last.category.allows_same_server_retry()
                            && last
                                .status
                                .map(|s| retry.retryable_status_codes.contains(&s))
                                != Some(false)
                    }
                    None => false,
                };
                if !eligible {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(
                    (delay as u64).min(retry.max_retry_delay_ms),
                ))
                .await;
                delay *= retry.backoff_multiplier;
                retry_count += 1;
                match self.attempt(best, &request, candidate_count, retry_count).await {
                    Ok(success) => return Ok(success),
                    Err(error) => {
                        if error.embedding_refusal {
                            return Err(OrchestratorError::CapabilityMismatch {
                                model: request.model,
                                endpoint: request.endpoint.as_str().to_string(),
                            });
                        }
                        if !error.blocked {
                            attempts.push(AttemptFailure::new(
                                &best.candidate.server.id,
                                error.category,
                                &error.message,
                                error.status,
                            ));
                        }
                    }
                }
            }
        }

        if attempts.is_empty() {
            return Err(OrchestratorError::NoHealthyCandidates {
                model: request.model,
            });
        }
        Err(OrchestratorError::CandidatesExhausted {
            model: request.model,
            attempts,
        })
    }

    fn is_banned(&self, candidate: &Candidate) -> bool {
        let key = model_key(&candidate.server.id, &candidate.resolved_model);
        self.bans.lock().unwrap().contains(&key)
    }

    /// One attempt against one candidate.
    async fn attempt(
        self: &Arc<Self>,
        ranked: &RankedCandidate,
        request: &InferenceRequest,
        candidate_count: usize,
        retry_count: u32,
    ) -> Result<DispatchSuccess, AttemptError> {
        let candidate = &ranked.candidate;
        let server_id = candidate.server.id.clone();
        let resolved = candidate.resolved_model.clone();
        let key = model_key(&server_id, &resolved);

        let server_breaker = self.breakers.get_or_create(&server_id);
        let model_breaker = self.breakers.get_or_create(&key);
        let breakers_enabled = self.settings.read().unwrap().enable_circuit_breaker;
        if breakers_enabled {
            if !server_breaker.can_execute() {
                return Err(AttemptError {
                    category: ErrorCategory::Transient,
                    message: format!("server circuit open: {}", server_id),
                    status: None,
                    embedding_refusal: false,
                    blocked: true,
                });
            }
            if !model_breaker.can_execute() {
                return Err(AttemptError {
                    category: ErrorCategory::Transient,
                    message: format!("model circuit open: {}", key),
                    status: None,
                    embedding_refusal: false,
                    blocked: true,
                });
            }
            // A half-open admission doubles as a live probe; let the
            // coordinator run its own, serialized, alongside.
            if model_breaker.state() == CircuitState::HalfOpen {
                let recovery = Arc::clone(&self.recovery);
                let probe_server = server_id.clone();
                let probe_model = resolved.clone();
                tokio::spawn(async move {
                    recovery.probe_model(&probe_server, &probe_model).await;
                });
            }
        }
        let was_half_open = model_breaker.state() == CircuitState::HalfOpen;

        let mut payload = request.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("model".to_string(), Value::String(resolved.clone()));
        }

        let guard = self.metrics.begin_request(&server_id, &resolved, false);
        let timeout = self.attempt_timeout(&key);
        let started = Instant::now();
        let result = self
            .upstream
            .forward(&candidate.server, request.endpoint, payload, request.streaming, timeout)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as f64;

        let debug = DispatchDebug {
            server_id: server_id.clone(),
            server_breaker: server_breaker.state(),
            model_breaker: model_breaker.state(),
            candidate_count,
            retry_count,
        };

        match result {
            Ok(response) if response.is_success() => match response.body {
                UpstreamBody::Stream(_) => {
                    let stream_timeout =
                        Duration::from_millis(self.settings().streaming.timeout_ms.max(1_000));
                    Ok(self.start_stream(
                        response,
                        guard,
                        StreamContext {
                            server_id,
                            model: resolved,
                            endpoint: request.endpoint,
                            server_breaker,
                            model_breaker,
                            was_half_open,
                            started,
                            deadline: started + stream_timeout,
                        },
                        debug,
                    ))
                }
                UpstreamBody::Full(body) => {
                    drop(guard);
                    self.on_attempt_success(
                        &server_id,
                        &resolved,
                        &server_breaker,
                        &model_breaker,
                        was_half_open,
                        elapsed_ms,
                    );
                    self.metrics.record_request(RequestObservation {
                        server_id: server_id.clone(),
                        model: resolved.clone(),
                        duration_ms: elapsed_ms,
                        success: true,
                        tokens_generated: response.tokens_generated,
                        tokens_prompt: response.tokens_prompt,
                        ttft_ms: None,
                        streaming_duration_ms: None,
                        error_category: None,
                        cancelled: false,
                    });
                    self.history.record_request(RequestHistoryEntry {
                        id: Uuid::new_v4().to_string(),
                        server_id,
                        model: resolved,
                        endpoint: request.endpoint.as_str().to_string(),
                        streaming: false,
                        started_at: Utc::now()
                            - chrono::Duration::milliseconds(elapsed_ms as i64),
                        finished_at: Utc::now(),
                        duration_ms: elapsed_ms,
                        success: true,
                        tokens_generated: response.tokens_generated,
                        tokens_prompt: response.tokens_prompt,
                        ttft_ms: None,
                        error_category: None,
                        error_message: None,
                        cancelled: false,
                    });
                    self.pump_notify.notify_one();
                    Ok(DispatchSuccess {
                        response: ClientResponse::Buffered {
                            status: response.status,
                            content_type: response.content_type,
                            body,
                        },
                        debug,
                    })
                }
            },
            Ok(response) => {
                drop(guard);
                let message = response.error_message();
                let status = Some(response.status);
                self.pump_notify.notify_one();
                Err(self.on_attempt_failure(
                    &server_id,
                    &resolved,
                    request,
                    &server_breaker,
                    &model_breaker,
                    message,
                    status,
                    elapsed_ms,
                ))
            }
            Err(error) => {
                drop(guard);
                let (message, status) = match &error {
                    OrchestratorError::Upstream { message, status, .. } => {
                        (message.clone(), *status)
                    }
                    other => (other.to_string(), None),
                };
                self.pump_notify.notify_one();
                Err(self.on_attempt_failure(
                    &server_id,
                    &resolved,
                    request,
                    &server_breaker,
                    &model_breaker,
                    message,
                    status,
                    elapsed_ms,
                ))
            }
        }
    }

    /// Success bookkeeping shared by buffered responses and stream endings.
    fn on_attempt_success(
        &self,
        server_id: &str,
        model: &str,
        server_breaker: &Arc<CircuitBreaker>,
        model_breaker: &Arc<CircuitBreaker>,
        was_half_open: bool,
        elapsed_ms: f64,
    ) {
        server_breaker.record_success();
        model_breaker.record_success();
        self.fleet.record_dispatch_success(server_id);
        self.adapt_timeout(&model_key(server_id, model), was_half_open, elapsed_ms);
    }

    /// Applies the error→state table for one failed attempt.
    #[allow(clippy::too_many_arguments)]
    fn on_attempt_failure(
        &self,
        server_id: &str,
        model: &str,
        request: &InferenceRequest,
        server_breaker: &Arc<CircuitBreaker>,
        model_breaker: &Arc<CircuitBreaker>,
        message: String,
        status: Option<u16>,
        elapsed_ms: f64,
    ) -> AttemptError {
        // The embedding-only refusal is a client routing error: learn the
        // model type, count nothing.
        if request.endpoint.requires_generation() && is_embedding_only_refusal(&message) {
            model_breaker.set_model_type(ModelType::Embedding);
            info!("{} refused generation; learned embedding type", model_key(server_id, model));
            return AttemptError {
                category: ErrorCategory::NonRetryable,
                message,
                status,
                embedding_refusal: true,
                blocked: false,
            };
        }

        let category = classify_error(&message, status, &self.overrides);
        let key = model_key(server_id, model);
        let settings = self.settings();

        model_breaker.record_failure(category, &message);
        // Transport-level failures (no HTTP status) indict the server, not
        // just the model.
        if status.is_none() {
            server_breaker.record_failure(category, &message);
        }

        self.cooldowns.lock().unwrap().insert(key.clone(), Instant::now());

        match category {
            ErrorCategory::Permanent => {
                self.bans.lock().unwrap().insert(key.clone());
                self.persist_bans();
                warn!("banned {} after permanent error: {}", key, message);
                if status.is_none() || message.to_lowercase().contains("no space left") {
                    // Server-wide breakage clears the healthy bit directly.
                    self.fleet.set_healthy(server_id, false);
                }
            }
            ErrorCategory::Transient | ErrorCategory::Retryable => {
                self.fleet
                    .record_dispatch_failure(server_id, settings.health_check.failure_threshold);
            }
            ErrorCategory::NonRetryable => {}
        }

        self.metrics.record_request(RequestObservation {
            server_id: server_id.to_string(),
            model: model.to_string(),
            duration_ms: elapsed_ms,
            success: false,
            tokens_generated: None,
            tokens_prompt: None,
            ttft_ms: None,
            streaming_duration_ms: None,
            error_category: Some(category),
            cancelled: false,
        });
        self.history.record_request(RequestHistoryEntry {
            id: Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            model: model.to_string(),
            endpoint: request.endpoint.as_str().to_string(),
            streaming: request.streaming,
            started_at: Utc::now() - chrono::Duration::milliseconds(elapsed_ms as i64),
            finished_at: Utc::now(),
            duration_ms: elapsed_ms,
            success: false,
            tokens_generated: None,
            tokens_prompt: None,
            ttft_ms: None,
            error_category: Some(category),
            error_message: Some(message.chars().take(200).collect()),
            cancelled: false,
        });

        AttemptError {
            category,
            message,
            status,
            embedding_refusal: false,
            blocked: false,
        }
    }

    fn record_decision(&self, model: &str, algorithm: &str, ranked: &[RankedCandidate]) {
        let reason = if ranked.len() == 1 {
            "single_candidate"
        } else if ranked.is_empty() {
            "no_candidates"
        } else {
            "ranked"
        };
        self.history.record_decision(DecisionLogEntry {
            at: Utc::now(),
            model: model.to_string(),
            candidates: ranked.iter().map(|r| r.score.clone()).collect(),
            selected: ranked.first().map(|r| r.candidate.server.id.clone()),
            algorithm: algorithm.to_string(),
            reason: reason.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Adaptive timeouts
    // ------------------------------------------------------------------

    fn attempt_timeout(&self, key: &str) -> Duration {
        let stored = self.timeouts.read().unwrap().get(key).copied();
        Duration::from_millis(stored.unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_MS))
    }

    /// Timeout adaptation: a recovery success rebases to 3x the observed
    /// latency; an unusually slow regular success only ever raises the
    /// stored timeout. Both are clamped to [15s, 10m].
    fn adapt_timeout(&self, key: &str, was_half_open: bool, elapsed_ms: f64) {
        let clamp = |ms: f64| -> u64 {
            (ms as u64).clamp(MIN_ADAPTED_TIMEOUT_MS, MAX_ADAPTED_TIMEOUT_MS)
        };
        let mut timeouts = self.timeouts.write().unwrap();
        if was_half_open {
            timeouts.insert(key.to_string(), clamp(3.0 * elapsed_ms));
        } else {
            let candidate = clamp(2.0 * elapsed_ms);
            let current = timeouts
                .get(key)
                .copied()
                .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_MS);
            if candidate > current {
                timeouts.insert(key.to_string(), candidate);
            }
        }
        drop(timeouts);
        self.persist_timeouts();
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    fn start_stream(
        self: &Arc<Self>,
        response: UpstreamResponse,
        guard: InFlightGuard,
        ctx: StreamContext,
        debug: DispatchDebug,
    ) -> DispatchSuccess {
        let inner = match response.body {
            UpstreamBody::Stream(stream) => stream,
            UpstreamBody::Full(bytes) => futures_util::stream::once(async move {
                Ok::<Bytes, OrchestratorError>(bytes)
            })
            .boxed(),
        };
        let tracker = StreamTracker {
            orchestrator: Arc::clone(self),
            ctx,
            guard: Some(guard),
            first_chunk_at: None,
            last_tail: Vec::new(),
            finished: false,
        };
        let stream = futures_util::stream::unfold(
            (inner, tracker, false),
            |(mut inner, mut tracker, done)| async move {
                if done {
                    return None;
                }
                let remaining = tracker
                    .ctx
                    .deadline
                    .saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, inner.next()).await {
                    Ok(Some(Ok(chunk))) => {
                        tracker.observe_chunk(&chunk);
                        Some((Ok(chunk), (inner, tracker, false)))
                    }
                    Ok(Some(Err(error))) => {
                        let frame = tracker.finish_failure(&error);
                        Some((Ok(frame), (inner, tracker, true)))
                    }
                    Ok(None) => {
                        tracker.finish_success();
                        None
                    }
                    Err(_) => {
                        let timeout_ms = (tracker.ctx.deadline - tracker.ctx.started).as_millis();
                        let frame = tracker.finish_failure(&OrchestratorError::Timeout {
                            timeout_ms: timeout_ms as u64,
                        });
                        Some((Ok(frame), (inner, tracker, true)))
                    }
                }
            },
        )
        .boxed();

        DispatchSuccess {
            response: ClientResponse::Streaming {
                content_type: response.content_type,
                stream,
            },
            debug,
        }
    }

    // ------------------------------------------------------------------
    // Queue pump & draining
    // ------------------------------------------------------------------

    /// Spawns the queue pump: ages and expires waiting items and releases
    /// them as capacity frees up. Abort the handle to stop.
    pub fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = orchestrator.pump_notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
                orchestrator.queue.tick();
                while orchestrator
                    .queue
                    .release_ready(|item| orchestrator.has_capacity_for(&item.model, item.endpoint))
                    .is_some()
                {}
            }
        })
    }

    /// Stops admissions and waits until in-flight work and the queue are
    /// empty or the deadline expires. Returns true on a clean drain.
    pub async fn drain(&self, timeout_ms: u64) -> bool {
        self.draining.store(true, Ordering::Relaxed);
        self.queue.close();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.metrics.total_in_flight() == 0 && self.queue.is_empty() {
                info!("drain complete");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    "drain deadline expired with {} in flight",
                    self.metrics.total_in_flight()
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Bans, cooldowns, stats (admin surface)
    // ------------------------------------------------------------------

    pub fn banned_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.bans.lock().unwrap().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Removes one ban. Clearing a ban also resets the model breaker (and
    /// its learned model type) so a bad classification can be undone.
    pub fn remove_ban(&self, key: &str) -> bool {
        let removed = self.bans.lock().unwrap().remove(key);
        if removed {
            if let Some(breaker) = self.breakers.get(key) {
                breaker.force_close();
            }
            self.cooldowns.lock().unwrap().remove(key);
            self.persist_bans();
        }
        removed
    }

    pub fn clear_bans(&self) -> usize {
        let keys: Vec<String> = self.bans.lock().unwrap().drain().collect();
        for key in &keys {
            if let Some(breaker) = self.breakers.get(key) {
                breaker.force_close();
            }
            self.cooldowns.lock().unwrap().remove(key);
        }
        self.persist_bans();
        keys.len()
    }

    pub fn ban_key(&self, key: &str) {
        self.bans.lock().unwrap().insert(key.to_string());
        self.persist_bans();
    }

    /// Per-key stats for the admin surface.
    pub fn key_stats(&self, server_id: &str, model: &str) -> KeyStats {
        let key = model_key(server_id, model);
        let settings = self.settings();
        let in_cooldown = self
            .cooldowns
            .lock()
            .unwrap()
            .get(&key)
            .map(|at| at.elapsed() < Duration::from_millis(settings.cooldown.failure_cooldown_ms))
            .unwrap_or(false);
        KeyStats {
            server_id: server_id.to_string(),
            model: model.to_string(),
            in_flight: self.metrics.in_flight(server_id, model),
            in_cooldown,
            banned: self.bans.lock().unwrap().contains(&key),
            timeout_ms: self.timeouts.read().unwrap().get(&key).copied(),
            breaker: self.breakers.get(&key).map(|b| b.snapshot()),
            metrics: self.metrics.metrics_for(server_id, model),
        }
    }

    /// Removes every per-key trace of a server: breakers, metrics, request
    /// history, bans, cooldowns, timeouts. Called after fleet removal.
    pub fn forget_server(&self, server_id: &str) {
        let prefix = format!("{}:", server_id);
        self.breakers.remove_by_prefix(server_id);
        self.metrics.remove_server(server_id);
        self.history.remove_server(server_id);
        self.bans.lock().unwrap().retain(|k| !k.starts_with(&prefix));
        self.cooldowns.lock().unwrap().retain(|k, _| !k.starts_with(&prefix));
        self.timeouts.write().unwrap().retain(|k, _| !k.starts_with(&prefix));
        self.persist_bans();
        self.persist_timeouts();
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn persist_bans(&self) {
        let bans: Vec<String> = self.bans.lock().unwrap().iter().cloned().collect();
        self.persistence.schedule(PersistKind::Bans, &bans);
    }

    fn persist_timeouts(&self) {
        let timeouts: std::collections::HashMap<String, u64> = self
            .timeouts
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        self.persistence.schedule(PersistKind::Timeouts, &timeouts);
    }

    /// Schedules snapshots of every persisted concern. Called on shutdown
    /// (followed by a flush) and periodically.
    pub fn persist_all(&self) {
        self.persistence.schedule(PersistKind::Servers, &self.fleet.export());
        self.persistence.schedule(PersistKind::Breakers, &self.breakers.snapshots());
        self.persistence.schedule(PersistKind::Metrics, &self.metrics.export());
        self.persistence.schedule(PersistKind::History, &self.history.export());
        self.persist_bans();
        self.persist_timeouts();
    }

    /// Best-effort restore of persisted state at startup.
    pub async fn restore_persisted(&self) {
        if let Some(servers) = self.persistence.load(PersistKind::Servers).await {
            self.fleet.restore(servers);
        }
        if let Some(snapshots) = self.persistence.load(PersistKind::Breakers).await {
            self.breakers.restore(snapshots);
        }
        if let Some(metrics) = self.persistence.load(PersistKind::Metrics).await {
            self.metrics.restore(metrics);
        }
        if let Some(history) = self.persistence.load(PersistKind::History).await {
            self.history.restore(history);
        }
        if let Some(bans) = self.persistence.load::<Vec<String>>(PersistKind::Bans).await {
            let mut set = self.bans.lock().unwrap();
            set.extend(bans);
        }
        if let Some(timeouts) = self
            .persistence
            .load::<std::collections::HashMap<String, u64>>(PersistKind::Timeouts)
            .await
        {
            let mut map = self.timeouts.write().unwrap();
            for (key, value) in timeouts {
                map.insert(key, value);
            }
        }
    }
}

struct StreamContext {
    server_id: String,
    model: String,
    endpoint: EndpointKind,
    server_breaker: Arc<CircuitBreaker>,
    model_breaker: Arc<CircuitBreaker>,
    was_half_open: bool,
    started: Instant,
    /// Hard stop for the whole stream, from `streaming.timeoutMs`
    deadline: Instant,
}

/// Per-stream bookkeeping. Records the terminal observation exactly once:
/// on clean end, on mid-stream failure, or on client cancellation (drop).
struct StreamTracker {
    orchestrator: Arc<Orchestrator>,
    ctx: StreamContext,
    guard: Option<InFlightGuard>,
    first_chunk_at: Option<Instant>,
    last_tail: Vec<u8>,
    finished: bool,
}

impl StreamTracker {
    fn observe_chunk(&mut self, chunk: &Bytes) {
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(Instant::now());
        }
        // Keep the tail so the final NDJSON object (token counts) can be
        // parsed at end-of-stream without buffering the body.
        const TAIL_LIMIT: usize = 4096;
        self.last_tail.extend_from_slice(chunk);
        if self.last_tail.len() > TAIL_LIMIT {
            let start = self.last_tail.len() - TAIL_LIMIT;
            self.last_tail.drain(..start);
        }
    }

    fn ttft_ms(&self) -> Option<f64> {
        self.first_chunk_at
            .map(|at| (at - self.ctx.started).as_secs_f64() * 1000.0)
    }

    fn final_tokens(&self) -> (Option<u64>, Option<u64>) {
        let text = String::from_utf8_lossy(&self.last_tail);
        for line in text.lines().rev() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(line) {
                return extract_token_counts(&value);
            }
        }
        (None, None)
    }

    fn record(&mut self, success: bool, category: Option<ErrorCategory>, message: Option<String>, cancelled: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let duration_ms = self.ctx.started.elapsed().as_secs_f64() * 1000.0;
        let (tokens_generated, tokens_prompt) = if success { self.final_tokens() } else { (None, None) };

        if success {
            self.orchestrator.on_attempt_success(
                &self.ctx.server_id,
                &self.ctx.model,
                &self.ctx.server_breaker,
                &self.ctx.model_breaker,
                self.ctx.was_half_open,
                duration_ms,
            );
        } else if !cancelled {
            if let Some(category) = category {
                self.ctx
                    .model_breaker
                    .record_failure(category, message.as_deref().unwrap_or("stream failed"));
            }
        }

        self.orchestrator.metrics.record_request(RequestObservation {
            server_id: self.ctx.server_id.clone(),
            model: self.ctx.model.clone(),
            duration_ms,
            success,
            tokens_generated,
            tokens_prompt,
            ttft_ms: self.ttft_ms(),
            streaming_duration_ms: Some(duration_ms),
            error_category: category,
            cancelled,
        });
        self.orchestrator.history.record_request(RequestHistoryEntry {
            id: Uuid::new_v4().to_string(),
            server_id: self.ctx.server_id.clone(),
            model: self.ctx.model.clone(),
            endpoint: self.ctx.endpoint.as_str().to_string(),
            streaming: true,
            started_at: Utc::now() - chrono::Duration::milliseconds(duration_ms as i64),
            finished_at: Utc::now(),
            duration_ms,
            success,
            tokens_generated,
            tokens_prompt,
            ttft_ms: self.ttft_ms(),
            error_category: category,
            error_message: message,
            cancelled,
        });
        self.guard.take();
        self.orchestrator.pump_notify.notify_one();
    }

    fn finish_success(&mut self) {
        self.record(true, None, None, false);
    }

    /// Mid-stream failure: records a transient failure and returns the
    /// terminal error frame for the client.
    fn finish_failure(&mut self, error: &OrchestratorError) -> Bytes {
        let message = error.to_string();
        let category = classify_error(&message, None, &self.orchestrator.overrides);
        warn!(
            "stream from {} failed mid-flight: {}",
            self.ctx.server_id, message
        );
        self.record(false, Some(category), Some(message.clone()), false);
        let frame = serde_json::json!({
            "error": message,
            "done": true,
        });
        Bytes::from(format!("{}\n", frame))
    }
}

impl Drop for StreamTracker {
    fn drop(&mut self) {
        if !self.finished {
            debug!("stream to client for {} cancelled", self.ctx.server_id);
            self.record(false, None, None, true);
        }
    }
}
