//! Coordinated active-recovery probes for half-open breakers.
//!
//! When a breaker goes half-open, several concurrent client requests could
//! each decide to "test" the recovering backend and stampede it. The
//! coordinator serializes probes: at most one in-flight recovery probe per
//! server-level breaker and one per (server,model) breaker, with adaptive
//! timeouts sized from discovered VRAM, historical latency, probe health and
//! a progressive factor that grows with consecutive probe timeouts.
//!
//! Model probes bypass regular capacity accounting (the `bypass` in-flight
//! counter) and hold the breaker's `active_tests_in_progress` for their
//! duration so half-open timeouts do not fire mid-probe.

use crate::models::error::{classify_error, is_embedding_only_refusal, ErrorCategory, ErrorPatternOverrides, OrchestratorError};
use crate::models::server::{ModelType, ServerRecord};
use crate::models::settings::{HealthCheckSettings, ModelManagerSettings};
use crate::services::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::services::fleet::Fleet;
use crate::services::metrics::MetricsAggregator;
use crate::services::upstream::{EndpointKind, UpstreamClient};
use crate::utils::model::{model_key, parameter_billions};
use ahash::AHashMap;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of one coordinated probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe succeeded and the breaker recorded a success
    Success,
    /// The probe failed and the breaker recorded a failure
    Failed(ErrorCategory),
    /// Another probe for the same key was already in flight
    AlreadyRunning,
    /// The probe failed in a way that must not count against the breaker
    /// (embedding endpoint transiently unavailable after type detection)
    NonBreaking,
}

/// Serializes recovery probes per backend and per model key.
pub struct RecoveryTestCoordinator {
    fleet: Arc<Fleet>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
    upstream: Arc<dyn UpstreamClient>,
    health: HealthCheckSettings,
    sizing: ModelManagerSettings,
    overrides: ErrorPatternOverrides,
    in_progress: Mutex<HashSet<String>>,
    consecutive_timeouts: Mutex<AHashMap<String, u32>>,
}

/// Removes the key from the in-progress set on every exit path.
struct ProbeSlot<'a> {
    coordinator: &'a RecoveryTestCoordinator,
    key: String,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        self.coordinator.in_progress.lock().unwrap().remove(&self.key);
    }
}

impl RecoveryTestCoordinator {
    pub fn new(
        fleet: Arc<Fleet>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<MetricsAggregator>,
        upstream: Arc<dyn UpstreamClient>,
        health: HealthCheckSettings,
        sizing: ModelManagerSettings,
        overrides: ErrorPatternOverrides,
    ) -> Arc<Self> {
        Arc::new(Self {
            fleet,
            breakers,
            metrics,
            upstream,
            health,
            sizing,
            overrides,
            in_progress: Mutex::new(HashSet::new()),
            consecutive_timeouts: Mutex::new(AHashMap::new()),
        })
    }

    fn claim(&self, key: &str) -> Option<ProbeSlot<'_>> {
        let mut in_progress = self.in_progress.lock().unwrap();
        if !in_progress.insert(key.to_string()) {
            return None;
        }
        Some(ProbeSlot {
            coordinator: self,
            key: key.to_string(),
        })
    }

    /// Lightweight server-level probe: the model-listing endpoint with the
    /// health-check timeout. A success force-closes the server breaker and
    /// every model breaker under it, and flips the server healthy.
    pub async fn probe_server(&self, server_id: &str) -> ProbeOutcome {
        let _slot = match self.claim(server_id) {
            Some(slot) => slot,
            None => return ProbeOutcome::AlreadyRunning,
        };
        let server = match self.fleet.get(server_id) {
            Some(server) => server,
            None => return ProbeOutcome::NonBreaking,
        };
        let breaker = self.breakers.get_or_create(server_id);
        breaker.begin_recovery_test();
        let limit = Duration::from_millis(self.health.timeout_ms);
        let result = self.upstream.list_models(&server, limit).await;
        breaker.end_recovery_test();

        match result {
            Ok(_) => {
                info!("recovery probe succeeded for server {}", server_id);
                breaker.force_close_keep_type();
                for model_breaker in self.breakers.model_breakers_for(server_id) {
                    model_breaker.force_close_keep_type();
                }
                self.fleet.set_healthy(server_id, true);
                ProbeOutcome::Success
            }
            Err(error) => {
                let (message, status) = error_parts(&error);
                let category = classify_error(&message, status, &self.overrides);
                breaker.record_failure(category, &message);
                debug!("recovery probe failed for server {}: {}", server_id, message);
                ProbeOutcome::Failed(category)
            }
        }
    }

    /// Model-level probe: a minimal inference request for generation models
    /// or a minimal embedding request for embedding models, chosen by the
    /// persisted model type (with detection on first contact).
    pub async fn probe_model(&self, server_id: &str, model: &str) -> ProbeOutcome {
        let key = model_key(server_id, model);
        let _slot = match self.claim(&key) {
            Some(slot) => slot,
            None => return ProbeOutcome::AlreadyRunning,
        };
        let server = match self.fleet.get(server_id) {
            Some(server) => server,
            None => return ProbeOutcome::NonBreaking,
        };
        let breaker = self.breakers.get_or_create(&key);
        if breaker.state() == CircuitState::Closed {
            return ProbeOutcome::NonBreaking;
        }

        breaker.begin_recovery_test();
        // Bypass accounting: probes never consume regular capacity.
        let _guard = self.metrics.begin_request(server_id, model, true);
        let limit = self.probe_timeout(&server, model);
        let started = Instant::now();

        let outcome = match breaker.model_type() {
            Some(ModelType::Embedding) => {
                self.run_probe(&server, model, EndpointKind::Embeddings, limit, false)
                    .await
            }
            Some(ModelType::Generation) => {
                self.run_probe(&server, model, EndpointKind::Generate, limit, false)
                    .await
            }
            None => {
                // Unknown type: try generation with a short detection
                // timeout, fall back to embeddings on an embedding-only
                // refusal.
                let detection_limit = limit.min(Duration::from_millis(self.health.timeout_ms * 2));
                match self
                    .run_probe(&server, model, EndpointKind::Generate, detection_limit, true)
                    .await
                {
                    ProbeAttempt::EmbeddingRefusal => {
                        breaker.set_model_type(ModelType::Embedding);
                        match self
                            .run_probe(&server, model, EndpointKind::Embeddings, limit, false)
                            .await
                        {
                            ProbeAttempt::Ok => ProbeAttempt::Ok,
                            // The classification stands; the endpoint being
                            // unavailable right now is not breaker-worthy.
                            _ => ProbeAttempt::NonBreaking,
                        }
                    }
                    ProbeAttempt::Ok => {
                        breaker.set_model_type(ModelType::Generation);
                        ProbeAttempt::Ok
                    }
                    other => other,
                }
            }
        };

        let elapsed = started.elapsed();
        match outcome {
            ProbeAttempt::Ok => {
                breaker.record_success();
                breaker.end_recovery_test();
                self.consecutive_timeouts.lock().unwrap().remove(&key);
                info!(
                    "recovery probe for {} succeeded in {}ms",
                    key,
                    elapsed.as_millis()
                );
                ProbeOutcome::Success
            }
            ProbeAttempt::NonBreaking => {
                breaker.end_recovery_test();
                ProbeOutcome::NonBreaking
            }
            ProbeAttempt::EmbeddingRefusal => {
                // Refusals never count as failures; the type was learned.
                breaker.end_recovery_test();
                ProbeOutcome::NonBreaking
            }
            ProbeAttempt::Failed { message, status, timed_out } => {
                if timed_out {
                    *self
                        .consecutive_timeouts
                        .lock()
                        .unwrap()
                        .entry(key.clone())
                        .or_insert(0) += 1;
                }
                let category = classify_error(&message, status, &self.overrides);
                breaker.record_failure(category, &message);
                breaker.end_recovery_test();
                warn!("recovery probe for {} failed: {}", key, message);
                ProbeOutcome::Failed(category)
            }
        }
    }

    async fn run_probe(
        &self,
        server: &ServerRecord,
        model: &str,
        endpoint: EndpointKind,
        limit: Duration,
        detecting: bool,
    ) -> ProbeAttempt {
        let payload = match endpoint {
            EndpointKind::Embeddings => json!({ "model": model, "prompt": "ping" }),
            _ => json!({
                "model": model,
                "prompt": "hi",
                "stream": false,
                "options": { "num_predict": 1 }
            }),
        };
        match self
            .upstream
            .forward(server, endpoint, payload, false, limit)
            .await
        {
            Ok(response) if response.is_success() => ProbeAttempt::Ok,
            Ok(response) => {
                let message = response.error_message();
                if detecting && is_embedding_only_refusal(&message) {
                    return ProbeAttempt::EmbeddingRefusal;
                }
                ProbeAttempt::Failed {
                    message,
                    status: Some(response.status),
                    timed_out: false,
                }
            }
            Err(OrchestratorError::Timeout { timeout_ms }) => ProbeAttempt::Failed {
                message: format!("probe timed out after {}ms", timeout_ms),
                status: None,
                timed_out: true,
            },
            Err(error) => {
                let (message, status) = error_parts(&error);
                ProbeAttempt::Failed {
                    message,
                    status,
                    timed_out: false,
                }
            }
        }
    }

    /// Adaptive probe timeout:
    /// `min(max, max(min, base * model_size * historical * server * progressive))`.
    ///
    /// A probe against a model that is not resident in backend memory pays
    /// the cold-load cost first, so the floor is raised to the size-class
    /// load-time estimate for non-resident models.
    fn probe_timeout(&self, server: &ServerRecord, model: &str) -> Duration {
        let base_ms = self.health.timeout_ms as f64;
        let max_ms = self.sizing.warmup_timeout_ms as f64;

        let vram_bytes = server.hardware.as_ref().and_then(|hw| hw.vram_for(model));
        let size_gb = vram_bytes
            .map(|bytes| bytes as f64 / 1_073_741_824.0)
            .or_else(|| {
                parameter_billions(model).map(|billions| billions * self.sizing.gb_per_billion_params)
            })
            .unwrap_or(self.sizing.default_model_size_gb);
        let min_ms = if vram_bytes.is_some() {
            base_ms
        } else {
            base_ms
                .max(self.sizing.load_time_estimates.for_size_gb(size_gb) as f64)
                .min(max_ms)
        };
        let model_size_factor = (size_gb / self.sizing.default_model_size_gb).clamp(0.5, 6.0);

        let metrics = self.metrics.metrics_for(&server.id, model);
        let historical_factor = if metrics.p95 > 0.0 {
            (metrics.p95 / 1_000.0).clamp(0.5, 5.0)
        } else {
            1.0
        };

        let server_factor = server
            .last_probe_latency_ms
            .map(|ms| (ms as f64 / 500.0).clamp(0.5, 3.0))
            .unwrap_or(1.0);

        let timeouts = *self
            .consecutive_timeouts
            .lock()
            .unwrap()
            .get(&model_key(&server.id, model))
            .unwrap_or(&0);
        let progressive_factor = (1.0 + 0.5 * timeouts as f64).min(3.0);

        let ms = (base_ms * model_size_factor * historical_factor * server_factor * progressive_factor)
            .max(min_ms)
            .min(max_ms);
        Duration::from_millis(ms as u64)
    }
}

enum ProbeAttempt {
    Ok,
    EmbeddingRefusal,
    NonBreaking,
    Failed {
        message: String,
        status: Option<u16>,
        timed_out: bool,
    },
}

fn error_parts(error: &OrchestratorError) -> (String, Option<u16>) {
    match error {
        OrchestratorError::Upstream { message, status, .. } => (message.clone(), *status),
        other => (other.to_string(), None),
    }
}
