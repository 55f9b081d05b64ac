//! End-to-end dispatcher tests against a scripted in-memory upstream.

use bytes::Bytes;
use fleetgate::models::error::{ErrorPatternOverrides, OrchestratorError};
use fleetgate::models::server::{ModelType, ServerSpec};
use fleetgate::models::settings::Settings;
use fleetgate::services::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use fleetgate::services::fleet::Fleet;
use fleetgate::services::history::HistoryStore;
use fleetgate::services::metrics::MetricsAggregator;
use fleetgate::services::orchestrator::{ClientResponse, InferenceRequest, Orchestrator};
use fleetgate::services::persistence::PersistenceManager;
use fleetgate::services::queue::RequestQueue;
use fleetgate::services::recovery::RecoveryTestCoordinator;
use fleetgate::services::upstream::{
    EndpointKind, UpstreamBody, UpstreamClient, UpstreamResponse,
};
use fleetgate::utils::model::model_key;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted reply from the mock backend.
enum Planned {
    Ok(Value),
    HttpError { status: u16, error: String },
    TransportError(String),
    Stream(Vec<Result<&'static str, &'static str>>),
}

/// Scripted upstream: each server id has a FIFO of planned replies; an
/// exhausted script answers 200 with an empty object.
struct MockUpstream {
    models: Mutex<HashMap<String, Vec<String>>>,
    plans: Mutex<HashMap<String, VecDeque<Planned>>>,
    list_failures: Mutex<HashMap<String, u32>>,
}

impl MockUpstream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            models: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            list_failures: Mutex::new(HashMap::new()),
        })
    }

    fn set_models(&self, server_id: &str, models: &[&str]) {
        self.models.lock().unwrap().insert(
            server_id.to_string(),
            models.iter().map(|m| m.to_string()).collect(),
        );
    }

    fn plan(&self, server_id: &str, planned: Planned) {
        self.plans
            .lock()
            .unwrap()
            .entry(server_id.to_string())
            .or_default()
            .push_back(planned);
    }
}

#[async_trait::async_trait]
impl UpstreamClient for MockUpstream {
    async fn list_models(
        &self,
        server: &fleetgate::models::server::ServerRecord,
        _timeout: Duration,
    ) -> Result<Vec<String>, OrchestratorError> {
        let mut failures = self.list_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&server.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(OrchestratorError::Upstream {
                    message: "connection refused".to_string(),
                    url: server.url.clone(),
                    status: None,
                });
            }
        }
        Ok(self
            .models
            .lock()
            .unwrap()
            .get(&server.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn version(
        &self,
        _server: &fleetgate::models::server::ServerRecord,
        _timeout: Duration,
    ) -> Result<String, OrchestratorError> {
        Ok("0.0.0-test".to_string())
    }

    async fn loaded_models(
        &self,
        _server: &fleetgate::models::server::ServerRecord,
        _timeout: Duration,
    ) -> Result<fleetgate::models::server::HardwareSnapshot, OrchestratorError> {
        Ok(fleetgate::models::server::HardwareSnapshot {
            models: Vec::new(),
            captured_at: chrono::Utc::now(),
        })
    }

    async fn forward(
        &self,
        server: &fleetgate::models::server::ServerRecord,
        _endpoint: EndpointKind,
        _payload: Value,
        _streaming: bool,
        _timeout: Duration,
    ) -> Result<UpstreamResponse, OrchestratorError> {
        let planned = self
            .plans
            .lock()
            .unwrap()
            .get_mut(&server.id)
            .and_then(|queue| queue.pop_front());
        match planned.unwrap_or(Planned::Ok(json!({}))) {
            Planned::Ok(body) => {
                let (tokens_generated, tokens_prompt) =
                    fleetgate::services::upstream::extract_token_counts(&body);
                Ok(UpstreamResponse {
                    status: 200,
                    content_type: Some("application/json".to_string()),
                    body: UpstreamBody::Full(Bytes::from(serde_json::to_vec(&body).unwrap())),
                    tokens_generated,
                    tokens_prompt,
                })
            }
            Planned::HttpError { status, error } => Ok(UpstreamResponse {
                status,
                content_type: Some("application/json".to_string()),
                body: UpstreamBody::Full(Bytes::from(
                    serde_json::to_vec(&json!({ "error": error })).unwrap(),
                )),
                tokens_generated: None,
                tokens_prompt: None,
            }),
            Planned::TransportError(message) => Err(OrchestratorError::Upstream {
                message,
                url: server.url.clone(),
                status: None,
            }),
            Planned::Stream(chunks) => {
                let url = server.url.clone();
                let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
                    match chunk {
                        Ok(text) => Ok(Bytes::from(text.to_string())),
                        Err(message) => Err(OrchestratorError::Upstream {
                            message: message.to_string(),
                            url: url.clone(),
                            status: None,
                        }),
                    }
                }))
                .boxed();
                Ok(UpstreamResponse {
                    status: 200,
                    content_type: Some("application/x-ndjson".to_string()),
                    body: UpstreamBody::Stream(stream),
                    tokens_generated: None,
                    tokens_prompt: None,
                })
            }
        }
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    fleet: Arc<Fleet>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
    recovery: Arc<RecoveryTestCoordinator>,
    upstream: Arc<MockUpstream>,
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.enable_persistence = false;
    settings.queue.max_size = 1;
    settings.queue.timeout = 100;
    settings.retry.max_retries_per_server = 1;
    settings.retry.retry_delay_ms = 10;
    settings.circuit_breaker.open_timeout = 50;
    settings
}

/// Builds a harness with the given healthy servers and their model lists.
fn harness_with(settings: Settings, servers: &[(&str, &[&str])]) -> Harness {
    let upstream = MockUpstream::new();
    let fleet = Arc::new(Fleet::new(settings.cooldown.default_max_concurrency));
    let breakers = CircuitBreakerRegistry::new(&settings.circuit_breaker);
    let metrics = MetricsAggregator::new(settings.metrics.clone());
    let queue = Arc::new(RequestQueue::new(settings.queue.clone()));
    let history = Arc::new(HistoryStore::default());
    let persistence = PersistenceManager::new("./unused", false);
    let recovery = RecoveryTestCoordinator::new(
        Arc::clone(&fleet),
        Arc::clone(&breakers),
        Arc::clone(&metrics),
        upstream.clone() as Arc<dyn UpstreamClient>,
        settings.health_check.clone(),
        settings.model_manager.clone(),
        ErrorPatternOverrides::default(),
    );
    let orchestrator = Orchestrator::new(
        settings,
        Arc::clone(&fleet),
        Arc::clone(&breakers),
        Arc::clone(&metrics),
        queue,
        Arc::clone(&recovery),
        upstream.clone() as Arc<dyn UpstreamClient>,
        history,
        persistence,
    );

    for (id, models) in servers {
        fleet
            .add_server(ServerSpec {
                id: Some(id.to_string()),
                url: format!("http://{}:11434", id),
                max_concurrency: Some(1),
                api_key: None,
                api_key_header: None,
            })
            .unwrap();
        let model_list: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        fleet.apply_probe_success(id, model_list.clone(), None, None, None, 5, 1, false);
        upstream.set_models(id, models);
    }

    Harness {
        orchestrator,
        fleet,
        breakers,
        metrics,
        recovery,
        upstream,
    }
}

fn generate_request(model: &str) -> InferenceRequest {
    InferenceRequest {
        model: model.to_string(),
        endpoint: EndpointKind::Generate,
        payload: json!({ "model": model, "prompt": "hello" }),
        streaming: false,
        priority: 0,
    }
}

// ---------------------------------------------------------------------
// Scenario: happy failover
// ---------------------------------------------------------------------

#[tokio::test]
async fn failover_to_second_candidate_on_transient_error() {
    let h = harness_with(test_settings(), &[("a", &["m1"]), ("b", &["m1"])]);
    h.upstream.plan(
        "a",
        Planned::HttpError {
            status: 503,
            error: "service temporarily unavailable".to_string(),
        },
    );
    h.upstream
        .plan("b", Planned::Ok(json!({ "response": "from-b", "eval_count": 5 })));

    let success = h.orchestrator.dispatch(generate_request("m1")).await.unwrap();
    match success.response {
        ClientResponse::Buffered { status, body, .. } => {
            assert_eq!(status, 200);
            let value: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(value["response"], "from-b");
        }
        _ => panic!("expected buffered response"),
    }
    assert_eq!(success.debug.server_id, "b");

    assert_eq!(h.metrics.metrics_for("a", "m1").total_errors, 1);
    assert_eq!(h.metrics.metrics_for("b", "m1").total_count, 1);
    assert_eq!(h.metrics.metrics_for("b", "m1").total_errors, 0);
    assert_eq!(h.breakers.get("a:m1").unwrap().snapshot().failure_count, 1);
    assert_eq!(h.metrics.in_flight("a", "m1"), 0);
    assert_eq!(h.metrics.in_flight("b", "m1"), 0);
}

// ---------------------------------------------------------------------
// Scenario: permanent error bans the model key
// ---------------------------------------------------------------------

#[tokio::test]
async fn permanent_error_bans_key_but_keeps_server_healthy() {
    let h = harness_with(test_settings(), &[("a", &["m2"])]);
    h.upstream.plan(
        "a",
        Planned::HttpError {
            status: 500,
            error: "not enough RAM to load model".to_string(),
        },
    );

    let error = h.orchestrator.dispatch(generate_request("m2")).await.unwrap_err();
    assert!(matches!(error, OrchestratorError::CandidatesExhausted { .. }));
    assert!(h.orchestrator.banned_keys().contains(&"a:m2".to_string()));
    assert!(h.fleet.get("a").unwrap().healthy);

    // Within cooldown and banned: the filter yields nothing.
    let error = h.orchestrator.dispatch(generate_request("m2")).await.unwrap_err();
    assert!(matches!(error, OrchestratorError::NoHealthyCandidates { .. }));
    use actix_web::error::ResponseError;
    assert_eq!(error.status_code().as_u16(), 502);
}

// ---------------------------------------------------------------------
// Scenario: embedding model asked to generate
// ---------------------------------------------------------------------

#[tokio::test]
async fn embedding_model_misroute_is_a_client_error() {
    let h = harness_with(test_settings(), &[("a", &["emb-model"])]);
    h.breakers
        .get_or_create(&model_key("a", "emb-model"))
        .set_model_type(ModelType::Embedding);

    let error = h
        .orchestrator
        .dispatch(generate_request("emb-model"))
        .await
        .unwrap_err();
    assert!(matches!(error, OrchestratorError::CapabilityMismatch { .. }));
    use actix_web::error::ResponseError;
    assert_eq!(error.status_code().as_u16(), 400);

    let snapshot = h.breakers.get("a:emb-model").unwrap().snapshot();
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.total_request_count, 0);
}

#[tokio::test]
async fn embedding_refusal_learns_model_type_without_breaker_failure() {
    let h = harness_with(test_settings(), &[("a", &["emb2"])]);
    h.upstream.plan(
        "a",
        Planned::HttpError {
            status: 400,
            error: "\"emb2\" does not support generate".to_string(),
        },
    );

    let error = h.orchestrator.dispatch(generate_request("emb2")).await.unwrap_err();
    assert!(matches!(error, OrchestratorError::CapabilityMismatch { .. }));

    let breaker = h.breakers.get("a:emb2").unwrap();
    assert_eq!(breaker.model_type(), Some(ModelType::Embedding));
    assert_eq!(breaker.snapshot().failure_count, 0);
    assert!(h.orchestrator.banned_keys().is_empty());
}

// ---------------------------------------------------------------------
// Scenario: half-open recovery via the coordinator
// ---------------------------------------------------------------------

#[tokio::test]
async fn half_open_server_recovers_through_coordinated_probe() {
    let h = harness_with(test_settings(), &[("a", &["m1"])]);
    let server_breaker = h.breakers.get_or_create("a");
    let model_breaker = h.breakers.get_or_create("a:m1");
    server_breaker.force_open("test");
    model_breaker.force_open("test");
    h.fleet.set_healthy("a", false);

    tokio::time::sleep(Duration::from_millis(60)).await;
    h.breakers.sweep();
    assert_eq!(server_breaker.state(), CircuitState::HalfOpen);

    let outcome = h.recovery.probe_server("a").await;
    assert_eq!(outcome, fleetgate::services::recovery::ProbeOutcome::Success);
    assert_eq!(server_breaker.state(), CircuitState::Closed);
    assert_eq!(model_breaker.state(), CircuitState::Closed);
    assert!(h.fleet.get("a").unwrap().healthy);
}

// ---------------------------------------------------------------------
// Scenario: queue full and queue timeout
// ---------------------------------------------------------------------

#[tokio::test]
async fn queue_rejects_overflow_and_times_out_waiters() {
    let h = harness_with(test_settings(), &[("a", &["m1"])]);
    let _pump = h.orchestrator.spawn_pump();

    // Saturate the single slot so the filter sees capacity exhaustion.
    h.metrics.increment_in_flight("a", "m1", false);

    let orchestrator = Arc::clone(&h.orchestrator);
    let waiter = tokio::spawn(async move { orchestrator.dispatch(generate_request("m1")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let overflow = h.orchestrator.dispatch(generate_request("m1")).await.unwrap_err();
    assert!(matches!(overflow, OrchestratorError::QueueFull));
    use actix_web::error::ResponseError;
    assert_eq!(overflow.status_code().as_u16(), 429);

    let waited = waiter.await.unwrap().unwrap_err();
    assert!(matches!(waited, OrchestratorError::QueueTimeout));

    // The manual increment is still the only in-flight request.
    assert_eq!(h.metrics.in_flight("a", "m1"), 1);
    h.metrics.decrement_in_flight("a", "m1", false);
}

// ---------------------------------------------------------------------
// Scenario: mid-stream failure
// ---------------------------------------------------------------------

#[tokio::test]
async fn mid_stream_failure_emits_terminal_frame_and_records_failure() {
    let h = harness_with(test_settings(), &[("a", &["m1"])]);
    h.upstream.plan(
        "a",
        Planned::Stream(vec![
            Ok("{\"response\":\"tok1\"}\n"),
            Ok("{\"response\":\"tok2\"}\n"),
            Ok("{\"response\":\"tok3\"}\n"),
            Err("connection reset by peer"),
        ]),
    );

    let mut request = generate_request("m1");
    request.streaming = true;
    let success = h.orchestrator.dispatch(request).await.unwrap();
    let stream = match success.response {
        ClientResponse::Streaming { stream, .. } => stream,
        _ => panic!("expected streaming response"),
    };
    let frames: Vec<Bytes> = stream.map(|chunk| chunk.unwrap()).collect().await;
    assert_eq!(frames.len(), 4);
    for frame in &frames[..3] {
        assert!(String::from_utf8_lossy(frame).contains("tok"));
    }
    let terminal: Value =
        serde_json::from_slice(frames.last().unwrap()).expect("terminal frame is JSON");
    assert!(terminal["error"].as_str().unwrap().contains("connection reset"));
    assert_eq!(terminal["done"], true);

    let snapshot = h.breakers.get("a:m1").unwrap().snapshot();
    assert_eq!(snapshot.failure_count, 1);
    let metrics = h.metrics.metrics_for("a", "m1");
    assert_eq!(metrics.total_errors, 1);
    assert!(metrics.avg_ttft_ms.is_some());
    assert!(metrics.avg_streaming_duration_ms.is_some());
    assert_eq!(h.metrics.in_flight("a", "m1"), 0);
}

// ---------------------------------------------------------------------
// Filter details
// ---------------------------------------------------------------------

#[tokio::test]
async fn unknown_model_is_a_404() {
    let h = harness_with(test_settings(), &[("a", &["m1"])]);
    let error = h.orchestrator.dispatch(generate_request("nope")).await.unwrap_err();
    assert!(matches!(error, OrchestratorError::ModelNotFound { .. }));
    use actix_web::error::ResponseError;
    assert_eq!(error.status_code().as_u16(), 404);
}

#[tokio::test]
async fn latest_tag_resolution_rewrites_the_payload_model() {
    let h = harness_with(test_settings(), &[("a", &["llama3:latest"])]);
    h.upstream
        .plan("a", Planned::Ok(json!({ "response": "ok" })));
    let success = h.orchestrator.dispatch(generate_request("llama3")).await.unwrap();
    assert_eq!(success.debug.server_id, "a");
    // Metrics and breakers are scoped to the resolved name.
    assert_eq!(h.metrics.metrics_for("a", "llama3:latest").total_count, 1);
}

#[tokio::test]
async fn draining_server_admits_no_new_requests() {
    let h = harness_with(test_settings(), &[("a", &["m1"])]);
    h.fleet.set_draining("a", true);
    let error = h.orchestrator.dispatch(generate_request("m1")).await.unwrap_err();
    assert!(matches!(error, OrchestratorError::NoHealthyCandidates { .. }));
    h.fleet.set_draining("a", false);
    h.upstream.plan("a", Planned::Ok(json!({})));
    assert!(h.orchestrator.dispatch(generate_request("m1")).await.is_ok());
}

#[tokio::test]
async fn same_server_retry_succeeds_after_transient_errors() {
    let mut settings = test_settings();
    settings.retry.max_retries_per_server = 2;
    let h = harness_with(settings, &[("a", &["m1"])]);
    // Phase 1 and phase 2 fail, the phase-3 same-server retry succeeds.
    h.upstream.plan(
        "a",
        Planned::HttpError { status: 503, error: "busy".to_string() },
    );
    h.upstream.plan(
        "a",
        Planned::HttpError { status: 503, error: "busy".to_string() },
    );
    h.upstream.plan("a", Planned::Ok(json!({ "response": "late" })));

    let success = h.orchestrator.dispatch(generate_request("m1")).await.unwrap();
    assert!(success.debug.retry_count >= 2);
    assert_eq!(h.metrics.metrics_for("a", "m1").total_errors, 2);
}

#[tokio::test]
async fn non_retryable_errors_skip_same_server_retries() {
    let mut settings = test_settings();
    settings.retry.max_retries_per_server = 3;
    let h = harness_with(settings, &[("a", &["m1"])]);
    h.upstream.plan(
        "a",
        Planned::HttpError { status: 422, error: "invalid request payload".to_string() },
    );
    h.upstream.plan(
        "a",
        Planned::HttpError { status: 422, error: "invalid request payload".to_string() },
    );
    // If phase 3 ran, this would succeed; it must not.
    h.upstream.plan("a", Planned::Ok(json!({})));

    let error = h.orchestrator.dispatch(generate_request("m1")).await.unwrap_err();
    match error {
        OrchestratorError::CandidatesExhausted { attempts, .. } => {
            assert_eq!(attempts.len(), 2);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn removing_a_server_clears_every_per_key_trace() {
    let h = harness_with(test_settings(), &[("a", &["m1"]), ("b", &["m1"])]);
    h.upstream.plan(
        "a",
        Planned::HttpError { status: 503, error: "temporarily unavailable".to_string() },
    );
    h.upstream.plan("b", Planned::Ok(json!({})));
    h.orchestrator.dispatch(generate_request("m1")).await.unwrap();
    assert!(h.breakers.get("a:m1").is_some());

    h.fleet.remove_server("a");
    h.orchestrator.forget_server("a");
    assert!(h.breakers.get("a").is_none());
    assert!(h.breakers.get("a:m1").is_none());
    assert!(!h.metrics.metrics_for("a", "m1").has_data());
    // The remaining server keeps its state.
    assert!(h.breakers.get("b:m1").is_some());
    assert!(h.metrics.metrics_for("b", "m1").has_data());
}

#[tokio::test]
async fn clearing_a_ban_resets_the_learned_model_type() {
    let h = harness_with(test_settings(), &[("a", &["m3"])]);
    let key = model_key("a", "m3");
    h.orchestrator.ban_key(&key);
    h.breakers.get_or_create(&key).set_model_type(ModelType::Embedding);

    assert!(h.orchestrator.remove_ban(&key));
    assert_eq!(h.breakers.get(&key).unwrap().model_type(), None);
    assert!(h.orchestrator.banned_keys().is_empty());
}
