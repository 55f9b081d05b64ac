//! The client-facing inference surface.
//!
//! Mirrors the upstream inference API: `POST /api/generate`,
//! `POST /api/chat`, `POST /api/embeddings`, `GET /api/tags` (aggregated
//! fleet-wide model list) and `GET /api/version`. Streaming responses are
//! newline-delimited JSON chunks passed through unchanged apart from
//! per-chunk instrumentation.
//!
//! Clients can opt into routing debug headers by sending
//! `x-fleetgate-debug: 1`; the response then carries the selected server,
//! breaker states, candidate count and retry count for the request.

use crate::models::error::OrchestratorError;
use crate::services::orchestrator::{ClientResponse, DispatchDebug, InferenceRequest, Orchestrator};
use crate::services::upstream::EndpointKind;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::{json, Value};
use std::sync::Arc;

const DEBUG_HEADER: &str = "x-fleetgate-debug";

fn parse_payload(body: &web::Bytes) -> Result<Value, OrchestratorError> {
    serde_json::from_slice::<Value>(body).map_err(|e| OrchestratorError::BadRequest {
        message: format!("invalid JSON body: {}", e),
    })
}

fn require_model(payload: &Value) -> Result<String, OrchestratorError> {
    payload
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| OrchestratorError::BadRequest {
            message: "missing required field: model".to_string(),
        })
}

fn wants_stream(payload: &Value, default: bool) -> bool {
    payload.get("stream").and_then(Value::as_bool).unwrap_or(default)
}

fn apply_debug_headers(
    builder: &mut actix_web::HttpResponseBuilder,
    req: &HttpRequest,
    debug: &DispatchDebug,
) {
    if req.headers().get(DEBUG_HEADER).is_none() {
        return;
    }
    builder
        .insert_header(("x-fleetgate-server", debug.server_id.clone()))
        .insert_header((
            "x-fleetgate-server-breaker",
            format!("{:?}", debug.server_breaker),
        ))
        .insert_header((
            "x-fleetgate-model-breaker",
            format!("{:?}", debug.model_breaker),
        ))
        .insert_header(("x-fleetgate-candidates", debug.candidate_count.to_string()))
        .insert_header(("x-fleetgate-retries", debug.retry_count.to_string()));
}

async fn forward(
    req: HttpRequest,
    body: web::Bytes,
    orchestrator: web::Data<Arc<Orchestrator>>,
    endpoint: EndpointKind,
    stream_default: bool,
) -> Result<HttpResponse, OrchestratorError> {
    let payload = parse_payload(&body)?;
    let model = require_model(&payload)?;
    let streaming = endpoint != EndpointKind::Embeddings && wants_stream(&payload, stream_default);

    let success = orchestrator
        .dispatch(InferenceRequest {
            model,
            endpoint,
            payload,
            streaming,
            priority: 0,
        })
        .await?;

    match success.response {
        ClientResponse::Buffered {
            status,
            content_type,
            body,
        } => {
            let mut builder = HttpResponse::build(
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            );
            if let Some(content_type) = content_type {
                builder.content_type(content_type);
            }
            apply_debug_headers(&mut builder, &req, &success.debug);
            Ok(builder.body(body))
        }
        ClientResponse::Streaming {
            content_type,
            stream,
        } => {
            let mut builder = HttpResponse::Ok();
            builder.content_type(
                content_type.unwrap_or_else(|| "application/x-ndjson".to_string()),
            );
            apply_debug_headers(&mut builder, &req, &success.debug);
            Ok(builder.streaming(stream))
        }
    }
}

/// `POST /api/generate` — generation, streaming by default.
pub async fn generate(
    req: HttpRequest,
    body: web::Bytes,
    orchestrator: web::Data<Arc<Orchestrator>>,
) -> Result<HttpResponse, OrchestratorError> {
    forward(req, body, orchestrator, EndpointKind::Generate, true).await
}

/// `POST /api/chat` — chat, streaming by default.
pub async fn chat(
    req: HttpRequest,
    body: web::Bytes,
    orchestrator: web::Data<Arc<Orchestrator>>,
) -> Result<HttpResponse, OrchestratorError> {
    forward(req, body, orchestrator, EndpointKind::Chat, true).await
}

/// `POST /api/embeddings` — embeddings, never streamed.
pub async fn embeddings(
    req: HttpRequest,
    body: web::Bytes,
    orchestrator: web::Data<Arc<Orchestrator>>,
) -> Result<HttpResponse, OrchestratorError> {
    forward(req, body, orchestrator, EndpointKind::Embeddings, false).await
}

/// `GET /api/tags` — aggregated fleet-wide model list.
pub async fn tags(orchestrator: web::Data<Arc<Orchestrator>>) -> HttpResponse {
    let models = orchestrator.fleet().aggregated_tags();
    HttpResponse::Ok().json(json!({ "models": models }))
}

/// `GET /api/version` — orchestrator version.
pub async fn version() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// Registers the inference surface with a payload size cap.
pub fn configure_proxy(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(32 * 1024 * 1024))
        .route("/api/generate", web::post().to(generate))
        .route("/api/chat", web::post().to(chat))
        .route("/api/embeddings", web::post().to(embeddings))
        .route("/api/tags", web::get().to(tags))
        .route("/api/version", web::get().to(version));
}
