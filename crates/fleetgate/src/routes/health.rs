//! Health check endpoints for monitoring and Kubernetes probes.

use crate::services::fleet::Fleet;
use actix_web::{web, HttpResponse, Result};
use serde_json::json;
use std::sync::Arc;

/// General health check with service status and fleet summary.
///
/// # Response Format
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.3.0",
///   "timestamp": "2025-03-15T10:30:00Z",
///   "servers": { "total": 3, "healthy": 2 }
/// }
/// ```
pub async fn health_check(fleet: web::Data<Arc<Fleet>>) -> Result<HttpResponse> {
    let servers = fleet.all();
    let healthy = servers.iter().filter(|s| s.healthy).count();
    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "servers": {
            "total": servers.len(),
            "healthy": healthy,
        }
    })))
}

/// Kubernetes readiness probe. Ready means the process is serving; an empty
/// or fully unhealthy fleet is still "ready" (requests fail fast with
/// routing errors rather than hanging).
pub async fn readiness_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Kubernetes liveness probe.
pub async fn liveness_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "alive",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Registers `GET /health`, `GET /ready` and `GET /live`.
pub fn configure_health(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/ready", web::get().to(readiness_check))
        .route("/live", web::get().to(liveness_check));
}
