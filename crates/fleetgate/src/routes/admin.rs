//! Administrative REST surface for operating the fleet at runtime.
//!
//! Covers server management (add/remove/update, drain, maintenance),
//! breaker administration (list/reset/force-open/force-close), ban
//! management, configuration get/update/save/reload, queue inspection and
//! pause/resume, metrics export, decision and request history, and
//! per-(server,model) stats.
//!
//! Admin operations fail fast with 4xx on validation errors and never
//! mutate state partially: configuration updates swap the in-memory tree
//! atomically, and persistence runs in the debounced writer.

use crate::config::settings::{load_settings_from, save_settings_to};
use crate::models::error::OrchestratorError;
use crate::models::server::ServerSpec;
use crate::models::settings::Settings;
use crate::services::fleet::ServerPatch;
use crate::services::orchestrator::Orchestrator;
use actix_web::{delete, get, post, put, web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Shared state for the admin surface.
#[derive(Clone)]
pub struct AdminState {
    pub orchestrator: Arc<Orchestrator>,
    pub config_path: String,
}

/// Envelope for admin operation responses.
#[derive(Serialize, Deserialize)]
pub struct AdminResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AdminResponse {
    fn ok(message: impl Into<String>) -> HttpResponse {
        HttpResponse::Ok().json(Self {
            success: true,
            message: message.into(),
            data: None,
        })
    }

    fn ok_with(message: impl Into<String>, data: serde_json::Value) -> HttpResponse {
        HttpResponse::Ok().json(Self {
            success: true,
            message: message.into(),
            data: Some(data),
        })
    }

    fn not_found(message: impl Into<String>) -> HttpResponse {
        HttpResponse::NotFound().json(Self {
            success: false,
            message: message.into(),
            data: None,
        })
    }
}

// ---------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------

#[get("/admin/servers")]
pub async fn list_servers(state: web::Data<AdminState>) -> impl Responder {
    let servers = state.orchestrator.fleet().all();
    AdminResponse::ok_with(
        format!("{} servers", servers.len()),
        json!({ "servers": servers }),
    )
}

#[post("/admin/servers")]
pub async fn add_server(
    state: web::Data<AdminState>,
    spec: web::Json<ServerSpec>,
) -> Result<HttpResponse, OrchestratorError> {
    let record = state.orchestrator.fleet().add_server(spec.into_inner())?;
    // Materialize the server breaker so it shows up on the breaker surface
    // immediately.
    state.orchestrator.breakers().get_or_create(&record.id);
    Ok(AdminResponse::ok_with(
        format!("server {} registered", record.id),
        json!({ "server": record }),
    ))
}

#[put("/admin/servers/{id}")]
pub async fn update_server(
    state: web::Data<AdminState>,
    path: web::Path<String>,
    patch: web::Json<ServerPatch>,
) -> Result<HttpResponse, OrchestratorError> {
    let id = path.into_inner();
    let record = state.orchestrator.fleet().update_server(&id, patch.into_inner())?;
    Ok(AdminResponse::ok_with(
        format!("server {} updated", id),
        json!({ "server": record }),
    ))
}

#[delete("/admin/servers/{id}")]
pub async fn remove_server(state: web::Data<AdminState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match state.orchestrator.fleet().remove_server(&id) {
        Some(_) => {
            state.orchestrator.forget_server(&id);
            AdminResponse::ok(format!("server {} removed", id))
        }
        None => AdminResponse::not_found(format!("unknown server: {}", id)),
    }
}

#[post("/admin/servers/{id}/drain")]
pub async fn drain_server(state: web::Data<AdminState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    if state.orchestrator.fleet().set_draining(&id, true) {
        AdminResponse::ok(format!("server {} draining", id))
    } else {
        AdminResponse::not_found(format!("unknown server: {}", id))
    }
}

#[post("/admin/servers/{id}/undrain")]
pub async fn undrain_server(state: web::Data<AdminState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    if state.orchestrator.fleet().set_draining(&id, false) {
        AdminResponse::ok(format!("server {} accepting requests", id))
    } else {
        AdminResponse::not_found(format!("unknown server: {}", id))
    }
}

#[derive(Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

#[post("/admin/servers/{id}/maintenance")]
pub async fn set_maintenance(
    state: web::Data<AdminState>,
    path: web::Path<String>,
    body: web::Json<MaintenanceRequest>,
) -> impl Responder {
    let id = path.into_inner();
    if state.orchestrator.fleet().set_maintenance(&id, body.enabled) {
        AdminResponse::ok(format!(
            "server {} maintenance {}",
            id,
            if body.enabled { "on" } else { "off" }
        ))
    } else {
        AdminResponse::not_found(format!("unknown server: {}", id))
    }
}

// ---------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------

#[get("/admin/breakers")]
pub async fn list_breakers(state: web::Data<AdminState>) -> impl Responder {
    let snapshots = state.orchestrator.breakers().snapshots();
    AdminResponse::ok_with(
        format!("{} breakers", snapshots.len()),
        json!({ "breakers": snapshots }),
    )
}

#[post("/admin/breakers/{key:.*}/force-open")]
pub async fn force_open_breaker(
    state: web::Data<AdminState>,
    path: web::Path<String>,
) -> impl Responder {
    let key = path.into_inner();
    let breaker = state.orchestrator.breakers().get_or_create(&key);
    breaker.force_open("admin");
    AdminResponse::ok(format!("breaker {} forced open", key))
}

#[post("/admin/breakers/{key:.*}/force-close")]
pub async fn force_close_breaker(
    state: web::Data<AdminState>,
    path: web::Path<String>,
) -> impl Responder {
    let key = path.into_inner();
    match state.orchestrator.breakers().get(&key) {
        Some(breaker) => {
            breaker.force_close();
            AdminResponse::ok(format!("breaker {} forced closed", key))
        }
        None => AdminResponse::not_found(format!("unknown breaker: {}", key)),
    }
}

#[post("/admin/breakers/{key:.*}/reset")]
pub async fn reset_breaker(state: web::Data<AdminState>, path: web::Path<String>) -> impl Responder {
    let key = path.into_inner();
    match state.orchestrator.breakers().get(&key) {
        Some(breaker) => {
            breaker.force_close();
            AdminResponse::ok(format!("breaker {} reset", key))
        }
        None => AdminResponse::not_found(format!("unknown breaker: {}", key)),
    }
}

// ---------------------------------------------------------------------
// Bans
// ---------------------------------------------------------------------

#[get("/admin/bans")]
pub async fn list_bans(state: web::Data<AdminState>) -> impl Responder {
    let bans = state.orchestrator.banned_keys();
    AdminResponse::ok_with(format!("{} bans", bans.len()), json!({ "bans": bans }))
}

#[delete("/admin/bans/{key:.*}")]
pub async fn remove_ban(state: web::Data<AdminState>, path: web::Path<String>) -> impl Responder {
    let key = path.into_inner();
    if state.orchestrator.remove_ban(&key) {
        AdminResponse::ok(format!("ban {} removed", key))
    } else {
        AdminResponse::not_found(format!("no ban for key: {}", key))
    }
}

#[delete("/admin/bans")]
pub async fn clear_bans(state: web::Data<AdminState>) -> impl Responder {
    let cleared = state.orchestrator.clear_bans();
    AdminResponse::ok(format!("{} bans cleared", cleared))
}

// ---------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------

#[get("/admin/config")]
pub async fn get_config(state: web::Data<AdminState>) -> impl Responder {
    let settings = state.orchestrator.settings();
    AdminResponse::ok_with("current configuration", json!({ "config": settings }))
}

#[put("/admin/config")]
pub async fn update_config(
    state: web::Data<AdminState>,
    body: web::Json<Settings>,
) -> Result<HttpResponse, OrchestratorError> {
    let settings = body.into_inner();
    settings
        .validate()
        .map_err(|message| OrchestratorError::BadRequest { message })?;
    state.orchestrator.update_settings(settings);
    Ok(AdminResponse::ok("configuration updated"))
}

#[post("/admin/config/save")]
pub async fn save_config(state: web::Data<AdminState>) -> Result<HttpResponse, OrchestratorError> {
    let settings = state.orchestrator.settings();
    save_settings_to(&settings, &state.config_path).await?;
    Ok(AdminResponse::ok(format!("configuration saved to {}", state.config_path)))
}

#[post("/admin/config/reload")]
pub async fn reload_config(state: web::Data<AdminState>) -> Result<HttpResponse, OrchestratorError> {
    let settings = load_settings_from(&state.config_path)?;
    settings
        .validate()
        .map_err(|message| OrchestratorError::Config { message })?;
    state.orchestrator.update_settings(settings);
    Ok(AdminResponse::ok(format!("configuration reloaded from {}", state.config_path)))
}

// ---------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------

#[get("/admin/queue")]
pub async fn list_queue(state: web::Data<AdminState>) -> impl Responder {
    let items = state.orchestrator.queue().items();
    AdminResponse::ok_with(format!("{} queued", items.len()), json!({ "items": items }))
}

#[get("/admin/queue/stats")]
pub async fn queue_stats(state: web::Data<AdminState>) -> impl Responder {
    AdminResponse::ok_with("queue stats", json!(state.orchestrator.queue().stats()))
}

#[post("/admin/queue/pause")]
pub async fn pause_queue(state: web::Data<AdminState>) -> impl Responder {
    state.orchestrator.queue().pause();
    AdminResponse::ok("queue paused")
}

#[post("/admin/queue/resume")]
pub async fn resume_queue(state: web::Data<AdminState>) -> impl Responder {
    state.orchestrator.queue().resume();
    AdminResponse::ok("queue resumed")
}

// ---------------------------------------------------------------------
// Metrics, history & stats
// ---------------------------------------------------------------------

#[get("/admin/metrics")]
pub async fn metrics_export(state: web::Data<AdminState>) -> impl Responder {
    let global = state.orchestrator.metrics().global_metrics();
    let keys: Vec<_> = state
        .orchestrator
        .metrics()
        .tracked_keys()
        .into_iter()
        .map(|(server, model)| state.orchestrator.metrics().metrics_for(&server, &model))
        .collect();
    AdminResponse::ok_with(
        "metrics export",
        json!({ "global": global, "keys": keys }),
    )
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    #[serde(default)]
    pub server: Option<String>,
}

fn default_history_limit() -> usize {
    100
}

#[get("/admin/history/decisions")]
pub async fn decision_history(
    state: web::Data<AdminState>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    let decisions = state.orchestrator.history().decisions(query.limit);
    AdminResponse::ok_with(
        format!("{} decisions", decisions.len()),
        json!({ "decisions": decisions }),
    )
}

#[get("/admin/history/requests")]
pub async fn request_history(
    state: web::Data<AdminState>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    let requests = state
        .orchestrator
        .history()
        .requests(query.limit, query.server.as_deref());
    AdminResponse::ok_with(
        format!("{} requests", requests.len()),
        json!({ "requests": requests }),
    )
}

#[get("/admin/stats/{server}/{model:.*}")]
pub async fn key_stats(state: web::Data<AdminState>, path: web::Path<(String, String)>) -> impl Responder {
    let (server, model) = path.into_inner();
    let stats = state.orchestrator.key_stats(&server, &model);
    AdminResponse::ok_with("key stats", json!(stats))
}

/// Capacity, error and trend analytics assembled from live state: per-server
/// utilization, per-key error counts, and short-vs-long window latency
/// movement.
#[get("/admin/analytics")]
pub async fn analytics(state: web::Data<AdminState>) -> impl Responder {
    let orchestrator = &state.orchestrator;
    let metrics = orchestrator.metrics();

    let capacity: Vec<serde_json::Value> = orchestrator
        .fleet()
        .all()
        .into_iter()
        .map(|server| {
            let in_flight = metrics.in_flight_for_server(&server.id);
            json!({
                "serverId": server.id,
                "healthy": server.healthy,
                "inFlight": in_flight,
                "maxConcurrency": server.max_concurrency,
                "utilization": in_flight as f64 / server.max_concurrency.max(1) as f64,
            })
        })
        .collect();

    let errors: Vec<serde_json::Value> = orchestrator
        .breakers()
        .snapshots()
        .into_iter()
        .filter(|snapshot| snapshot.failure_count > 0 || snapshot.blocked_request_count > 0)
        .map(|snapshot| {
            json!({
                "key": snapshot.key,
                "state": snapshot.state,
                "failures": snapshot.failure_count,
                "blocked": snapshot.blocked_request_count,
                "categories": snapshot.categories,
                "lastFailure": snapshot.last_failure_reason,
            })
        })
        .collect();

    let trends: Vec<serde_json::Value> = metrics
        .tracked_keys()
        .into_iter()
        .map(|(server, model)| {
            let snapshot = metrics.metrics_for(&server, &model);
            json!({
                "serverId": server,
                "model": model,
                "recentAvgLatencyMs": snapshot.window_1m.avg_latency,
                "baselineAvgLatencyMs": snapshot.window_15m.avg_latency,
                "recentSuccessRate": snapshot.window_1m.success_rate,
                "stale": snapshot.stale,
            })
        })
        .collect();

    let global = metrics.global_metrics();
    AdminResponse::ok_with(
        "analytics",
        json!({
            "global": global,
            "capacity": capacity,
            "errors": errors,
            "trends": trends,
        }),
    )
}

/// Registers the whole admin surface.
pub fn configure_admin(cfg: &mut web::ServiceConfig) {
    cfg.service(list_servers)
        .service(add_server)
        .service(update_server)
        .service(remove_server)
        .service(drain_server)
        .service(undrain_server)
        .service(set_maintenance)
        .service(list_breakers)
        .service(force_open_breaker)
        .service(force_close_breaker)
        .service(reset_breaker)
        .service(list_bans)
        .service(remove_ban)
        .service(clear_bans)
        .service(get_config)
        .service(update_config)
        .service(save_config)
        .service(reload_config)
        .service(list_queue)
        .service(queue_stats)
        .service(pause_queue)
        .service(resume_queue)
        .service(metrics_export)
        .service(decision_history)
        .service(request_history)
        .service(analytics)
        .service(key_stats);
}
