//! Prometheus-compatible metrics endpoint.
//!
//! Exposes the global rollup (request counts, error rate, in-flight
//! gauges, queue depth) plus per-breaker state gauges in Prometheus text
//! exposition format at `GET /metrics`.

use crate::services::circuit_breaker::CircuitState;
use crate::services::orchestrator::Orchestrator;
use actix_web::{web, HttpResponse, Result};
use std::sync::Arc;

/// Renders the metrics page.
pub async fn metrics_endpoint(orchestrator: web::Data<Arc<Orchestrator>>) -> Result<HttpResponse> {
    let global = orchestrator.metrics().global_metrics();
    let queue = orchestrator.queue().stats();
    let servers = orchestrator.fleet().all();
    let healthy = servers.iter().filter(|s| s.healthy).count();

    let mut breaker_metrics = String::new();
    let snapshots = orchestrator.breakers().snapshots();
    if !snapshots.is_empty() {
        breaker_metrics.push_str(
            "\n# HELP fleetgate_circuit_breaker_state Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)\n",
        );
        breaker_metrics.push_str("# TYPE fleetgate_circuit_breaker_state gauge\n");
        for snapshot in &snapshots {
            let state_value = match snapshot.state {
                CircuitState::Closed => 0,
                CircuitState::Open => 1,
                CircuitState::HalfOpen => 2,
            };
            breaker_metrics.push_str(&format!(
                "fleetgate_circuit_breaker_state{{key=\"{}\"}} {}\n",
                snapshot.key, state_value
            ));
        }
        breaker_metrics.push_str(
            "\n# HELP fleetgate_circuit_breaker_failures Circuit breaker failure count\n",
        );
        breaker_metrics.push_str("# TYPE fleetgate_circuit_breaker_failures counter\n");
        for snapshot in &snapshots {
            breaker_metrics.push_str(&format!(
                "fleetgate_circuit_breaker_failures{{key=\"{}\"}} {}\n",
                snapshot.key, snapshot.failure_count
            ));
        }
        breaker_metrics.push_str(
            "\n# HELP fleetgate_circuit_breaker_blocked Requests blocked by an open circuit\n",
        );
        breaker_metrics.push_str("# TYPE fleetgate_circuit_breaker_blocked counter\n");
        for snapshot in &snapshots {
            breaker_metrics.push_str(&format!(
                "fleetgate_circuit_breaker_blocked{{key=\"{}\"}} {}\n",
                snapshot.key, snapshot.blocked_request_count
            ));
        }
    }

    let metrics_text = format!(
        r#"# HELP fleetgate_requests_total Total proxied requests
# TYPE fleetgate_requests_total counter
fleetgate_requests_total {}

# HELP fleetgate_requests_error_total Total failed proxied requests
# TYPE fleetgate_requests_error_total counter
fleetgate_requests_error_total {}

# HELP fleetgate_error_rate Overall error rate
# TYPE fleetgate_error_rate gauge
fleetgate_error_rate {:.4}

# HELP fleetgate_requests_per_second Request rate over the last minute
# TYPE fleetgate_requests_per_second gauge
fleetgate_requests_per_second {:.2}

# HELP fleetgate_in_flight Regular in-flight requests
# TYPE fleetgate_in_flight gauge
fleetgate_in_flight {}

# HELP fleetgate_in_flight_bypass Recovery-probe in-flight requests
# TYPE fleetgate_in_flight_bypass gauge
fleetgate_in_flight_bypass {}

# HELP fleetgate_queue_depth Requests waiting in the queue
# TYPE fleetgate_queue_depth gauge
fleetgate_queue_depth {}

# HELP fleetgate_queue_timeouts_total Requests expired in the queue
# TYPE fleetgate_queue_timeouts_total counter
fleetgate_queue_timeouts_total {}

# HELP fleetgate_servers_total Registered backend servers
# TYPE fleetgate_servers_total gauge
fleetgate_servers_total {}

# HELP fleetgate_servers_healthy Healthy backend servers
# TYPE fleetgate_servers_healthy gauge
fleetgate_servers_healthy {}{}
"#,
        global.total_requests,
        global.total_errors,
        global.error_rate,
        global.requests_per_second,
        global.in_flight_regular,
        global.in_flight_bypass,
        queue.size,
        queue.total_timed_out,
        servers.len(),
        healthy,
        breaker_metrics
    );

    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(metrics_text))
}

/// Registers `GET /metrics`.
pub fn configure_metrics(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics_endpoint));
}
