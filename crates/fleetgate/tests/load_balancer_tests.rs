//! Load balancer ranking tests.

use fleetgate::models::server::ServerSpec;
use fleetgate::models::settings::{LoadBalancerSettings, MetricsSettings};
use fleetgate::services::circuit_breaker::CircuitState;
use fleetgate::services::load_balancer::{
    Candidate, CompositeScoreBalancer, LeastConnectionsBalancer, LoadBalancer, RoundRobinBalancer,
};
use fleetgate::services::metrics::MetricsAggregator;

fn candidate(id: &str, in_flight: u64, breaker_state: CircuitState) -> Candidate {
    let server = ServerSpec {
        id: Some(id.to_string()),
        url: format!("http://{}:11434", id),
        max_concurrency: Some(4),
        api_key: None,
        api_key_header: None,
    }
    .into_record(4);
    let metrics = MetricsAggregator::new(MetricsSettings::default());
    Candidate {
        metrics: metrics.metrics_for(id, "m"),
        in_flight,
        server_in_flight: in_flight,
        breaker_state,
        resolved_model: "m".to_string(),
        server,
    }
}

fn candidate_with_latency(id: &str, latency_ms: f64, success: bool) -> Candidate {
    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    for _ in 0..20 {
        aggregator.record_request(fleetgate::services::metrics::RequestObservation {
            server_id: id.to_string(),
            model: "m".to_string(),
            duration_ms: latency_ms,
            success,
            tokens_generated: None,
            tokens_prompt: None,
            ttft_ms: None,
            streaming_duration_ms: None,
            error_category: None,
            cancelled: false,
        });
    }
    let mut base = candidate(id, 0, CircuitState::Closed);
    base.metrics = aggregator.metrics_for(id, "m");
    base
}

#[test]
fn lower_latency_ranks_first() {
    let balancer = CompositeScoreBalancer::new(LoadBalancerSettings::default());
    let fast = candidate_with_latency("fast", 100.0, true);
    let slow = candidate_with_latency("slow", 20_000.0, true);
    let ranked = balancer.rank(vec![slow, fast], false);
    assert_eq!(ranked[0].candidate.server.id, "fast");
    assert!(ranked[0].score.score > ranked[1].score.score);
}

#[test]
fn failing_backend_ranks_below_healthy_one() {
    let balancer = CompositeScoreBalancer::new(LoadBalancerSettings::default());
    let healthy = candidate_with_latency("healthy", 500.0, true);
    let failing = candidate_with_latency("failing", 500.0, false);
    let ranked = balancer.rank(vec![failing, healthy], false);
    assert_eq!(ranked[0].candidate.server.id, "healthy");
}

#[test]
fn half_open_breaker_halves_the_score() {
    let balancer = CompositeScoreBalancer::new(LoadBalancerSettings::default());
    let closed = candidate("closed", 0, CircuitState::Closed);
    let half_open = candidate("halfopen", 0, CircuitState::HalfOpen);
    let ranked = balancer.rank(vec![half_open, closed], false);
    assert_eq!(ranked[0].candidate.server.id, "closed");
    assert!((ranked[1].score.breaker_multiplier - 0.5).abs() < f64::EPSILON);
}

#[test]
fn tie_breaks_by_free_capacity_then_id() {
    let balancer = CompositeScoreBalancer::new(LoadBalancerSettings::default());
    // Same latency profile, different load: more free capacity wins.
    let busy = candidate("busy", 2, CircuitState::Closed);
    let idle = candidate("idle", 0, CircuitState::Closed);
    let ranked = balancer.rank(vec![busy, idle], false);
    assert_eq!(ranked[0].candidate.server.id, "idle");

    // Fully identical candidates: stable id order.
    let a = candidate("a", 0, CircuitState::Closed);
    let b = candidate("b", 0, CircuitState::Closed);
    let ranked = balancer.rank(vec![b, a], false);
    assert_eq!(ranked[0].candidate.server.id, "a");
}

#[test]
fn round_robin_rotates_across_calls() {
    let balancer = RoundRobinBalancer::new();
    let first = balancer.rank(
        vec![candidate("a", 0, CircuitState::Closed), candidate("b", 0, CircuitState::Closed)],
        false,
    );
    let second = balancer.rank(
        vec![candidate("a", 0, CircuitState::Closed), candidate("b", 0, CircuitState::Closed)],
        false,
    );
    assert_ne!(
        first[0].candidate.server.id,
        second[0].candidate.server.id
    );
}

#[test]
fn least_connections_prefers_fewest_in_flight() {
    let balancer = LeastConnectionsBalancer::new();
    let ranked = balancer.rank(
        vec![candidate("a", 3, CircuitState::Closed), candidate("b", 1, CircuitState::Closed)],
        false,
    );
    assert_eq!(ranked[0].candidate.server.id, "b");
}

#[test]
fn empty_candidate_set_ranks_empty() {
    let balancer = CompositeScoreBalancer::new(LoadBalancerSettings::default());
    assert!(balancer.rank(Vec::new(), false).is_empty());
}
