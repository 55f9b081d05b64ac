//! Circuit breaker registry and escalation tests. The state machine itself
//! is covered by unit tests next to the implementation; these exercise the
//! registry-level behaviors the orchestrator and scheduler rely on.

use fleetgate::models::error::ErrorCategory;
use fleetgate::models::settings::CircuitBreakerSettings;
use fleetgate::services::circuit_breaker::{CircuitBreakerRegistry, CircuitState};

fn settings() -> CircuitBreakerSettings {
    CircuitBreakerSettings {
        base_failure_threshold: 2,
        open_timeout: 50,
        ..CircuitBreakerSettings::default()
    }
}

#[test]
fn get_or_create_is_idempotent() {
    let registry = CircuitBreakerRegistry::new(&settings());
    let first = registry.get_or_create("a:m");
    first.record_failure(ErrorCategory::Transient, "x");
    let second = registry.get_or_create("a:m");
    assert_eq!(second.snapshot().failure_count, 1);
}

#[test]
fn sweep_promotes_overdue_open_breakers() {
    let registry = CircuitBreakerRegistry::new(&settings());
    let breaker = registry.get_or_create("a");
    breaker.force_open("test");
    assert_eq!(breaker.state(), CircuitState::Open);

    std::thread::sleep(std::time::Duration::from_millis(60));
    registry.sweep();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[test]
fn escalation_opens_the_server_breaker() {
    let mut cfg = settings();
    cfg.model_escalation.ratio_threshold = 0.5;
    cfg.model_escalation.duration_threshold_ms = 0;
    let registry = CircuitBreakerRegistry::new(&cfg);

    // Two of three model breakers open.
    registry.get_or_create("a:m1").force_open("test");
    registry.get_or_create("a:m2").force_open("test");
    registry.get_or_create("a:m3");

    registry.run_escalation_sweep(&["a".to_string()]);
    assert_eq!(registry.get_or_create("a").state(), CircuitState::Open);
}

#[test]
fn escalation_respects_the_ratio_threshold() {
    let mut cfg = settings();
    cfg.model_escalation.ratio_threshold = 0.9;
    cfg.model_escalation.duration_threshold_ms = 0;
    let registry = CircuitBreakerRegistry::new(&cfg);

    registry.get_or_create("a:m1").force_open("test");
    registry.get_or_create("a:m2");

    registry.run_escalation_sweep(&["a".to_string()]);
    assert_eq!(registry.get_or_create("a").state(), CircuitState::Closed);
}

#[test]
fn force_close_wins_over_escalation_state() {
    let mut cfg = settings();
    cfg.model_escalation.ratio_threshold = 0.5;
    cfg.model_escalation.duration_threshold_ms = 0;
    let registry = CircuitBreakerRegistry::new(&cfg);

    registry.get_or_create("a:m1").force_open("test");
    registry.run_escalation_sweep(&["a".to_string()]);
    let server_breaker = registry.get_or_create("a");
    assert_eq!(server_breaker.state(), CircuitState::Open);

    // Recovery force-close gives the server a clean slate; admissions flow
    // until the next failure regardless of prior escalation.
    server_breaker.force_close();
    assert_eq!(server_breaker.state(), CircuitState::Closed);
    assert!(server_breaker.can_execute());
    assert_eq!(server_breaker.snapshot().consecutive_failed_recoveries, 0);
}

#[test]
fn snapshots_round_trip_through_the_registry() {
    let registry = CircuitBreakerRegistry::new(&settings());
    registry.get_or_create("a").record_failure(ErrorCategory::Transient, "x");
    registry
        .get_or_create("a:m1")
        .record_failure(ErrorCategory::Permanent, "oom");
    let snapshots = registry.snapshots();

    let restored = CircuitBreakerRegistry::new(&settings());
    restored.restore(snapshots);
    assert_eq!(restored.get("a").unwrap().snapshot().failure_count, 1);
    assert_eq!(
        restored.get("a:m1").unwrap().snapshot().categories.permanent,
        1
    );
}
