//! Best-effort persistence round-trips.

use fleetgate::models::error::ErrorCategory;
use fleetgate::models::server::ServerSpec;
use fleetgate::models::settings::{CircuitBreakerSettings, MetricsSettings};
use fleetgate::services::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use fleetgate::services::fleet::Fleet;
use fleetgate::services::metrics::{MetricsAggregator, MetricsExport, RequestObservation};
use fleetgate::services::persistence::{PersistKind, PersistenceManager};

fn spec(id: &str) -> ServerSpec {
    ServerSpec {
        id: Some(id.to_string()),
        url: format!("http://{}:11434", id),
        max_concurrency: Some(2),
        api_key: None,
        api_key_header: None,
    }
}

#[tokio::test]
async fn breaker_snapshots_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = PersistenceManager::new(dir.path(), true);

    let registry = CircuitBreakerRegistry::new(&CircuitBreakerSettings::default());
    registry
        .get_or_create("a:m1")
        .record_failure(ErrorCategory::Transient, "reset");
    registry.get_or_create("a:m1").record_success();
    persistence.schedule(PersistKind::Breakers, &registry.snapshots());
    persistence.flush().await;

    let reloaded: Vec<BreakerSnapshot> = persistence.load(PersistKind::Breakers).await.unwrap();
    let restored = CircuitBreakerRegistry::new(&CircuitBreakerSettings::default());
    restored.restore(reloaded);
    let snapshot = restored.get("a:m1").unwrap().snapshot();
    assert_eq!(snapshot.failure_count, 1);
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(snapshot.categories.transient, 1);
}

#[tokio::test]
async fn metrics_export_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = PersistenceManager::new(dir.path(), true);

    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    for i in 0..8 {
        aggregator.record_request(RequestObservation {
            server_id: "a".to_string(),
            model: "m".to_string(),
            duration_ms: 100.0 + i as f64,
            success: i % 4 != 0,
            tokens_generated: None,
            tokens_prompt: None,
            ttft_ms: None,
            streaming_duration_ms: None,
            error_category: None,
            cancelled: false,
        });
    }
    persistence.schedule(PersistKind::Metrics, &aggregator.export());
    persistence.flush().await;

    let export: MetricsExport = persistence.load(PersistKind::Metrics).await.unwrap();
    let restored = MetricsAggregator::new(MetricsSettings::default());
    restored.restore(export);
    let snapshot = restored.metrics_for("a", "m");
    assert_eq!(snapshot.total_count, 8);
    assert_eq!(snapshot.total_errors, 2);
}

#[tokio::test]
async fn fleet_restores_with_health_reset() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = PersistenceManager::new(dir.path(), true);

    let fleet = Fleet::new(4);
    fleet.add_server(spec("a")).unwrap();
    fleet.apply_probe_success("a", vec!["m1".to_string()], None, None, None, 3, 1, false);
    fleet.set_maintenance("a", true);
    assert!(fleet.get("a").unwrap().healthy);
    persistence.schedule(PersistKind::Servers, &fleet.export());
    persistence.flush().await;

    let records = persistence.load(PersistKind::Servers).await.unwrap();
    let restored = Fleet::new(4);
    restored.restore(records);
    let server = restored.get("a").unwrap();
    // Discovery data and operator bits survive; health waits for a probe.
    assert_eq!(server.models, vec!["m1".to_string()]);
    assert!(server.maintenance);
    assert!(!server.healthy);
}

#[tokio::test]
async fn corrupt_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bans.json"), "{{{{").unwrap();
    let persistence = PersistenceManager::new(dir.path(), true);
    let bans: Option<Vec<String>> = persistence.load(PersistKind::Bans).await;
    assert!(bans.is_none());
}

#[tokio::test]
async fn disabled_persistence_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = PersistenceManager::new(dir.path(), false);
    persistence.schedule(PersistKind::Bans, &vec!["a:m".to_string()]);
    persistence.flush().await;
    assert!(!dir.path().join("bans.json").exists());
    let bans: Option<Vec<String>> = persistence.load(PersistKind::Bans).await;
    assert!(bans.is_none());
}
