//! Configuration loading and validation tests.

use fleetgate::config::settings::{load_settings_from, save_settings_to};
use fleetgate::config::validation::ConfigValidator;
use fleetgate::models::settings::{BalancerAlgorithm, Settings};

#[test]
fn missing_file_yields_defaults() {
    let settings = load_settings_from("/definitely/not/a/config.json").unwrap();
    assert_eq!(settings.port, Settings::default().port);
    assert!(settings.enable_queue);
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(load_settings_from(path.to_str().unwrap()).is_err());
}

#[test]
fn unknown_keys_are_rejected_at_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "queue": { "maxSize": 5, "maxDepth": 9 } }"#).unwrap();
    let error = load_settings_from(path.to_str().unwrap()).unwrap_err();
    assert!(error.to_string().contains("maxDepth"));
}

#[test]
fn full_config_parses_with_camel_case_keys() {
    let raw = r#"{
        "port": 9000,
        "host": "127.0.0.1",
        "logLevel": "debug",
        "enablePersistence": false,
        "servers": [
            { "id": "b1", "url": "http://b1:11434", "maxConcurrency": 8 }
        ],
        "queue": { "maxSize": 50, "timeout": 20000, "priorityBoostInterval": 2000 },
        "loadBalancer": {
            "algorithm": "leastConnections",
            "weights": { "latency": 0.5, "successRate": 0.2, "load": 0.2, "capacity": 0.1 },
            "thresholds": { "maxP95Latency": 20000.0 }
        },
        "circuitBreaker": {
            "baseFailureThreshold": 4,
            "errorPatterns": { "nonRetryable": ["quota exceeded"], "transient": [] }
        },
        "security": { "apiKeyHeader": "x-key", "adminApiKeys": ["secret"] },
        "metrics": { "decay": { "halfLifeMs": 60000 } },
        "healthCheck": { "intervalMs": 5000 },
        "retry": { "maxRetriesPerServer": 1, "retryableStatusCodes": [502, 503] },
        "cooldown": { "failureCooldownMs": 15000 },
        "modelManager": { "gbPerBillionParams": 2.5 }
    }"#;
    let settings: Settings = serde_json::from_str(raw).unwrap();
    assert_eq!(settings.port, 9000);
    assert_eq!(settings.load_balancer.algorithm, BalancerAlgorithm::LeastConnections);
    assert_eq!(settings.circuit_breaker.base_failure_threshold, 4);
    assert_eq!(settings.circuit_breaker.error_patterns.non_retryable.len(), 1);
    assert_eq!(settings.retry.retryable_status_codes, vec![502, 503]);
    assert_eq!(settings.servers[0].max_concurrency, Some(8));
    assert_eq!(settings.metrics.decay.half_life_ms, 60000);
    // Untouched sections keep their defaults.
    assert_eq!(settings.streaming.buffer_size, 8192);
}

#[tokio::test]
async fn save_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let mut settings = Settings::default();
    settings.port = 7777;
    settings.queue.max_size = 42;
    save_settings_to(&settings, path.to_str().unwrap()).await.unwrap();

    let loaded = load_settings_from(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.port, 7777);
    assert_eq!(loaded.queue.max_size, 42);
}

#[test]
fn validator_flags_inconsistent_settings() {
    let mut settings = Settings::default();
    settings.circuit_breaker.half_open_max_requests = 0;
    settings.retry.backoff_multiplier = 0.5;
    let result = ConfigValidator::validate_comprehensive(&settings);
    assert!(!result.is_valid);
    assert!(result.errors.len() >= 2);
}
