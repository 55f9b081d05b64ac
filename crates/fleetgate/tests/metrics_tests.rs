//! Metrics aggregator behavior: windows, decay, global rollup, in-flight
//! accounting across servers.

use fleetgate::models::settings::MetricsSettings;
use fleetgate::services::metrics::{MetricsAggregator, RequestObservation};

fn observation(server: &str, model: &str, duration: f64, success: bool) -> RequestObservation {
    RequestObservation {
        server_id: server.to_string(),
        model: model.to_string(),
        duration_ms: duration,
        success,
        tokens_generated: Some(10),
        tokens_prompt: Some(4),
        ttft_ms: None,
        streaming_duration_ms: None,
        error_category: None,
        cancelled: false,
    }
}

#[test]
fn windows_accumulate_counts_and_tokens() {
    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    for _ in 0..5 {
        aggregator.record_request(observation("a", "m", 100.0, true));
    }
    let snapshot = aggregator.metrics_for("a", "m");
    assert_eq!(snapshot.window_1m.count, 5);
    assert_eq!(snapshot.window_1h.count, 5);
    assert_eq!(snapshot.window_1m.tokens_generated, 50);
    assert_eq!(snapshot.window_1m.tokens_prompt, 20);
    assert!((snapshot.window_1m.min - 100.0).abs() < f64::EPSILON);
    assert!((snapshot.window_1m.max - 100.0).abs() < f64::EPSILON);
    assert!((snapshot.success_rate - 1.0).abs() < 1e-9);
}

#[test]
fn error_rate_reflected_in_window_success_rate() {
    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    for i in 0..10 {
        aggregator.record_request(observation("a", "m", 100.0, i % 2 == 0));
    }
    let snapshot = aggregator.metrics_for("a", "m");
    assert_eq!(snapshot.window_1m.errors, 5);
    // Decay weights are near-identical for fresh samples.
    assert!((snapshot.window_1m.success_rate - 0.5).abs() < 0.05);
}

#[test]
fn fresh_samples_are_not_decayed() {
    let settings = MetricsSettings::default();
    assert!(settings.decay.enabled);
    let aggregator = MetricsAggregator::new(settings);
    aggregator.record_request(observation("a", "m", 200.0, true));
    let snapshot = aggregator.metrics_for("a", "m");
    // A just-recorded sample carries full weight.
    assert!((snapshot.window_1m.avg_latency - 200.0).abs() < 1.0);
}

#[test]
fn ttft_percentiles_track_streaming_observations() {
    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    for i in 1..=50 {
        let mut obs = observation("a", "m", 1000.0, true);
        obs.ttft_ms = Some(i as f64 * 10.0);
        obs.streaming_duration_ms = Some(1000.0);
        aggregator.record_request(obs);
    }
    let snapshot = aggregator.metrics_for("a", "m");
    let avg = snapshot.avg_ttft_ms.unwrap();
    let p95 = snapshot.p95_ttft_ms.unwrap();
    assert!(avg > 200.0 && avg < 300.0);
    assert!(p95 >= 450.0);
    assert!(snapshot.avg_streaming_duration_ms.is_some());
}

#[test]
fn global_metrics_roll_up_across_keys() {
    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    aggregator.record_request(observation("a", "m1", 10.0, true));
    aggregator.record_request(observation("a", "m2", 10.0, false));
    aggregator.record_request(observation("b", "m1", 10.0, true));

    let global = aggregator.global_metrics();
    assert_eq!(global.total_requests, 3);
    assert_eq!(global.total_errors, 1);
    assert_eq!(global.tracked_keys, 3);
    assert!(global.requests_per_second > 0.0);
}

#[test]
fn in_flight_is_scoped_per_server_and_key() {
    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    aggregator.increment_in_flight("a", "m1", false);
    aggregator.increment_in_flight("a", "m2", false);
    aggregator.increment_in_flight("b", "m1", false);
    aggregator.increment_in_flight("a", "m1", true); // bypass

    assert_eq!(aggregator.in_flight("a", "m1"), 1);
    assert_eq!(aggregator.in_flight_for_server("a"), 2);
    assert_eq!(aggregator.total_in_flight(), 3);
    assert_eq!(aggregator.global_metrics().in_flight_bypass, 1);

    aggregator.decrement_in_flight("a", "m1", false);
    aggregator.decrement_in_flight("a", "m2", false);
    aggregator.decrement_in_flight("b", "m1", false);
    aggregator.decrement_in_flight("a", "m1", true);
    assert_eq!(aggregator.total_in_flight(), 0);
}

#[test]
fn remove_server_drops_all_its_keys() {
    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    aggregator.record_request(observation("a", "m1", 10.0, true));
    aggregator.record_request(observation("ab", "m1", 10.0, true));
    aggregator.remove_server("a");
    assert!(!aggregator.metrics_for("a", "m1").has_data());
    assert!(aggregator.metrics_for("ab", "m1").has_data());
}

#[test]
fn cancelled_observations_do_not_skew_latency() {
    let aggregator = MetricsAggregator::new(MetricsSettings::default());
    aggregator.record_request(observation("a", "m", 100.0, true));
    let mut cancelled = observation("a", "m", 99_999.0, false);
    cancelled.cancelled = true;
    aggregator.record_request(cancelled);

    let snapshot = aggregator.metrics_for("a", "m");
    assert_eq!(snapshot.total_count, 1);
    assert_eq!(snapshot.total_errors, 0);
}
