//! Rolling per-(server,model) metrics feeding the load balancer and the
//! observability surfaces.
//!
//! The aggregator consumes completed-request observations and exposes
//! decayed window aggregates (1m/5m/15m/1h), percentiles over a bounded
//! reservoir, streaming statistics (TTFT, stream duration), in-flight
//! counters split between regular traffic and recovery-probe bypass, and a
//! global rollup. State is partitioned per key so recording under one model
//! never contends with another.

use crate::models::error::ErrorCategory;
use crate::models::settings::MetricsSettings;
use crate::utils::model::model_key;
use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Bounded percentile reservoir size per key.
const RESERVOIR_CAPACITY: usize = 1000;

/// Raw samples persisted per key on snapshot, newest last.
const SNAPSHOT_SAMPLE_LIMIT: usize = 200;

/// One completed-request observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestObservation {
    pub server_id: String,
    pub model: String,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(default)]
    pub tokens_generated: Option<u64>,
    #[serde(default)]
    pub tokens_prompt: Option<u64>,
    #[serde(default)]
    pub ttft_ms: Option<f64>,
    #[serde(default)]
    pub streaming_duration_ms: Option<f64>,
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    /// Client cancellations are recorded but never counted as failures
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sample {
    at: DateTime<Utc>,
    duration_ms: f64,
    success: bool,
    tokens_generated: u64,
    tokens_prompt: u64,
}

/// Aggregate over one rolling window, decay-weighted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub count: u64,
    pub latency_sum: f64,
    pub latency_squared_sum: f64,
    pub min: f64,
    pub max: f64,
    pub errors: u64,
    pub tokens_generated: u64,
    pub tokens_prompt: u64,
    /// Decay-weighted average latency in milliseconds
    pub avg_latency: f64,
    /// Decay-weighted success rate in 0..=1
    pub success_rate: f64,
}

/// Snapshot of one key's aggregates, consumed by the balancer and exported
/// on the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetricsSnapshot {
    pub server_id: String,
    pub model: String,
    pub window_1m: WindowStats,
    pub window_5m: WindowStats,
    pub window_15m: WindowStats,
    pub window_1h: WindowStats,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg_ttft_ms: Option<f64>,
    pub p95_ttft_ms: Option<f64>,
    pub avg_streaming_duration_ms: Option<f64>,
    pub total_count: u64,
    pub total_errors: u64,
    /// Overall decay-weighted success rate across the retention horizon
    pub success_rate: f64,
    /// Whether the key has seen no traffic past the stale threshold
    pub stale: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl KeyMetricsSnapshot {
    fn empty(server_id: &str, model: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            model: model.to_string(),
            window_1m: WindowStats::default(),
            window_5m: WindowStats::default(),
            window_15m: WindowStats::default(),
            window_1h: WindowStats::default(),
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
            avg_ttft_ms: None,
            p95_ttft_ms: None,
            avg_streaming_duration_ms: None,
            total_count: 0,
            total_errors: 0,
            success_rate: 1.0,
            stale: false,
            last_updated: None,
        }
    }

    /// Whether this key has any observation at all.
    pub fn has_data(&self) -> bool {
        self.total_count > 0
    }
}

/// Global rollup across all keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    /// Requests-per-second estimate over the last minute
    pub requests_per_second: f64,
    pub tracked_keys: usize,
    pub in_flight_regular: u64,
    pub in_flight_bypass: u64,
    /// Observations dropped because they failed sanity checks
    pub dropped_observations: u64,
}

/// Serializable snapshot of the whole aggregator for best-effort persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsExport {
    pub keys: Vec<KeyExport>,
    pub total_requests: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExport {
    pub key: String,
    pub total_count: u64,
    pub total_errors: u64,
    pub reservoir: Vec<f64>,
    samples: Vec<Sample>,
    ttft_samples: Vec<(DateTime<Utc>, f64)>,
    stream_duration_samples: Vec<(DateTime<Utc>, f64)>,
    pub last_updated: Option<DateTime<Utc>>,
}

struct KeyMetrics {
    samples: VecDeque<Sample>,
    reservoir: Vec<f64>,
    reservoir_cursor: usize,
    ttft_samples: VecDeque<(DateTime<Utc>, f64)>,
    stream_duration_samples: VecDeque<(DateTime<Utc>, f64)>,
    total_count: u64,
    total_errors: u64,
    last_updated: Option<DateTime<Utc>>,
}

impl KeyMetrics {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            reservoir: Vec::with_capacity(64),
            reservoir_cursor: 0,
            ttft_samples: VecDeque::new(),
            stream_duration_samples: VecDeque::new(),
            total_count: 0,
            total_errors: 0,
            last_updated: None,
        }
    }

    fn prune(&mut self, horizon: Duration, now: DateTime<Utc>) {
        let cutoff = now - horizon;
        while self.samples.front().map(|s| s.at < cutoff) == Some(true) {
            self.samples.pop_front();
        }
        while self.ttft_samples.front().map(|(at, _)| *at < cutoff) == Some(true) {
            self.ttft_samples.pop_front();
        }
        while self
            .stream_duration_samples
            .front()
            .map(|(at, _)| *at < cutoff)
            == Some(true)
        {
            self.stream_duration_samples.pop_front();
        }
    }

    fn push_reservoir(&mut self, value: f64) {
        if self.reservoir.len() < RESERVOIR_CAPACITY {
            self.reservoir.push(value);
        } else {
            self.reservoir[self.reservoir_cursor] = value;
            self.reservoir_cursor = (self.reservoir_cursor + 1) % RESERVOIR_CAPACITY;
        }
    }
}

/// Staleness decay factor: `max(min_factor, 2^(-age/half_life))`.
fn decay_factor(age_ms: f64, settings: &MetricsSettings) -> f64 {
    if !settings.decay.enabled || settings.decay.half_life_ms == 0 {
        return 1.0;
    }
    let factor = (2.0_f64).powf(-age_ms / settings.decay.half_life_ms as f64);
    factor.max(settings.decay.min_decay_factor)
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Thread-safe metrics aggregator.
///
/// # Concurrency
///
/// The key map takes a read lock on the hot path; each key's state sits
/// behind its own mutex, so two keys never contend. In-flight counters and
/// global totals are plain atomics.
pub struct MetricsAggregator {
    settings: MetricsSettings,
    keys: RwLock<AHashMap<String, Arc<Mutex<KeyMetrics>>>>,
    in_flight_regular: Mutex<AHashMap<String, u64>>,
    in_flight_bypass: Mutex<AHashMap<String, u64>>,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    dropped_observations: AtomicU64,
}

impl MetricsAggregator {
    pub fn new(settings: MetricsSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            keys: RwLock::new(AHashMap::new()),
            in_flight_regular: Mutex::new(AHashMap::new()),
            in_flight_bypass: Mutex::new(AHashMap::new()),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            dropped_observations: AtomicU64::new(0),
        })
    }

    fn retention(&self) -> Duration {
        Duration::minutes(self.settings.history_window_minutes.max(60) as i64)
    }

    fn key_state(&self, key: &str) -> Arc<Mutex<KeyMetrics>> {
        if let Some(state) = self.keys.read().unwrap().get(key) {
            return Arc::clone(state);
        }
        let mut keys = self.keys.write().unwrap();
        Arc::clone(
            keys.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(KeyMetrics::new()))),
        )
    }

    /// Records one completed request. Never fails: observations that fail
    /// sanity checks are dropped with a counter bump.
    pub fn record_request(&self, obs: RequestObservation) {
        if !self.settings.enabled {
            return;
        }
        if obs.server_id.is_empty()
            || obs.model.is_empty()
            || !obs.duration_ms.is_finite()
            || obs.duration_ms < 0.0
        {
            self.dropped_observations.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if obs.cancelled {
            // Cancellations keep latency history out of the aggregates;
            // they are visible in request history only.
            return;
        }

        let now = Utc::now();
        let key = model_key(&obs.server_id, &obs.model);
        let state = self.key_state(&key);
        let mut state = state.lock().unwrap();

        state.samples.push_back(Sample {
            at: now,
            duration_ms: obs.duration_ms,
            success: obs.success,
            tokens_generated: obs.tokens_generated.unwrap_or(0),
            tokens_prompt: obs.tokens_prompt.unwrap_or(0),
        });
        state.push_reservoir(obs.duration_ms);
        if let Some(ttft) = obs.ttft_ms {
            if ttft.is_finite() && ttft >= 0.0 {
                state.ttft_samples.push_back((now, ttft));
            }
        }
        if let Some(duration) = obs.streaming_duration_ms {
            if duration.is_finite() && duration >= 0.0 {
                state.stream_duration_samples.push_back((now, duration));
            }
        }
        state.total_count += 1;
        if !obs.success {
            state.total_errors += 1;
        }
        state.last_updated = Some(now);
        let retention = self.retention();
        state.prune(retention, now);
        drop(state);

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !obs.success {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn window_stats(
        &self,
        samples: &VecDeque<Sample>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> WindowStats {
        let cutoff = now - window;
        let mut stats = WindowStats {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..WindowStats::default()
        };
        let mut weighted_latency = 0.0;
        let mut weighted_success = 0.0;
        let mut weight_sum = 0.0;
        for sample in samples.iter().rev() {
            if sample.at < cutoff {
                break;
            }
            let age_ms = (now - sample.at).num_milliseconds().max(0) as f64;
            let weight = decay_factor(age_ms, &self.settings);
            stats.count += 1;
            stats.latency_sum += sample.duration_ms;
            stats.latency_squared_sum += sample.duration_ms * sample.duration_ms;
            stats.min = stats.min.min(sample.duration_ms);
            stats.max = stats.max.max(sample.duration_ms);
            stats.tokens_generated += sample.tokens_generated;
            stats.tokens_prompt += sample.tokens_prompt;
            if !sample.success {
                stats.errors += 1;
            }
            weighted_latency += sample.duration_ms * weight;
            weighted_success += if sample.success { weight } else { 0.0 };
            weight_sum += weight;
        }
        if stats.count == 0 {
            stats.min = 0.0;
            stats.max = 0.0;
            stats.success_rate = 1.0;
        } else {
            stats.avg_latency = weighted_latency / weight_sum;
            stats.success_rate = weighted_success / weight_sum;
        }
        stats
    }

    /// Returns the aggregate for a key; empty when nothing was observed.
    pub fn metrics_for(&self, server_id: &str, model: &str) -> KeyMetricsSnapshot {
        let key = model_key(server_id, model);
        let state = match self.keys.read().unwrap().get(&key) {
            Some(state) => Arc::clone(state),
            None => return KeyMetricsSnapshot::empty(server_id, model),
        };
        let mut state = state.lock().unwrap();
        let now = Utc::now();
        let retention = self.retention();
        state.prune(retention, now);

        let mut sorted = state.reservoir.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let ttft: Vec<f64> = state.ttft_samples.iter().map(|(_, v)| *v).collect();
        let mut ttft_sorted = ttft.clone();
        ttft_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let stream_durations: Vec<f64> = state
            .stream_duration_samples
            .iter()
            .map(|(_, v)| *v)
            .collect();

        let window_1h = self.window_stats(&state.samples, Duration::hours(1), now);
        let stale = state
            .last_updated
            .map(|at| {
                (now - at).num_milliseconds().max(0) as u64 > self.settings.decay.stale_threshold_ms
            })
            .unwrap_or(false);

        KeyMetricsSnapshot {
            server_id: server_id.to_string(),
            model: model.to_string(),
            window_1m: self.window_stats(&state.samples, Duration::minutes(1), now),
            window_5m: self.window_stats(&state.samples, Duration::minutes(5), now),
            window_15m: self.window_stats(&state.samples, Duration::minutes(15), now),
            success_rate: window_1h.success_rate,
            window_1h,
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            avg_ttft_ms: if ttft.is_empty() {
                None
            } else {
                Some(ttft.iter().sum::<f64>() / ttft.len() as f64)
            },
            p95_ttft_ms: if ttft_sorted.is_empty() {
                None
            } else {
                Some(percentile(&ttft_sorted, 0.95))
            },
            avg_streaming_duration_ms: if stream_durations.is_empty() {
                None
            } else {
                Some(stream_durations.iter().sum::<f64>() / stream_durations.len() as f64)
            },
            total_count: state.total_count,
            total_errors: state.total_errors,
            stale,
            last_updated: state.last_updated,
        }
    }

    /// All keys currently tracked, as `(server_id, model)` pairs.
    pub fn tracked_keys(&self) -> Vec<(String, String)> {
        self.keys
            .read()
            .unwrap()
            .keys()
            .filter_map(|k| {
                crate::utils::model::split_model_key(k)
                    .map(|(s, m)| (s.to_string(), m.to_string()))
            })
            .collect()
    }

    /// Increments the in-flight counter for a key. `bypass` selects the
    /// recovery-probe counter that does not count against capacity.
    pub fn increment_in_flight(&self, server_id: &str, model: &str, bypass: bool) {
        let key = model_key(server_id, model);
        let map = if bypass {
            &self.in_flight_bypass
        } else {
            &self.in_flight_regular
        };
        *map.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    /// Decrements the in-flight counter for a key; never goes negative.
    pub fn decrement_in_flight(&self, server_id: &str, model: &str, bypass: bool) {
        let key = model_key(server_id, model);
        let map = if bypass {
            &self.in_flight_bypass
        } else {
            &self.in_flight_regular
        };
        let mut map = map.lock().unwrap();
        match map.get_mut(&key) {
            Some(count) if *count > 0 => *count -= 1,
            _ => log::debug!("in-flight decrement without increment for {}", key),
        }
    }

    /// Current regular in-flight count for a key.
    pub fn in_flight(&self, server_id: &str, model: &str) -> u64 {
        let key = model_key(server_id, model);
        *self.in_flight_regular.lock().unwrap().get(&key).unwrap_or(&0)
    }

    /// Total regular in-flight requests across all models on a server.
    pub fn in_flight_for_server(&self, server_id: &str) -> u64 {
        let prefix = format!("{}:", server_id);
        self.in_flight_regular
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| *v)
            .sum()
    }

    /// Total regular in-flight requests across the fleet.
    pub fn total_in_flight(&self) -> u64 {
        self.in_flight_regular.lock().unwrap().values().sum()
    }

    /// RAII guard pairing an in-flight increment with its decrement on every
    /// exit path, panics and cancellation included.
    pub fn begin_request(
        self: &Arc<Self>,
        server_id: &str,
        model: &str,
        bypass: bool,
    ) -> InFlightGuard {
        self.increment_in_flight(server_id, model, bypass);
        InFlightGuard {
            aggregator: Arc::clone(self),
            server_id: server_id.to_string(),
            model: model.to_string(),
            bypass,
        }
    }

    /// Totals across all keys plus a requests-per-second estimate over the
    /// 1m window.
    pub fn global_metrics(&self) -> GlobalMetrics {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        let now = Utc::now();
        let mut recent: u64 = 0;
        let keys: Vec<Arc<Mutex<KeyMetrics>>> =
            self.keys.read().unwrap().values().cloned().collect();
        let tracked = keys.len();
        for state in keys {
            let state = state.lock().unwrap();
            let cutoff = now - Duration::minutes(1);
            recent += state.samples.iter().rev().take_while(|s| s.at >= cutoff).count() as u64;
        }
        GlobalMetrics {
            total_requests,
            total_errors,
            error_rate: if total_requests > 0 {
                total_errors as f64 / total_requests as f64
            } else {
                0.0
            },
            requests_per_second: recent as f64 / 60.0,
            tracked_keys: tracked,
            in_flight_regular: self.total_in_flight(),
            in_flight_bypass: self.in_flight_bypass.lock().unwrap().values().sum(),
            dropped_observations: self.dropped_observations.load(Ordering::Relaxed),
        }
    }

    /// Structured snapshot suitable for serialization.
    pub fn export(&self) -> MetricsExport {
        let keys: Vec<(String, Arc<Mutex<KeyMetrics>>)> = self
            .keys
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut exported = Vec::with_capacity(keys.len());
        for (key, state) in keys {
            let state = state.lock().unwrap();
            let skip = state.samples.len().saturating_sub(SNAPSHOT_SAMPLE_LIMIT);
            exported.push(KeyExport {
                key,
                total_count: state.total_count,
                total_errors: state.total_errors,
                reservoir: state.reservoir.clone(),
                samples: state.samples.iter().skip(skip).cloned().collect(),
                ttft_samples: state.ttft_samples.iter().cloned().collect(),
                stream_duration_samples: state.stream_duration_samples.iter().cloned().collect(),
                last_updated: state.last_updated,
            });
        }
        MetricsExport {
            keys: exported,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }

    /// Restores a previously exported snapshot. Best-effort: keys that fail
    /// to parse are skipped.
    pub fn restore(&self, export: MetricsExport) {
        let mut keys = self.keys.write().unwrap();
        for key_export in export.keys {
            let mut state = KeyMetrics::new();
            state.total_count = key_export.total_count;
            state.total_errors = key_export.total_errors;
            state.reservoir = key_export.reservoir;
            state.reservoir_cursor = 0;
            state.samples = key_export.samples.into();
            state.ttft_samples = key_export.ttft_samples.into();
            state.stream_duration_samples = key_export.stream_duration_samples.into();
            state.last_updated = key_export.last_updated;
            keys.insert(key_export.key, Arc::new(Mutex::new(state)));
        }
        self.total_requests
            .store(export.total_requests, Ordering::Relaxed);
        self.total_errors
            .store(export.total_errors, Ordering::Relaxed);
    }

    /// Removes all metric and in-flight state for a server's keys. Used when
    /// a server leaves the fleet.
    pub fn remove_server(&self, server_id: &str) {
        let prefix = format!("{}:", server_id);
        self.keys
            .write()
            .unwrap()
            .retain(|k, _| !k.starts_with(&prefix));
        self.in_flight_regular
            .lock()
            .unwrap()
            .retain(|k, _| !k.starts_with(&prefix));
        self.in_flight_bypass
            .lock()
            .unwrap()
            .retain(|k, _| !k.starts_with(&prefix));
    }
}

/// Guard returned by [`MetricsAggregator::begin_request`].
pub struct InFlightGuard {
    aggregator: Arc<MetricsAggregator>,
    server_id: String,
    model: String,
    bypass: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.aggregator
            .decrement_in_flight(&self.server_id, &self.model, self.bypass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(server: &str, model: &str, duration: f64, success: bool) -> RequestObservation {
        RequestObservation {
            server_id: server.to_string(),
            model: model.to_string(),
            duration_ms: duration,
            success,
            tokens_generated: None,
            tokens_prompt: None,
            ttft_ms: None,
            streaming_duration_ms: None,
            error_category: None,
            cancelled: false,
        }
    }

    #[test]
    fn empty_key_reports_empty_snapshot() {
        let aggregator = MetricsAggregator::new(MetricsSettings::default());
        let snapshot = aggregator.metrics_for("a", "m");
        assert!(!snapshot.has_data());
        assert_eq!(snapshot.success_rate, 1.0);
    }

    #[test]
    fn bad_observations_are_dropped_with_a_counter() {
        let aggregator = MetricsAggregator::new(MetricsSettings::default());
        aggregator.record_request(observation("a", "m", f64::NAN, true));
        aggregator.record_request(observation("", "m", 10.0, true));
        assert_eq!(aggregator.global_metrics().dropped_observations, 2);
        assert_eq!(aggregator.global_metrics().total_requests, 0);
    }

    #[test]
    fn in_flight_never_goes_negative() {
        let aggregator = MetricsAggregator::new(MetricsSettings::default());
        aggregator.decrement_in_flight("a", "m", false);
        assert_eq!(aggregator.in_flight("a", "m"), 0);
        {
            let _guard = aggregator.begin_request("a", "m", false);
            assert_eq!(aggregator.in_flight("a", "m"), 1);
        }
        assert_eq!(aggregator.in_flight("a", "m"), 0);
    }

    #[test]
    fn percentiles_are_rank_ordered() {
        let aggregator = MetricsAggregator::new(MetricsSettings::default());
        for i in 1..=100 {
            aggregator.record_request(observation("a", "m", i as f64, true));
        }
        let snapshot = aggregator.metrics_for("a", "m");
        assert!(snapshot.p50 < snapshot.p95);
        assert!(snapshot.p95 <= snapshot.p99);
    }

    #[test]
    fn export_restore_preserves_counters() {
        let aggregator = MetricsAggregator::new(MetricsSettings::default());
        for i in 0..10 {
            aggregator.record_request(observation("a", "m", 50.0, i % 2 == 0));
        }
        let export = aggregator.export();

        let restored = MetricsAggregator::new(MetricsSettings::default());
        restored.restore(export);
        let snapshot = restored.metrics_for("a", "m");
        assert_eq!(snapshot.total_count, 10);
        assert_eq!(snapshot.total_errors, 5);
        assert_eq!(restored.global_metrics().total_requests, 10);
    }
}
