//! Load balancing: ranking candidate backends for a request.
//!
//! The default algorithm is a weighted composite score over latency, success
//! rate, per-model load and whole-server capacity, with TTFT-aware blending
//! for streaming requests and a breaker-health multiplier. Round-robin and
//! least-connections variants share the same interface and the same
//! exclusion rules (the orchestrator filters candidates before ranking).

use crate::models::settings::{BalancerAlgorithm, LoadBalancerSettings};
use crate::models::server::ServerRecord;
use crate::services::circuit_breaker::CircuitState;
use crate::services::history::CandidateScore;
use crate::services::metrics::KeyMetricsSnapshot;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A filtered candidate ready for ranking.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub server: ServerRecord,
    /// Model name as this server knows it (after `:latest` resolution)
    pub resolved_model: String,
    pub metrics: KeyMetricsSnapshot,
    /// Regular in-flight requests for this (server,model) key
    pub in_flight: u64,
    /// Regular in-flight requests across the whole server
    pub server_in_flight: u64,
    /// Effective breaker state (the worse of server and model breaker)
    pub breaker_state: CircuitState,
}

/// A candidate with its computed score vector, ranked best-first.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub score: CandidateScore,
}

/// Load balancer trait producing a ranked candidate list.
///
/// Implementations must be deterministic given the same inputs apart from
/// their own rotation state, and must never resurrect candidates the filter
/// excluded.
pub trait LoadBalancer: Send + Sync {
    /// Algorithm name recorded in decision log entries.
    fn name(&self) -> &'static str;

    /// Ranks candidates best-first. `streaming` selects TTFT-aware scoring
    /// where the algorithm supports it.
    fn rank(&self, candidates: Vec<Candidate>, streaming: bool) -> Vec<RankedCandidate>;
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Weighted composite score balancer (the default).
pub struct CompositeScoreBalancer {
    settings: LoadBalancerSettings,
}

impl CompositeScoreBalancer {
    pub fn new(settings: LoadBalancerSettings) -> Self {
        Self { settings }
    }

    /// Blended latency estimate in milliseconds. Falls back to the
    /// configured default for keys with no observations so new backends are
    /// neither favored nor buried.
    fn blended_latency(&self, metrics: &KeyMetricsSnapshot, streaming: bool) -> f64 {
        let s = &self.settings;
        let recent = if metrics.window_1m.count > 0 {
            metrics.window_1m.avg_latency
        } else if metrics.window_15m.count > 0 {
            metrics.window_15m.avg_latency
        } else {
            s.default_latency_ms
        };
        let historical = if metrics.p95 > 0.0 { metrics.p95 } else { s.default_latency_ms };
        let generic = s.latency_blend_recent * recent + s.latency_blend_historical * historical;

        if streaming {
            if let (Some(avg_ttft), Some(p95_ttft)) = (metrics.avg_ttft_ms, metrics.p95_ttft_ms) {
                let ttft =
                    s.streaming.ttft_blend_avg * avg_ttft + s.streaming.ttft_blend_p95 * p95_ttft;
                let weight_sum = s.streaming.ttft_weight + s.streaming.duration_weight;
                if weight_sum > 0.0 {
                    return (s.streaming.ttft_weight * ttft
                        + s.streaming.duration_weight * generic)
                        / weight_sum;
                }
            }
        }
        generic
    }

    fn score_candidate(&self, candidate: &Candidate, streaming: bool) -> CandidateScore {
        let s = &self.settings;
        let metrics = &candidate.metrics;

        let blended = self.blended_latency(metrics, streaming);
        let latency_score = 1.0 - clamp01(blended / s.thresholds.max_p95_latency.max(1.0));

        let success_rate = if metrics.has_data() { metrics.success_rate } else { 1.0 };
        let success_score = if s.thresholds.min_success_rate >= 1.0 {
            if success_rate >= 1.0 { 1.0 } else { 0.0 }
        } else {
            clamp01(
                (success_rate - s.thresholds.min_success_rate)
                    / (1.0 - s.thresholds.min_success_rate),
            )
        };

        let max_concurrency = candidate.server.max_concurrency.max(1) as f64;
        let load_score = 1.0
            - clamp01(candidate.in_flight as f64 * s.load_factor_multiplier / max_concurrency);
        let capacity_score =
            1.0 - clamp01(candidate.server_in_flight as f64 / max_concurrency);

        let weight_sum = s.weights.latency + s.weights.success_rate + s.weights.load + s.weights.capacity;
        let mut score = if weight_sum > 0.0 {
            (s.weights.latency * latency_score
                + s.weights.success_rate * success_score
                + s.weights.load * load_score
                + s.weights.capacity * capacity_score)
                / weight_sum
        } else {
            0.0
        };

        let breaker_multiplier = match candidate.breaker_state {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.0,
        };
        score *= breaker_multiplier;

        if blended > s.thresholds.max_p95_latency {
            score *= s.thresholds.latency_penalty;
        }
        if metrics.has_data() && success_rate < s.thresholds.min_success_rate {
            score *= s.thresholds.error_penalty;
        }

        CandidateScore {
            server_id: candidate.server.id.clone(),
            score,
            latency_score,
            success_score,
            load_score,
            capacity_score,
            breaker_multiplier,
        }
    }
}

impl LoadBalancer for CompositeScoreBalancer {
    fn name(&self) -> &'static str {
        "composite_score"
    }

    fn rank(&self, candidates: Vec<Candidate>, streaming: bool) -> Vec<RankedCandidate> {
        let mut ranked: Vec<RankedCandidate> = candidates
            .into_iter()
            .map(|candidate| {
                let score = self.score_candidate(&candidate, streaming);
                RankedCandidate { candidate, score }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .score
                .partial_cmp(&a.score.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    // Tie-break: more free capacity first.
                    let free = |r: &RankedCandidate| {
                        r.candidate.server.max_concurrency as i64
                            - r.candidate.server_in_flight as i64
                    };
                    free(b).cmp(&free(a))
                })
                .then_with(|| {
                    let latency = |r: &RankedCandidate| {
                        self.blended_latency(&r.candidate.metrics, streaming)
                    };
                    latency(a)
                        .partial_cmp(&latency(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.candidate.server.id.cmp(&b.candidate.server.id))
        });
        ranked
    }
}

/// Round-robin variant: rotates through candidates in id order.
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self { counter: AtomicUsize::new(0) }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn rank(&self, mut candidates: Vec<Candidate>, _streaming: bool) -> Vec<RankedCandidate> {
        if candidates.is_empty() {
            return Vec::new();
        }
        candidates.sort_by(|a, b| a.server.id.cmp(&b.server.id));
        let len = candidates.len();
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % len;
        candidates.rotate_left(start);
        candidates
            .into_iter()
            .enumerate()
            .map(|(position, candidate)| {
                let score = CandidateScore {
                    server_id: candidate.server.id.clone(),
                    score: 1.0 - position as f64 / len as f64,
                    latency_score: 0.0,
                    success_score: 0.0,
                    load_score: 0.0,
                    capacity_score: 0.0,
                    breaker_multiplier: 1.0,
                };
                RankedCandidate { candidate, score }
            })
            .collect()
    }
}

/// Least-connections variant: fewest in-flight requests first.
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastConnectionsBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn rank(&self, mut candidates: Vec<Candidate>, _streaming: bool) -> Vec<RankedCandidate> {
        candidates.sort_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then_with(|| a.server_in_flight.cmp(&b.server_in_flight))
                .then_with(|| a.server.id.cmp(&b.server.id))
        });
        let len = candidates.len().max(1);
        candidates
            .into_iter()
            .enumerate()
            .map(|(position, candidate)| {
                let score = CandidateScore {
                    server_id: candidate.server.id.clone(),
                    score: 1.0 - position as f64 / len as f64,
                    latency_score: 0.0,
                    success_score: 0.0,
                    load_score: 1.0 - clamp01(candidate.in_flight as f64 / candidate.server.max_concurrency.max(1) as f64),
                    capacity_score: 0.0,
                    breaker_multiplier: 1.0,
                };
                RankedCandidate { candidate, score }
            })
            .collect()
    }
}

/// Creates the balancer selected by configuration.
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create(settings: &LoadBalancerSettings) -> Arc<dyn LoadBalancer> {
        match settings.algorithm {
            BalancerAlgorithm::CompositeScore => {
                Arc::new(CompositeScoreBalancer::new(settings.clone()))
            }
            BalancerAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new()),
            BalancerAlgorithm::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
        }
    }
}
