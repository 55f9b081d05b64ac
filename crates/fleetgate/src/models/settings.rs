//! Typed configuration for the fleetgate orchestrator.
//!
//! The whole configuration surface is a statically typed tree: every
//! recognized key is a struct field, every section rejects unknown keys at
//! load time, and every knob has a default so a minimal config file (or an
//! empty one) yields a runnable orchestrator.
//!
//! # Configuration File Format
//!
//! ```json
//! {
//!   "port": 11440,
//!   "servers": [
//!     { "url": "http://backend-1:11434", "maxConcurrency": 4 },
//!     { "url": "http://backend-2:11434" }
//!   ],
//!   "queue": { "maxSize": 200, "timeout": 30000 },
//!   "circuitBreaker": { "baseFailureThreshold": 5 }
//! }
//! ```

use crate::models::server::ServerSpec;
use serde::{Deserialize, Serialize};

/// Root application settings for the orchestrator.
///
/// Loaded from JSON (see [`crate::config::settings::load_settings`]) and
/// validated by [`crate::config::validation::ConfigValidator`] before the
/// server starts. Unknown keys anywhere in the tree are rejected at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Settings {
    /// Port the HTTP front door binds to
    pub port: u16,
    /// Address the HTTP front door binds to
    pub host: String,
    /// Default log filter (`error`, `warn`, `info`, `debug`, `trace`);
    /// `RUST_LOG` overrides it
    pub log_level: String,
    /// Buffer requests when no candidate has free capacity
    pub enable_queue: bool,
    /// Consult circuit breakers during candidate filtering
    pub enable_circuit_breaker: bool,
    /// Record per-(server,model) metrics
    pub enable_metrics: bool,
    /// Allow streaming pass-through responses
    pub enable_streaming: bool,
    /// Persist state snapshots and recover them at startup
    pub enable_persistence: bool,
    /// Directory for persisted state files
    pub persistence_path: String,
    /// How often to re-read the config file; 0 disables reloading
    pub config_reload_interval_ms: u64,
    /// Initial fleet; servers can also be added at runtime via the admin API
    pub servers: Vec<ServerSpec>,
    pub queue: QueueSettings,
    pub load_balancer: LoadBalancerSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub security: SecuritySettings,
    pub metrics: MetricsSettings,
    pub streaming: StreamingSettings,
    pub health_check: HealthCheckSettings,
    pub retry: RetrySettings,
    pub cooldown: CooldownSettings,
    pub model_manager: ModelManagerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 11440,
            host: "0.0.0.0".to_string(),
            log_level: "info".to_string(),
            enable_queue: true,
            enable_circuit_breaker: true,
            enable_metrics: true,
            enable_streaming: true,
            enable_persistence: true,
            persistence_path: "./data".to_string(),
            config_reload_interval_ms: 0,
            servers: Vec::new(),
            queue: QueueSettings::default(),
            load_balancer: LoadBalancerSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            security: SecuritySettings::default(),
            metrics: MetricsSettings::default(),
            streaming: StreamingSettings::default(),
            health_check: HealthCheckSettings::default(),
            retry: RetrySettings::default(),
            cooldown: CooldownSettings::default(),
            model_manager: ModelManagerSettings::default(),
        }
    }
}

/// Bounded priority queue behavior (see `services::queue`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct QueueSettings {
    /// Maximum queued requests before enqueues fail with queue-full
    pub max_size: usize,
    /// Milliseconds an item may wait before failing with queue-timeout
    pub timeout: u64,
    /// How often waiting items get a priority boost, in milliseconds
    pub priority_boost_interval: u64,
    /// Priority added per boost
    pub priority_boost_amount: i32,
    /// Ceiling for boosted priorities
    pub max_priority: i32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            timeout: 30_000,
            priority_boost_interval: 5_000,
            priority_boost_amount: 1,
            max_priority: 10,
        }
    }
}

/// Which ranking algorithm the balancer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BalancerAlgorithm {
    /// Weighted composite score over latency, success rate, load and capacity
    #[default]
    CompositeScore,
    RoundRobin,
    LeastConnections,
}

/// Relative weights of the composite score components. Normalized at use, so
/// they need not sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BalancerWeights {
    pub latency: f64,
    pub success_rate: f64,
    pub load: f64,
    pub capacity: f64,
}

impl Default for BalancerWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            success_rate: 0.3,
            load: 0.2,
            capacity: 0.1,
        }
    }
}

/// Score thresholds and penalty multipliers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BalancerThresholds {
    /// Latency at which the latency score reaches zero, in milliseconds
    pub max_p95_latency: f64,
    /// Success rate below which the success score reaches zero
    pub min_success_rate: f64,
    /// Multiplier applied when blended latency exceeds `max_p95_latency`
    pub latency_penalty: f64,
    /// Multiplier applied when the error rate breaches the breaker threshold
    pub error_penalty: f64,
}

impl Default for BalancerThresholds {
    fn default() -> Self {
        Self {
            max_p95_latency: 30_000.0,
            min_success_rate: 0.5,
            latency_penalty: 0.5,
            error_penalty: 0.3,
        }
    }
}

/// TTFT blending for streaming-aware scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BalancerStreamingSettings {
    /// Weight of the TTFT component versus generic latency
    pub ttft_weight: f64,
    /// Weight of the stream-duration component
    pub duration_weight: f64,
    /// Blend factor for average TTFT
    pub ttft_blend_avg: f64,
    /// Blend factor for p95 TTFT
    pub ttft_blend_p95: f64,
    /// Multiplier used when estimating stream duration from history
    pub duration_estimate_multiplier: f64,
}

impl Default for BalancerStreamingSettings {
    fn default() -> Self {
        Self {
            ttft_weight: 0.6,
            duration_weight: 0.4,
            ttft_blend_avg: 0.5,
            ttft_blend_p95: 0.5,
            duration_estimate_multiplier: 1.2,
        }
    }
}

/// Round-robin variant knobs. Present for config-shape compatibility; the
/// variant currently needs no tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RoundRobinSettings {}

/// Least-connections variant knobs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LeastConnectionsSettings {}

/// Load balancer configuration (see `services::load_balancer`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LoadBalancerSettings {
    pub algorithm: BalancerAlgorithm,
    pub weights: BalancerWeights,
    pub thresholds: BalancerThresholds,
    /// Blend factor for the recent-average latency component
    pub latency_blend_recent: f64,
    /// Blend factor for the historical p95 latency component
    pub latency_blend_historical: f64,
    /// Scales the load score's sensitivity to in-flight requests
    pub load_factor_multiplier: f64,
    /// Latency assumed for candidates with no observations yet, in ms
    pub default_latency_ms: f64,
    /// Concurrency assumed for servers that did not declare one
    pub default_max_concurrency: u32,
    pub streaming: BalancerStreamingSettings,
    pub round_robin: RoundRobinSettings,
    pub least_connections: LeastConnectionsSettings,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            algorithm: BalancerAlgorithm::default(),
            weights: BalancerWeights::default(),
            thresholds: BalancerThresholds::default(),
            latency_blend_recent: 0.6,
            latency_blend_historical: 0.4,
            load_factor_multiplier: 1.0,
            default_latency_ms: 1_000.0,
            default_max_concurrency: 4,
            streaming: BalancerStreamingSettings::default(),
            round_robin: RoundRobinSettings::default(),
            least_connections: LeastConnectionsSettings::default(),
        }
    }
}

/// Model-escalation: opening a server breaker when too many of its model
/// breakers are open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ModelEscalationSettings {
    pub enabled: bool,
    /// Fraction of a server's model breakers that must be open to escalate
    pub ratio_threshold: f64,
    /// Model breakers must have been open at least this long to count
    pub duration_threshold_ms: u64,
    /// How often the escalation sweep runs
    pub check_interval_ms: u64,
}

impl Default for ModelEscalationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ratio_threshold: 0.5,
            duration_threshold_ms: 120_000,
            check_interval_ms: 30_000,
        }
    }
}

/// Operator-supplied classification patterns appended to the built-in sets.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ErrorPatternSettings {
    pub non_retryable: Vec<String>,
    pub transient: Vec<String>,
}

/// Circuit breaker configuration (see `services::circuit_breaker`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CircuitBreakerSettings {
    /// Starting failure threshold before adaptation
    pub base_failure_threshold: u32,
    /// Upper clamp for the adaptive threshold
    pub max_failure_threshold: u32,
    /// Lower clamp for the adaptive threshold
    pub min_failure_threshold: u32,
    /// Milliseconds an open breaker waits before allowing a half-open probe
    pub open_timeout: u64,
    /// Milliseconds a half-open breaker may linger without resolution
    pub half_open_timeout: u64,
    /// Probes admitted per half-open episode
    pub half_open_max_requests: u32,
    /// Consecutive successes required to close from half-open
    pub recovery_success_threshold: u32,
    /// Rolling window for the smoothed error rate, in milliseconds
    pub error_rate_window: u64,
    /// Smoothed error rate that opens the breaker regardless of counts
    pub error_rate_threshold: f64,
    /// Exponential smoothing factor for the error rate (0..1)
    pub error_rate_smoothing: f64,
    /// Enable threshold adaptation from the recent error-category mix
    pub adaptive_thresholds: bool,
    /// Threshold delta applied per adaptation step
    pub adaptive_threshold_adjustment: u32,
    /// Non-retryable share of recent errors that lowers the threshold
    pub non_retryable_ratio_threshold: f64,
    /// Transient share of recent errors that raises the threshold
    pub transient_ratio_threshold: f64,
    pub model_escalation: ModelEscalationSettings,
    pub error_patterns: ErrorPatternSettings,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            base_failure_threshold: 5,
            max_failure_threshold: 10,
            min_failure_threshold: 2,
            open_timeout: 30_000,
            half_open_timeout: 60_000,
            half_open_max_requests: 3,
            recovery_success_threshold: 2,
            error_rate_window: 60_000,
            error_rate_threshold: 0.5,
            error_rate_smoothing: 0.2,
            adaptive_thresholds: true,
            adaptive_threshold_adjustment: 2,
            non_retryable_ratio_threshold: 0.7,
            transient_ratio_threshold: 0.7,
            model_escalation: ModelEscalationSettings::default(),
            error_patterns: ErrorPatternSettings::default(),
        }
    }
}

/// Inbound security: CORS, rate limiting and API keys.
///
/// Authentication is deliberately simple — shared-secret keys compared
/// against a configurable header. Empty key lists disable the check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SecuritySettings {
    pub cors_origins: Vec<String>,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max: u32,
    /// Header carrying the client API key
    pub api_key_header: String,
    /// Accepted keys for the inference surface; empty disables the check
    pub api_keys: Vec<String>,
    /// Accepted keys for the admin surface; empty disables the check
    pub admin_api_keys: Vec<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            cors_origins: vec!["*".to_string()],
            rate_limit_window_ms: 60_000,
            rate_limit_max: 600,
            api_key_header: "x-api-key".to_string(),
            api_keys: Vec::new(),
            admin_api_keys: Vec::new(),
        }
    }
}

/// Staleness decay applied to metric aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DecaySettings {
    pub enabled: bool,
    /// Age at which a sample's weight halves, in milliseconds
    pub half_life_ms: u64,
    /// Floor for the decay factor
    pub min_decay_factor: f64,
    /// Age past which a key is reported as stale
    pub stale_threshold_ms: u64,
}

impl Default for DecaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            half_life_ms: 300_000,
            min_decay_factor: 0.1,
            stale_threshold_ms: 600_000,
        }
    }
}

/// Metrics aggregation configuration (see `services::metrics`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub prometheus_enabled: bool,
    /// Dedicated Prometheus port; 0 serves `/metrics` on the main port
    pub prometheus_port: u16,
    /// Retention horizon for raw samples, in minutes
    pub history_window_minutes: u64,
    pub decay: DecaySettings,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus_enabled: true,
            prometheus_port: 0,
            history_window_minutes: 60,
            decay: DecaySettings::default(),
        }
    }
}

/// Streaming pass-through configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct StreamingSettings {
    pub enabled: bool,
    pub max_concurrent_streams: u32,
    /// Overall stream timeout, in milliseconds
    pub timeout_ms: u64,
    /// Chunk buffer size for the pass-through channel
    pub buffer_size: usize,
    pub ttft_weight: f64,
    pub duration_weight: f64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_streams: 100,
            timeout_ms: 300_000,
            buffer_size: 8_192,
            ttft_weight: 0.6,
            duration_weight: 0.4,
        }
    }
}

/// Health check scheduling (see `services::health`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    /// Probe cadence, in milliseconds
    pub interval_ms: u64,
    /// Per-probe timeout, in milliseconds
    pub timeout_ms: u64,
    /// Servers probed in parallel per sweep
    pub max_concurrent_checks: usize,
    /// Retries per failed probe
    pub retry_attempts: u32,
    /// Base delay between probe retries, in milliseconds
    pub retry_delay_ms: u64,
    /// Cadence of the open-breaker recovery sweep, in milliseconds
    pub recovery_interval_ms: u64,
    /// Consecutive probe failures before a server is marked unhealthy
    pub failure_threshold: u32,
    /// Consecutive probe successes before a server is marked healthy
    pub success_threshold: u32,
    /// Exponential backoff multiplier for probe retries
    pub backoff_multiplier: f64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 15_000,
            timeout_ms: 5_000,
            max_concurrent_checks: 8,
            retry_attempts: 2,
            retry_delay_ms: 500,
            recovery_interval_ms: 10_000,
            failure_threshold: 3,
            success_threshold: 2,
            backoff_multiplier: 2.0,
        }
    }
}

/// Same-server retry policy (dispatch Phase 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RetrySettings {
    pub max_retries_per_server: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// Upstream statuses that qualify for same-server retries
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries_per_server: 2,
            retry_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 10_000,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

/// Cooldown policy for model keys after failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CooldownSettings {
    /// Milliseconds a (server,model) key is excluded after any failure
    pub failure_cooldown_ms: u64,
    /// Concurrency assumed for servers without a declared limit
    pub default_max_concurrency: u32,
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            failure_cooldown_ms: 30_000,
            default_max_concurrency: 4,
        }
    }
}

/// Rough model load-time estimates by size class, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LoadTimeEstimates {
    pub tiny: u64,
    pub small: u64,
    pub medium: u64,
    pub large: u64,
    pub xl: u64,
    pub xxl: u64,
}

impl Default for LoadTimeEstimates {
    fn default() -> Self {
        Self {
            tiny: 5_000,
            small: 15_000,
            medium: 30_000,
            large: 60_000,
            xl: 120_000,
            xxl: 240_000,
        }
    }
}

impl LoadTimeEstimates {
    /// Estimated cold-load time for a model of the given size, via the
    /// coarse size classes.
    pub fn for_size_gb(&self, size_gb: f64) -> u64 {
        match crate::utils::model::size_class(size_gb) {
            "tiny" => self.tiny,
            "small" => self.small,
            "medium" => self.medium,
            "large" => self.large,
            "xl" => self.xl,
            _ => self.xxl,
        }
    }
}

/// Model sizing heuristics used by adaptive probe timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ModelManagerSettings {
    pub max_retries: u32,
    pub retry_delay_base_ms: u64,
    /// Ceiling for model warmup waits, in milliseconds
    pub warmup_timeout_ms: u64,
    /// Idle age past which a loaded model is considered evictable
    pub idle_threshold_ms: u64,
    /// Fraction of reported VRAM treated as usable
    pub memory_safety_margin: f64,
    /// Estimated GB of memory per billion parameters
    pub gb_per_billion_params: f64,
    /// Size assumed when neither VRAM nor a parameter count is known
    pub default_model_size_gb: f64,
    pub load_time_estimates: LoadTimeEstimates,
}

impl Default for ModelManagerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_base_ms: 1_000,
            warmup_timeout_ms: 120_000,
            idle_threshold_ms: 300_000,
            memory_safety_margin: 0.9,
            gb_per_billion_params: 2.0,
            default_model_size_gb: 8.0,
            load_time_estimates: LoadTimeEstimates::default(),
        }
    }
}

impl Settings {
    /// Validates settings that have hard correctness requirements. Softer
    /// concerns (suspicious but workable values) are the
    /// [`crate::config::validation::ConfigValidator`]'s job.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue.max_size == 0 {
            return Err("queue.maxSize must be >= 1".to_string());
        }
        if self.circuit_breaker.min_failure_threshold == 0 {
            return Err("circuitBreaker.minFailureThreshold must be >= 1".to_string());
        }
        if self.circuit_breaker.min_failure_threshold > self.circuit_breaker.max_failure_threshold {
            return Err(
                "circuitBreaker.minFailureThreshold cannot exceed maxFailureThreshold".to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker.error_rate_threshold) {
            return Err("circuitBreaker.errorRateThreshold must be within 0..=1".to_string());
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker.error_rate_smoothing) {
            return Err("circuitBreaker.errorRateSmoothing must be within 0..=1".to_string());
        }
        if self.cooldown.default_max_concurrency == 0 {
            return Err("cooldown.defaultMaxConcurrency must be >= 1".to_string());
        }
        if self.health_check.max_concurrent_checks == 0 {
            return Err("healthCheck.maxConcurrentChecks must be >= 1".to_string());
        }
        for spec in &self.servers {
            if !spec.url.starts_with("http://") && !spec.url.starts_with("https://") {
                return Err(format!(
                    "server url must include protocol (http:// or https://): {}",
                    spec.url
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"{ "port": 9000, "turboMode": true }"#;
        let parsed: Result<Settings, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn load_time_estimates_follow_size_classes() {
        let estimates = LoadTimeEstimates::default();
        assert_eq!(estimates.for_size_gb(1.0), 5_000);
        assert_eq!(estimates.for_size_gb(8.0), 30_000);
        assert_eq!(estimates.for_size_gb(40.0), 120_000);
        assert_eq!(estimates.for_size_gb(200.0), 240_000);
    }

    #[test]
    fn camel_case_keys_round_trip() {
        let raw = r#"{
            "queue": { "maxSize": 7, "priorityBoostAmount": 2 },
            "circuitBreaker": { "baseFailureThreshold": 3 },
            "servers": [{ "url": "http://b1:11434" }]
        }"#;
        let parsed: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.queue.max_size, 7);
        assert_eq!(parsed.queue.priority_boost_amount, 2);
        assert_eq!(parsed.circuit_breaker.base_failure_threshold, 3);
        assert_eq!(parsed.servers.len(), 1);
    }
}
