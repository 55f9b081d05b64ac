//! Comprehensive configuration validation.
//!
//! [`Settings::validate`] covers hard correctness requirements; this
//! validator layers on consistency checks and operational warnings so a
//! questionable-but-runnable configuration starts with a visible note
//! rather than a silent surprise.

use crate::models::settings::Settings;

/// Result of comprehensive configuration validation.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the full configuration tree, collecting every error and
    /// warning instead of stopping at the first.
    pub fn validate_comprehensive(settings: &Settings) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Err(message) = settings.validate() {
            errors.push(message);
        }

        if settings.port == 0 {
            errors.push("port must be non-zero".to_string());
        }

        // Queue sanity
        if settings.queue.timeout == 0 {
            warnings.push("queue.timeout is 0; queued requests expire immediately".to_string());
        }
        if settings.queue.max_size > 10_000 {
            warnings.push(format!(
                "queue.maxSize {} is very large; queued clients hold connections open",
                settings.queue.max_size
            ));
        }

        // Balancer weights
        let weights = &settings.load_balancer.weights;
        let weight_sum = weights.latency + weights.success_rate + weights.load + weights.capacity;
        if weight_sum <= 0.0 {
            errors.push("loadBalancer.weights must sum to a positive value".to_string());
        }
        if settings.load_balancer.thresholds.max_p95_latency <= 0.0 {
            errors.push("loadBalancer.thresholds.maxP95Latency must be positive".to_string());
        }
        let blend = settings.load_balancer.latency_blend_recent
            + settings.load_balancer.latency_blend_historical;
        if (blend - 1.0).abs() > 0.25 {
            warnings.push(format!(
                "loadBalancer latency blend factors sum to {:.2}; expected close to 1.0",
                blend
            ));
        }

        // Breaker timing
        let breaker = &settings.circuit_breaker;
        if breaker.half_open_max_requests == 0 {
            errors.push("circuitBreaker.halfOpenMaxRequests must be >= 1".to_string());
        }
        if breaker.recovery_success_threshold == 0 {
            errors.push("circuitBreaker.recoverySuccessThreshold must be >= 1".to_string());
        }
        if breaker.open_timeout < 1_000 {
            warnings.push(format!(
                "circuitBreaker.openTimeout {}ms is aggressive; breakers will flap",
                breaker.open_timeout
            ));
        }
        if breaker.half_open_timeout < breaker.open_timeout {
            warnings.push(
                "circuitBreaker.halfOpenTimeout is shorter than openTimeout; half-open episodes may expire before a probe completes".to_string(),
            );
        }

        // Health cadence
        let health = &settings.health_check;
        if health.enabled && health.interval_ms < 1_000 {
            warnings.push(format!(
                "healthCheck.intervalMs {}ms will probe backends very aggressively",
                health.interval_ms
            ));
        }
        if health.timeout_ms >= health.interval_ms && health.enabled {
            warnings.push(
                "healthCheck.timeoutMs >= intervalMs; sweeps may overlap under slow backends"
                    .to_string(),
            );
        }

        // Retry policy
        if settings.retry.backoff_multiplier < 1.0 {
            errors.push("retry.backoffMultiplier must be >= 1.0".to_string());
        }
        if settings.retry.retryable_status_codes.is_empty() {
            warnings.push(
                "retry.retryableStatusCodes is empty; same-server retries only fire on transport errors".to_string(),
            );
        }

        // Security posture
        if settings.security.api_keys.is_empty() && !settings.security.admin_api_keys.is_empty() {
            warnings.push(
                "admin API keys are set but the inference surface is open; set security.apiKeys to close it".to_string(),
            );
        }

        // Fleet
        if settings.servers.is_empty() {
            warnings.push(
                "no servers configured; add backends via the admin API or config file".to_string(),
            );
        }
        let mut urls: Vec<String> = settings
            .servers
            .iter()
            .map(|s| crate::models::server::normalize_url(&s.url))
            .collect();
        urls.sort();
        urls.dedup();
        if urls.len() != settings.servers.len() {
            errors.push("duplicate server urls in configuration".to_string());
        }

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_with_fleet_warning() {
        let result = ConfigValidator::validate_comprehensive(&Settings::default());
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("no servers")));
    }

    #[test]
    fn zero_weights_are_an_error() {
        let mut settings = Settings::default();
        settings.load_balancer.weights.latency = 0.0;
        settings.load_balancer.weights.success_rate = 0.0;
        settings.load_balancer.weights.load = 0.0;
        settings.load_balancer.weights.capacity = 0.0;
        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid);
    }

    #[test]
    fn duplicate_server_urls_are_an_error() {
        let mut settings = Settings::default();
        for _ in 0..2 {
            settings.servers.push(crate::models::server::ServerSpec {
                id: None,
                url: "http://b1:11434".to_string(),
                max_concurrency: None,
                api_key: None,
                api_key_header: None,
            });
        }
        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid);
    }
}
