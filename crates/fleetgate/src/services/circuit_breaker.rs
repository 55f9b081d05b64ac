//! Two-level circuit breakers protecting inference backends.
//!
//! Breakers are keyed by `serverId` (server level) or `serverId:model`
//! (model level) and owned by a [`CircuitBreakerRegistry`]. Each breaker is
//! a Closed/Open/HalfOpen state machine that adapts its failure threshold to
//! the recent error mix: a burst of non-retryable errors opens the circuit
//! faster, transient noise is absorbed with a higher threshold.
//!
//! All counters and the state of one breaker form a single critical section
//! behind one mutex; observers of a transition therefore always see the
//! counter updates that caused it. Cross-breaker operations never take more
//! than one breaker lock at a time.

use crate::models::error::ErrorCategory;
use crate::models::server::ModelType;
use crate::models::settings::{CircuitBreakerSettings, ModelEscalationSettings};
use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

/// State of a circuit breaker.
///
/// * `Closed` - normal operation, requests pass through
/// * `Open` - circuit tripped, requests fail fast
/// * `HalfOpen` - testing recovery, a bounded number of probes allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration parameters for circuit breaker behavior.
///
/// Derived from the `circuitBreaker` settings section; durations come in as
/// milliseconds and are converted once here.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub base_failure_threshold: u32,
    pub max_failure_threshold: u32,
    pub min_failure_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_timeout: Duration,
    pub half_open_max_requests: u32,
    pub recovery_success_threshold: u32,
    pub error_rate_window: Duration,
    pub error_rate_threshold: f64,
    pub error_rate_smoothing: f64,
    pub adaptive_thresholds: bool,
    pub adaptive_threshold_adjustment: u32,
    pub non_retryable_ratio_threshold: f64,
    pub transient_ratio_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_settings(&CircuitBreakerSettings::default())
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self {
            base_failure_threshold: settings.base_failure_threshold,
            max_failure_threshold: settings.max_failure_threshold,
            min_failure_threshold: settings.min_failure_threshold,
            open_timeout: Duration::milliseconds(settings.open_timeout as i64),
            half_open_timeout: Duration::milliseconds(settings.half_open_timeout as i64),
            half_open_max_requests: settings.half_open_max_requests,
            recovery_success_threshold: settings.recovery_success_threshold,
            error_rate_window: Duration::milliseconds(settings.error_rate_window as i64),
            error_rate_threshold: settings.error_rate_threshold,
            error_rate_smoothing: settings.error_rate_smoothing,
            adaptive_thresholds: settings.adaptive_thresholds,
            adaptive_threshold_adjustment: settings.adaptive_threshold_adjustment,
            non_retryable_ratio_threshold: settings.non_retryable_ratio_threshold,
            transient_ratio_threshold: settings.transient_ratio_threshold,
        }
    }
}

/// Per-category error counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub retryable: u64,
    pub non_retryable: u64,
    pub transient: u64,
    pub permanent: u64,
}

impl CategoryCounts {
    fn bump(&mut self, category: ErrorCategory) {
        match category {
            ErrorCategory::Retryable => self.retryable += 1,
            ErrorCategory::NonRetryable => self.non_retryable += 1,
            ErrorCategory::Transient => self.transient += 1,
            ErrorCategory::Permanent => self.permanent += 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    consecutive_successes: u64,
    total_request_count: u64,
    blocked_request_count: u64,
    categories: CategoryCounts,
    recent_errors: VecDeque<(DateTime<Utc>, ErrorCategory)>,
    error_rate: f64,
    last_failure_at: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
    last_failure_category: Option<ErrorCategory>,
    last_success_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_started_at: Option<DateTime<Utc>>,
    half_open_attempts: u64,
    active_tests_in_progress: u32,
    consecutive_failed_recoveries: u32,
    model_type: Option<ModelType>,
    current_threshold: u32,
}

impl BreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_successes: 0,
            total_request_count: 0,
            blocked_request_count: 0,
            categories: CategoryCounts::default(),
            recent_errors: VecDeque::new(),
            error_rate: 0.0,
            last_failure_at: None,
            last_failure_reason: None,
            last_failure_category: None,
            last_success_at: None,
            next_retry_at: None,
            opened_at: None,
            half_open_started_at: None,
            half_open_attempts: 0,
            active_tests_in_progress: 0,
            consecutive_failed_recoveries: 0,
            model_type: None,
            current_threshold: config.base_failure_threshold,
        }
    }

    fn prune_recent(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = now - window;
        while self.recent_errors.front().map(|(at, _)| *at < cutoff) == Some(true) {
            self.recent_errors.pop_front();
        }
    }

    /// Reopen backoff: doubles per consecutive failed recovery, capped so a
    /// flapping backend is retried at most every ~32x the base timeout.
    fn reopen_delay(&self, config: &CircuitBreakerConfig) -> Duration {
        let exponent = self.consecutive_failed_recoveries.min(5);
        config.open_timeout * 2_i32.pow(exponent)
    }
}

/// Serializable breaker snapshot for the admin surface and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub consecutive_successes: u64,
    pub total_request_count: u64,
    pub blocked_request_count: u64,
    pub categories: CategoryCounts,
    pub error_rate: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub last_failure_category: Option<ErrorCategory>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_started_at: Option<DateTime<Utc>>,
    pub half_open_attempts: u64,
    pub active_tests_in_progress: u32,
    pub consecutive_failed_recoveries: u32,
    pub model_type: Option<ModelType>,
    pub current_threshold: u32,
}

/// A single circuit breaker.
///
/// The breaker never raises; it only records outcomes and answers admission
/// questions. All mutation happens under one internal mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: String, config: CircuitBreakerConfig) -> Arc<Self> {
        let inner = BreakerInner::new(&config);
        Arc::new(Self {
            key,
            config,
            inner: Mutex::new(inner),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether an attempt may proceed right now.
    ///
    /// Lazily transitions Open→HalfOpen once `next_retry_at` passes; the
    /// first caller after the transition is admitted as a half-open probe.
    /// Blocked attempts bump `blocked_request_count`.
    pub fn can_execute(&self) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.next_retry_at.map(|at| now >= at) == Some(true) {
                    Self::to_half_open(&mut inner, &self.key, now);
                    inner.half_open_attempts = 1;
                    true
                } else {
                    inner.blocked_request_count += 1;
                    inner.total_request_count += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                let timed_out = inner
                    .half_open_started_at
                    .map(|at| now - at > self.config.half_open_timeout)
                    == Some(true);
                if timed_out && inner.active_tests_in_progress == 0 {
                    Self::reopen(&mut inner, &self.config, &self.key, now, "half-open timeout");
                    inner.blocked_request_count += 1;
                    inner.total_request_count += 1;
                    return false;
                }
                if inner.half_open_attempts < self.config.half_open_max_requests as u64 {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    inner.blocked_request_count += 1;
                    inner.total_request_count += 1;
                    false
                }
            }
        }
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Side-effect-free admission check used by the candidate filter. The
    /// real admission ([`Self::can_execute`]) runs at attempt time; this
    /// preview neither consumes half-open probe budget nor counts blocks.
    pub fn admission_preview(&self) -> bool {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.next_retry_at.map(|at| now >= at) == Some(true),
            CircuitState::HalfOpen => {
                inner.half_open_attempts < self.config.half_open_max_requests as u64
            }
        }
    }

    /// Records a successful attempt.
    pub fn record_success(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.total_request_count += 1;
        inner.success_count += 1;
        inner.consecutive_successes += 1;
        inner.last_success_at = Some(now);
        inner.error_rate *= 1.0 - self.config.error_rate_smoothing;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                if inner.consecutive_successes >= self.config.recovery_success_threshold as u64 {
                    Self::to_closed(&mut inner, &self.config, &self.key);
                }
            }
            CircuitState::Open => {
                debug!("unexpected success recorded while {} is open", self.key);
            }
        }
    }

    /// Records a failed attempt with its classification.
    pub fn record_failure(&self, category: ErrorCategory, reason: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.total_request_count += 1;
        inner.failure_count += 1;
        inner.consecutive_successes = 0;
        inner.categories.bump(category);
        inner.recent_errors.push_back((now, category));
        inner.prune_recent(self.config.error_rate_window, now);
        inner.last_failure_at = Some(now);
        inner.last_failure_reason = Some(reason.chars().take(200).collect());
        inner.last_failure_category = Some(category);
        inner.error_rate = self.config.error_rate_smoothing
            + (1.0 - self.config.error_rate_smoothing) * inner.error_rate;

        match inner.state {
            CircuitState::Closed => {
                self.adapt_threshold(&mut inner);
                let over_count = inner.failure_count >= inner.current_threshold as u64;
                let over_rate = inner.error_rate >= self.config.error_rate_threshold;
                if over_count || over_rate {
                    inner.consecutive_failed_recoveries = 0;
                    Self::reopen(
                        &mut inner,
                        &self.config,
                        &self.key,
                        now,
                        if over_count { "failure threshold" } else { "error rate" },
                    );
                }
            }
            CircuitState::HalfOpen => {
                Self::reopen(&mut inner, &self.config, &self.key, now, "probe failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Adjusts the effective failure threshold from the recent error mix.
    fn adapt_threshold(&self, inner: &mut BreakerInner) {
        if !self.config.adaptive_thresholds {
            return;
        }
        let total = inner.recent_errors.len();
        if total == 0 {
            inner.current_threshold = self.config.base_failure_threshold;
            return;
        }
        let non_retryable = inner
            .recent_errors
            .iter()
            .filter(|(_, c)| matches!(c, ErrorCategory::NonRetryable | ErrorCategory::Permanent))
            .count();
        let transient = inner
            .recent_errors
            .iter()
            .filter(|(_, c)| matches!(c, ErrorCategory::Transient))
            .count();
        let non_retryable_ratio = non_retryable as f64 / total as f64;
        let transient_ratio = transient as f64 / total as f64;

        if non_retryable_ratio >= self.config.non_retryable_ratio_threshold {
            inner.current_threshold = self
                .config
                .base_failure_threshold
                .saturating_sub(self.config.adaptive_threshold_adjustment)
                .max(self.config.min_failure_threshold);
        } else if transient_ratio >= self.config.transient_ratio_threshold {
            inner.current_threshold = (self.config.base_failure_threshold
                + self.config.adaptive_threshold_adjustment)
                .min(self.config.max_failure_threshold);
        } else {
            inner.current_threshold = self.config.base_failure_threshold;
        }
    }

    fn reopen(
        inner: &mut BreakerInner,
        config: &CircuitBreakerConfig,
        key: &str,
        now: DateTime<Utc>,
        why: &str,
    ) {
        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_failed_recoveries += 1;
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.half_open_started_at = None;
        inner.half_open_attempts = 0;
        inner.consecutive_successes = 0;
        inner.next_retry_at = Some(now + inner.reopen_delay(config));
        warn!("circuit {} opened ({})", key, why);
    }

    fn to_half_open(inner: &mut BreakerInner, key: &str, now: DateTime<Utc>) {
        inner.state = CircuitState::HalfOpen;
        inner.half_open_started_at = Some(now);
        inner.half_open_attempts = 0;
        inner.consecutive_successes = 0;
        info!("circuit {} half-open, testing recovery", key);
    }

    fn to_closed(inner: &mut BreakerInner, config: &CircuitBreakerConfig, key: &str) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.consecutive_successes = 0;
        inner.half_open_started_at = None;
        inner.half_open_attempts = 0;
        inner.next_retry_at = None;
        inner.opened_at = None;
        inner.consecutive_failed_recoveries = 0;
        inner.error_rate = 0.0;
        inner.current_threshold = config.base_failure_threshold;
        info!("circuit {} closed, service recovered", key);
    }

    /// Admin override: opens the circuit immediately and schedules the next
    /// retry one open-timeout from now. Clears consecutive successes.
    pub fn force_open(&self, reason: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failed_recoveries = 0;
        Self::reopen(&mut inner, &self.config, &self.key, now, reason);
    }

    /// Admin override: closes the circuit and clears failure counters,
    /// recovery bookkeeping, escalation state and the smoothed error rate.
    /// Also clears a learned model type so a bad detection can be undone.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::to_closed(&mut inner, &self.config, &self.key);
        inner.model_type = None;
    }

    /// Like [`Self::force_close`], but keeps the learned model type. Used by
    /// health-check recovery where the classification is still trusted.
    pub fn force_close_keep_type(&self) {
        let mut inner = self.inner.lock().unwrap();
        let model_type = inner.model_type;
        Self::to_closed(&mut inner, &self.config, &self.key);
        inner.model_type = model_type;
    }

    /// Periodic sweep hook so idle systems do not strand breakers in Open:
    /// promotes Open→HalfOpen when the retry time passed, and reopens a
    /// half-open breaker whose episode timed out with no probe in flight.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Open => {
                if inner.next_retry_at.map(|at| now >= at) == Some(true) {
                    Self::to_half_open(&mut inner, &self.key, now);
                }
            }
            CircuitState::HalfOpen => {
                let timed_out = inner
                    .half_open_started_at
                    .map(|at| now - at > self.config.half_open_timeout)
                    == Some(true);
                if timed_out && inner.active_tests_in_progress == 0 {
                    Self::reopen(&mut inner, &self.config, &self.key, now, "half-open timeout");
                }
            }
            CircuitState::Closed => {}
        }
    }

    /// Marks a coordinated recovery probe as started. While any probe is in
    /// progress, half-open timeout reopens are suppressed.
    pub fn begin_recovery_test(&self) {
        self.inner.lock().unwrap().active_tests_in_progress += 1;
    }

    /// Marks a coordinated recovery probe as finished.
    pub fn end_recovery_test(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_tests_in_progress = inner.active_tests_in_progress.saturating_sub(1);
    }

    pub fn model_type(&self) -> Option<ModelType> {
        self.inner.lock().unwrap().model_type
    }

    /// Records the discovered model type. Once set it persists until an
    /// admin [`Self::force_close`] clears it.
    pub fn set_model_type(&self, model_type: ModelType) {
        let mut inner = self.inner.lock().unwrap();
        if inner.model_type != Some(model_type) {
            debug!("{} classified as {:?}", self.key, model_type);
            inner.model_type = Some(model_type);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_successes: inner.consecutive_successes,
            total_request_count: inner.total_request_count,
            blocked_request_count: inner.blocked_request_count,
            categories: inner.categories,
            error_rate: inner.error_rate,
            last_failure_at: inner.last_failure_at,
            last_failure_reason: inner.last_failure_reason.clone(),
            last_failure_category: inner.last_failure_category,
            last_success_at: inner.last_success_at,
            next_retry_at: inner.next_retry_at,
            opened_at: inner.opened_at,
            half_open_started_at: inner.half_open_started_at,
            half_open_attempts: inner.half_open_attempts,
            active_tests_in_progress: inner.active_tests_in_progress,
            consecutive_failed_recoveries: inner.consecutive_failed_recoveries,
            model_type: inner.model_type,
            current_threshold: inner.current_threshold,
        }
    }

    /// Restores counters and state from a snapshot. In-flight probe counts
    /// are not restored; probes do not survive a restart.
    pub fn restore(&self, snapshot: &BreakerSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = snapshot.state;
        inner.failure_count = snapshot.failure_count;
        inner.success_count = snapshot.success_count;
        inner.consecutive_successes = snapshot.consecutive_successes;
        inner.total_request_count = snapshot.total_request_count;
        inner.blocked_request_count = snapshot.blocked_request_count;
        inner.categories = snapshot.categories;
        inner.error_rate = snapshot.error_rate;
        inner.last_failure_at = snapshot.last_failure_at;
        inner.last_failure_reason = snapshot.last_failure_reason.clone();
        inner.last_failure_category = snapshot.last_failure_category;
        inner.last_success_at = snapshot.last_success_at;
        inner.next_retry_at = snapshot.next_retry_at;
        inner.opened_at = snapshot.opened_at;
        inner.half_open_started_at = snapshot.half_open_started_at;
        inner.half_open_attempts = snapshot.half_open_attempts;
        inner.active_tests_in_progress = 0;
        inner.consecutive_failed_recoveries = snapshot.consecutive_failed_recoveries;
        inner.model_type = snapshot.model_type;
        inner.current_threshold = snapshot.current_threshold;
    }
}

/// Registry of breakers keyed by `serverId` or `serverId:model`.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    escalation: ModelEscalationSettings,
    breakers: RwLock<AHashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: &CircuitBreakerSettings) -> Arc<Self> {
        Arc::new(Self {
            config: CircuitBreakerConfig::from_settings(settings),
            escalation: settings.model_escalation.clone(),
            breakers: RwLock::new(AHashMap::new()),
        })
    }

    /// Idempotent fetch-or-create.
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(key) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().unwrap();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| CircuitBreaker::new(key.to_string(), self.config.clone())),
        )
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().get(key).cloned()
    }

    /// Removes the server breaker and all `serverId:*` model breakers in one
    /// write-lock critical section.
    pub fn remove_by_prefix(&self, server_id: &str) {
        let prefix = format!("{}:", server_id);
        let mut breakers = self.breakers.write().unwrap();
        breakers.retain(|key, _| key != server_id && !key.starts_with(&prefix));
    }

    /// All model-level breakers under a server.
    pub fn model_breakers_for(&self, server_id: &str) -> Vec<Arc<CircuitBreaker>> {
        let prefix = format!("{}:", server_id);
        self.breakers
            .read()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, breaker)| Arc::clone(breaker))
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().values().cloned().collect()
    }

    /// Promotes overdue Open breakers and expires stale HalfOpen episodes.
    pub fn sweep(&self) {
        for breaker in self.all() {
            breaker.sweep();
        }
    }

    /// Model-escalation sweep: when enough of a server's model breakers have
    /// been open long enough, the server breaker itself is opened.
    pub fn run_escalation_sweep(&self, server_ids: &[String]) {
        if !self.escalation.enabled {
            return;
        }
        let now = Utc::now();
        let min_open = Duration::milliseconds(self.escalation.duration_threshold_ms as i64);
        for server_id in server_ids {
            let model_breakers = self.model_breakers_for(server_id);
            if model_breakers.is_empty() {
                continue;
            }
            let open_long_enough = model_breakers
                .iter()
                .filter(|b| {
                    let snap = b.snapshot();
                    snap.state == CircuitState::Open
                        && snap.opened_at.map(|at| now - at >= min_open) == Some(true)
                })
                .count();
            let ratio = open_long_enough as f64 / model_breakers.len() as f64;
            if ratio >= self.escalation.ratio_threshold {
                let server_breaker = self.get_or_create(server_id);
                if server_breaker.state() != CircuitState::Open {
                    warn!(
                        "escalating {}: {}/{} model circuits open",
                        server_id,
                        open_long_enough,
                        model_breakers.len()
                    );
                    server_breaker.force_open("model escalation");
                }
            }
        }
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.all().iter().map(|b| b.snapshot()).collect()
    }

    /// Recreates breakers from persisted snapshots, best-effort.
    pub fn restore(&self, snapshots: Vec<BreakerSnapshot>) {
        for snapshot in snapshots {
            let breaker = self.get_or_create(&snapshot.key);
            breaker.restore(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            base_failure_threshold: base_threshold,
            max_failure_threshold: base_threshold + 4,
            min_failure_threshold: 1,
            open_timeout: Duration::milliseconds(50),
            half_open_timeout: Duration::milliseconds(200),
            half_open_max_requests: 2,
            recovery_success_threshold: 2,
            error_rate_window: Duration::seconds(60),
            error_rate_threshold: 1.1, // effectively disabled for count tests
            error_rate_smoothing: 0.2,
            adaptive_thresholds: false,
            adaptive_threshold_adjustment: 2,
            non_retryable_ratio_threshold: 0.7,
            transient_ratio_threshold: 0.7,
        }
    }

    #[test]
    fn opens_on_exactly_the_threshold() {
        let breaker = CircuitBreaker::new("a:m".to_string(), config(3));
        breaker.record_failure(ErrorCategory::Transient, "boom");
        breaker.record_failure(ErrorCategory::Transient, "boom");
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(ErrorCategory::Transient, "boom");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn counter_invariants_hold() {
        let breaker = CircuitBreaker::new("a:m".to_string(), config(2));
        breaker.record_success();
        breaker.record_failure(ErrorCategory::Transient, "x");
        breaker.record_failure(ErrorCategory::Transient, "x");
        let _ = breaker.can_execute(); // blocked
        let snap = breaker.snapshot();
        assert!(
            snap.success_count + snap.failure_count + snap.blocked_request_count
                <= snap.total_request_count
        );
    }

    #[test]
    fn force_close_clears_blocking() {
        let breaker = CircuitBreaker::new("a:m".to_string(), config(1));
        breaker.record_failure(ErrorCategory::Transient, "x");
        assert!(!breaker.can_execute());
        breaker.force_close();
        assert!(breaker.can_execute());
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[test]
    fn adaptive_threshold_reacts_to_error_mix() {
        let mut cfg = config(5);
        cfg.adaptive_thresholds = true;
        cfg.min_failure_threshold = 2;
        cfg.adaptive_threshold_adjustment = 3;
        let breaker = CircuitBreaker::new("a:m".to_string(), cfg);
        // Predominantly non-retryable: threshold drops to max(min, 5-3)=2,
        // so the second failure opens the circuit.
        breaker.record_failure(ErrorCategory::NonRetryable, "bad request");
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(ErrorCategory::NonRetryable, "bad request");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_prefix_removal_is_atomic() {
        let registry = CircuitBreakerRegistry::new(&CircuitBreakerSettings::default());
        registry.get_or_create("a");
        registry.get_or_create("a:m1");
        registry.get_or_create("a:m2");
        registry.get_or_create("ab:m1");
        registry.remove_by_prefix("a");
        assert!(registry.get("a").is_none());
        assert!(registry.get("a:m1").is_none());
        assert!(registry.get("a:m2").is_none());
        assert!(registry.get("ab:m1").is_some());
    }

    #[test]
    fn half_open_admits_bounded_probes() {
        let breaker = CircuitBreaker::new("a:m".to_string(), config(1));
        breaker.record_failure(ErrorCategory::Transient, "x");
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(breaker.can_execute()); // transitions to half-open, probe 1
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute()); // probe 2 (max)
        assert!(!breaker.can_execute()); // over the probe budget
    }

    #[test]
    fn recovery_closes_after_consecutive_successes() {
        let breaker = CircuitBreaker::new("a:m".to_string(), config(1));
        breaker.record_failure(ErrorCategory::Transient, "x");
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let breaker = CircuitBreaker::new("a:m".to_string(), config(5));
        breaker.record_failure(ErrorCategory::Permanent, "oom");
        breaker.record_success();
        breaker.set_model_type(ModelType::Embedding);
        let snapshot = breaker.snapshot();

        let restored = CircuitBreaker::new("a:m".to_string(), config(5));
        restored.restore(&snapshot);
        let round_tripped = restored.snapshot();
        assert_eq!(round_tripped.failure_count, snapshot.failure_count);
        assert_eq!(round_tripped.success_count, snapshot.success_count);
        assert_eq!(round_tripped.categories.permanent, 1);
        assert_eq!(round_tripped.model_type, Some(ModelType::Embedding));
    }
}
