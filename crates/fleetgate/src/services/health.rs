//! Periodic health checking of the backend fleet.
//!
//! Every interval the scheduler fans out probes to at most
//! `maxConcurrentChecks` servers in parallel. A probe fetches the model
//! list (required) plus the version and loaded-models endpoints (best
//! effort), retries with exponential backoff, and reports the outcome to
//! the fleet registry. Health marking is gated on the server breaker: a
//! server whose breaker is open can never be claimed healthy by a probe
//! alone, and a half-open breaker's fate is delegated to the
//! [`RecoveryTestCoordinator`] so probes stay serialized.
//!
//! The scheduler also runs the recovery sweep (promoting overdue open
//! breakers to half-open and issuing coordinated probes) and the
//! model-escalation sweep.

use crate::models::settings::{CircuitBreakerSettings, HealthCheckSettings};
use crate::services::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::services::fleet::Fleet;
use crate::services::persistence::{PersistKind, PersistenceManager};
use crate::services::recovery::RecoveryTestCoordinator;
use crate::services::upstream::UpstreamClient;
use crate::models::server::ServerRecord;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Periodic fan-out health prober.
pub struct HealthCheckScheduler {
    fleet: Arc<Fleet>,
    breakers: Arc<CircuitBreakerRegistry>,
    recovery: Arc<RecoveryTestCoordinator>,
    upstream: Arc<dyn UpstreamClient>,
    persistence: Arc<PersistenceManager>,
    settings: HealthCheckSettings,
    escalation_interval_ms: u64,
}

impl HealthCheckScheduler {
    pub fn new(
        fleet: Arc<Fleet>,
        breakers: Arc<CircuitBreakerRegistry>,
        recovery: Arc<RecoveryTestCoordinator>,
        upstream: Arc<dyn UpstreamClient>,
        persistence: Arc<PersistenceManager>,
        settings: HealthCheckSettings,
        breaker_settings: &CircuitBreakerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            fleet,
            breakers,
            recovery,
            upstream,
            persistence,
            settings,
            escalation_interval_ms: breaker_settings.model_escalation.check_interval_ms,
        })
    }

    /// Spawns the scheduler loops. Abort the returned handle to stop them.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self);
        tokio::spawn(async move {
            if !scheduler.settings.enabled {
                info!("health checking disabled by configuration");
                return;
            }
            let mut probe_tick =
                tokio::time::interval(Duration::from_millis(scheduler.settings.interval_ms.max(250)));
            let mut recovery_tick = tokio::time::interval(Duration::from_millis(
                scheduler.settings.recovery_interval_ms.max(250),
            ));
            let mut escalation_tick = tokio::time::interval(Duration::from_millis(
                scheduler.escalation_interval_ms.max(1_000),
            ));
            loop {
                tokio::select! {
                    _ = probe_tick.tick() => scheduler.run_sweep().await,
                    _ = recovery_tick.tick() => scheduler.run_recovery_sweep().await,
                    _ = escalation_tick.tick() => {
                        scheduler.breakers.run_escalation_sweep(&scheduler.fleet.server_ids());
                    }
                }
            }
        })
    }

    /// One fan-out probe sweep over the fleet.
    pub async fn run_sweep(&self) {
        let servers: Vec<ServerRecord> = self
            .fleet
            .all()
            .into_iter()
            .filter(|s| !s.maintenance)
            .collect();
        if servers.is_empty() {
            return;
        }
        futures_util::stream::iter(servers)
            .for_each_concurrent(self.settings.max_concurrent_checks, |server| async move {
                self.probe_server(server).await;
            })
            .await;
    }

    async fn probe_server(&self, server: ServerRecord) {
        let limit = Duration::from_millis(self.settings.timeout_ms);
        let mut delay = self.settings.retry_delay_ms as f64;
        let attempts = self.settings.retry_attempts + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                delay *= self.settings.backoff_multiplier;
            }
            let started = Instant::now();
            match self.upstream.list_models(&server, limit).await {
                Ok(models) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    // Version and hardware are best-effort decorations.
                    let version = self.upstream.version(&server, limit).await.ok();
                    let hardware = self.upstream.loaded_models(&server, limit).await.ok();
                    self.apply_success(&server, models, version, hardware, latency_ms)
                        .await;
                    return;
                }
                Err(error) => {
                    last_error = error.to_string();
                    debug!(
                        "probe attempt {}/{} for {} failed: {}",
                        attempt + 1,
                        attempts,
                        server.id,
                        last_error
                    );
                }
            }
        }

        let became_unhealthy = self
            .fleet
            .apply_probe_failure(&server.id, self.settings.failure_threshold);
        if became_unhealthy {
            warn!("server {} failed health checks: {}", server.id, last_error);
        }
    }

    async fn apply_success(
        &self,
        server: &ServerRecord,
        models: Vec<String>,
        version: Option<String>,
        hardware: Option<crate::models::server::HardwareSnapshot>,
        latency_ms: u64,
    ) {
        let breaker = self.breakers.get_or_create(&server.id);
        let breaker_state = breaker.state();

        match breaker_state {
            CircuitState::Open => {
                // The backend answered while its breaker was open: give it a
                // clean slate, model breakers included.
                info!("probe succeeded while {} breaker open; force-closing", server.id);
                breaker.force_close_keep_type();
                for model_breaker in self.breakers.model_breakers_for(&server.id) {
                    model_breaker.force_close_keep_type();
                }
            }
            CircuitState::HalfOpen => {
                // Recovery decisions belong to the coordinator so probes
                // stay single-flight per backend.
                let recovery = Arc::clone(&self.recovery);
                let server_id = server.id.clone();
                tokio::spawn(async move {
                    recovery.probe_server(&server_id).await;
                });
            }
            CircuitState::Closed => {}
        }

        let breaker_open = matches!(breaker.state(), CircuitState::Open | CircuitState::HalfOpen);
        let outcome = self.fleet.apply_probe_success(
            &server.id,
            models,
            None,
            version,
            hardware,
            latency_ms,
            self.settings.success_threshold,
            breaker_open,
        );
        if outcome.models_changed {
            debug!("model list changed on {}", server.id);
            self.persistence
                .schedule(PersistKind::Servers, &self.fleet.export());
        }
    }

    /// Recovery sweep: promotes overdue open breakers to half-open and
    /// issues coordinated probes for every half-open breaker.
    pub async fn run_recovery_sweep(&self) {
        self.breakers.sweep();
        for breaker in self.breakers.all() {
            if breaker.state() != CircuitState::HalfOpen {
                continue;
            }
            let key = breaker.key().to_string();
            let recovery = Arc::clone(&self.recovery);
            match crate::utils::model::split_model_key(&key) {
                Some((server_id, model)) => {
                    let server_id = server_id.to_string();
                    let model = model.to_string();
                    tokio::spawn(async move {
                        recovery.probe_model(&server_id, &model).await;
                    });
                }
                None => {
                    tokio::spawn(async move {
                        recovery.probe_server(&key).await;
                    });
                }
            }
        }
    }
}
