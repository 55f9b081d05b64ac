//! Fleetgate Orchestrator Server
//!
//! Reverse-proxy orchestrator fronting a fleet of inference backends,
//! built with Rust and Actix Web.
//!
//! This binary is the composition root: it loads and validates the
//! configuration, constructs the routing engine (fleet, breakers, metrics,
//! queue, recovery coordinator, orchestrator), starts the background
//! schedulers, and runs the HTTP front door with graceful shutdown.

use fleetgate::config::hot_reload::ConfigWatcher;
use fleetgate::config::settings::{config_path, load_settings};
use fleetgate::config::validation::ConfigValidator;
use fleetgate::logs::logger::configure_logger;
use fleetgate::middleware::auth::{ApiKeyConfig, ApiKeyGuard};
use fleetgate::middleware::security::{cors_headers, security_headers};
use fleetgate::models::error::ErrorPatternOverrides;
use fleetgate::models::settings::Settings;
use fleetgate::routes::admin::{configure_admin, AdminState};
use fleetgate::routes::{health, metrics, proxy};
use fleetgate::services::circuit_breaker::CircuitBreakerRegistry;
use fleetgate::services::fleet::Fleet;
use fleetgate::services::health::HealthCheckScheduler;
use fleetgate::services::history::HistoryStore;
use fleetgate::services::metrics::MetricsAggregator;
use fleetgate::services::orchestrator::Orchestrator;
use fleetgate::services::persistence::PersistenceManager;
use fleetgate::services::queue::RequestQueue;
use fleetgate::services::recovery::RecoveryTestCoordinator;
use fleetgate::services::upstream::{HttpUpstreamClient, UpstreamClient};

use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpServer};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Parse configuration first so the logger picks up the configured level.
    let config: Settings = load_settings().unwrap_or_else(|e| {
        eprintln!("failed to load settings: {}", e);
        std::process::exit(1);
    });
    configure_logger(&config.log_level);

    info!("Starting fleetgate orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let validation = ConfigValidator::validate_comprehensive(&config);
    for warning in &validation.warnings {
        warn!("config: {}", warning);
    }
    if !validation.is_valid {
        error!("Configuration validation failed:");
        for message in &validation.errors {
            error!("  - {}", message);
        }
        std::process::exit(1);
    }

    // Core components, leaves first.
    let fleet = Arc::new(Fleet::new(config.cooldown.default_max_concurrency));
    let breakers = CircuitBreakerRegistry::new(&config.circuit_breaker);
    let metrics_aggregator = MetricsAggregator::new(config.metrics.clone());
    let queue = Arc::new(RequestQueue::new(config.queue.clone()));
    let history = Arc::new(HistoryStore::default());
    let persistence = PersistenceManager::new(
        config.persistence_path.clone(),
        config.enable_persistence,
    );
    let upstream: Arc<dyn UpstreamClient> = Arc::new(
        HttpUpstreamClient::new().expect("failed to build upstream HTTP client"),
    );
    let recovery = RecoveryTestCoordinator::new(
        Arc::clone(&fleet),
        Arc::clone(&breakers),
        Arc::clone(&metrics_aggregator),
        Arc::clone(&upstream),
        config.health_check.clone(),
        config.model_manager.clone(),
        ErrorPatternOverrides::compile(
            &config.circuit_breaker.error_patterns.non_retryable,
            &config.circuit_breaker.error_patterns.transient,
        ),
    );
    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::clone(&fleet),
        Arc::clone(&breakers),
        Arc::clone(&metrics_aggregator),
        Arc::clone(&queue),
        Arc::clone(&recovery),
        Arc::clone(&upstream),
        Arc::clone(&history),
        Arc::clone(&persistence),
    );

    // Best-effort state recovery, then the configured fleet on top.
    orchestrator.restore_persisted().await;
    for spec in config.servers.clone() {
        if let Err(e) = fleet.add_server(spec) {
            // Persisted state already knows this server.
            info!("skipping configured server: {}", e);
        }
    }

    // Background loops.
    let scheduler = HealthCheckScheduler::new(
        Arc::clone(&fleet),
        Arc::clone(&breakers),
        Arc::clone(&recovery),
        Arc::clone(&upstream),
        Arc::clone(&persistence),
        config.health_check.clone(),
        &config.circuit_breaker,
    );
    let scheduler_handle = scheduler.spawn();
    let pump_handle = orchestrator.spawn_pump();
    let watcher = Arc::new(ConfigWatcher::new(
        config_path(),
        config.config_reload_interval_ms,
    ));
    let watcher_handle = watcher.spawn(Arc::clone(&orchestrator));

    // Rate limiting from the security section.
    let window_secs = (config.security.rate_limit_window_ms / 1000).max(1);
    let per_second = (config.security.rate_limit_max as u64 / window_secs).max(1);
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(per_second)
        .burst_size(config.security.rate_limit_max.max(1))
        .finish()
        .unwrap();

    let api_key_guard = ApiKeyGuard::new(ApiKeyConfig::from_settings(&config.security));
    let admin_state = AdminState {
        orchestrator: Arc::clone(&orchestrator),
        config_path: config_path(),
    };

    let host = std::env::var("FLEETGATE_HOST").unwrap_or_else(|_| config.host.clone());
    let port = std::env::var("FLEETGATE_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.port);

    info!("Listening on {}:{}", host, port);

    let orchestrator_data = web::Data::new(Arc::clone(&orchestrator));
    let fleet_data = web::Data::new(Arc::clone(&fleet));
    let admin_data = web::Data::new(admin_state);
    let cors_origins = config.security.cors_origins.clone();

    // Optional dedicated Prometheus listener; port 0 shares the main port.
    if config.metrics.prometheus_enabled && config.metrics.prometheus_port != 0 {
        let metrics_data = orchestrator_data.clone();
        let metrics_host = host.clone();
        let metrics_server = HttpServer::new(move || {
            App::new()
                .app_data(metrics_data.clone())
                .configure(metrics::configure_metrics)
        })
        .workers(1)
        .bind((metrics_host.as_str(), config.metrics.prometheus_port))?
        .run();
        info!(
            "Prometheus metrics on {}:{}",
            host, config.metrics.prometheus_port
        );
        tokio::spawn(metrics_server);
    }

    let server = HttpServer::new(move || {
        App::new()
            .app_data(orchestrator_data.clone())
            .app_data(fleet_data.clone())
            .app_data(admin_data.clone())
            .wrap(api_key_guard.clone())
            .wrap(Governor::new(&governor_conf))
            .wrap(Logger::new(r#"%a "%r" %s %b %T"#))
            .wrap(actix_web::middleware::Compress::default())
            .wrap(security_headers())
            .wrap(cors_headers(&cors_origins))
            .configure(health::configure_health)
            .configure(metrics::configure_metrics)
            .configure(configure_admin)
            .configure(proxy::configure_proxy)
    })
    .bind((host.as_str(), port))?
    .run();

    // Graceful shutdown: stop admissions, drain, persist.
    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("Server stopped"),
                Err(e) => error!("Server error: {}", e),
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, draining...");
            orchestrator.drain(10_000).await;
        }
    }

    scheduler_handle.abort();
    pump_handle.abort();
    if let Some(handle) = watcher_handle {
        handle.abort();
    }
    orchestrator.persist_all();
    persistence.flush().await;
    info!("Shutdown complete");

    Ok(())
}
