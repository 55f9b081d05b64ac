//! Periodic configuration reload for zero-downtime updates.
//!
//! When `configReloadIntervalMs` is non-zero, a watcher task re-reads the
//! config file on that cadence, and on a content change validates the new
//! tree, applies it to the orchestrator atomically, and broadcasts the
//! update to any other subscribers.

use crate::config::settings::load_settings_from;
use crate::config::validation::ConfigValidator;
use crate::models::settings::Settings;
use crate::services::orchestrator::Orchestrator;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// One configuration update event.
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    pub settings: Settings,
    pub timestamp: DateTime<Utc>,
    /// Monotonically increasing update number
    pub version: u64,
}

/// Watches the configuration file and applies changes.
pub struct ConfigWatcher {
    config_path: String,
    interval_ms: u64,
    update_sender: broadcast::Sender<ConfigUpdate>,
}

impl ConfigWatcher {
    pub fn new(config_path: String, interval_ms: u64) -> Self {
        let (update_sender, _) = broadcast::channel(16);
        Self {
            config_path,
            interval_ms,
            update_sender,
        }
    }

    /// Subscribes to configuration updates.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdate> {
        self.update_sender.subscribe()
    }

    /// Spawns the watcher loop. Returns `None` when reloading is disabled
    /// (`configReloadIntervalMs` of 0). Abort the handle to stop.
    pub fn spawn(self: Arc<Self>, orchestrator: Arc<Orchestrator>) -> Option<JoinHandle<()>> {
        if self.interval_ms == 0 {
            return None;
        }
        let watcher = Arc::clone(&self);
        Some(tokio::spawn(async move {
            let mut version: u64 = 0;
            let mut last_seen = serde_json::to_string(&orchestrator.settings()).ok();
            let mut tick =
                tokio::time::interval(Duration::from_millis(watcher.interval_ms.max(1_000)));
            tick.tick().await; // skip the immediate first tick
            loop {
                tick.tick().await;
                let settings = match load_settings_from(&watcher.config_path) {
                    Ok(settings) => settings,
                    Err(e) => {
                        error!("config reload failed: {}", e);
                        continue;
                    }
                };
                let serialized = serde_json::to_string(&settings).ok();
                if serialized == last_seen {
                    continue;
                }
                let result = ConfigValidator::validate_comprehensive(&settings);
                if !result.is_valid {
                    for message in &result.errors {
                        error!("rejected config change: {}", message);
                    }
                    continue;
                }
                for message in &result.warnings {
                    warn!("config warning: {}", message);
                }
                version += 1;
                info!("applying config change #{} from {}", version, watcher.config_path);
                orchestrator.update_settings(settings.clone());
                last_seen = serialized;
                let _ = watcher.update_sender.send(ConfigUpdate {
                    settings,
                    timestamp: Utc::now(),
                    version,
                });
            }
        }))
    }
}
