//! Loading and saving the orchestrator configuration file.
//!
//! The configuration is a single JSON file; its path comes from
//! `FLEETGATE_CONFIG_PATH` (default `./config.json`). A missing file yields
//! default settings so the orchestrator can start bare and be configured
//! through the admin surface; a malformed file is an error — silently
//! ignoring a typo'd config is worse than refusing to start.

use crate::models::error::OrchestratorError;
use crate::models::settings::Settings;
use log::info;

/// Resolves the configuration file path from the environment.
pub fn config_path() -> String {
    std::env::var("FLEETGATE_CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string())
}

/// Loads settings from the environment-configured path.
pub fn load_settings() -> Result<Settings, OrchestratorError> {
    load_settings_from(&config_path())
}

/// Loads settings from an explicit path. Unknown keys anywhere in the tree
/// are rejected.
pub fn load_settings_from(path: &str) -> Result<Settings, OrchestratorError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no config file at {}; using defaults", path);
            return Ok(Settings::default());
        }
        Err(e) => {
            return Err(OrchestratorError::Config {
                message: format!("cannot read {}: {}", path, e),
            })
        }
    };
    serde_json::from_str(&raw).map_err(|e| OrchestratorError::Config {
        message: format!("invalid configuration in {}: {}", path, e),
    })
}

/// Writes settings back to disk, pretty-printed.
pub async fn save_settings_to(settings: &Settings, path: &str) -> Result<(), OrchestratorError> {
    let json = serde_json::to_string_pretty(settings).map_err(|e| OrchestratorError::Config {
        message: format!("failed to serialize settings: {}", e),
    })?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| OrchestratorError::Config {
            message: format!("failed to write {}: {}", path, e),
        })?;
    info!("configuration saved to {}", path);
    Ok(())
}
