//! Fleet registry: the shared, read-mostly view of all backend servers.
//!
//! The registry is a leaf component — the orchestrator, the health-check
//! scheduler and the admin routes all hold an `Arc<Fleet>`, and nothing in
//! here points back at any of them. Server records are cloned out on read;
//! updates take the writer lock briefly and never perform I/O.

use crate::models::error::OrchestratorError;
use crate::models::server::{normalize_url, HardwareSnapshot, ServerRecord, ServerSpec};
use crate::utils::model::resolve_model_name;
use ahash::AHashMap;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, RwLock};

/// One entry of the aggregated fleet-wide model list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedModel {
    pub name: String,
    /// Servers hosting the model
    pub servers: Vec<String>,
}

/// Admin patch for an existing server. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ServerPatch {
    pub url: Option<String>,
    pub max_concurrency: Option<u32>,
    pub api_key: Option<String>,
    pub api_key_header: Option<String>,
}

/// Outcome of applying a successful probe to a server record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeOutcome {
    /// The server crossed the success threshold and was marked healthy
    pub became_healthy: bool,
    /// The discovered model list differs from the previous one
    pub models_changed: bool,
}

pub struct Fleet {
    servers: RwLock<Vec<ServerRecord>>,
    /// Consecutive dispatch (not probe) failures per server, feeding the
    /// "clear healthy after N consecutive failures" rule.
    dispatch_failures: Mutex<AHashMap<String, u32>>,
    tags_cache: Mutex<Option<Vec<AggregatedModel>>>,
    default_max_concurrency: u32,
}

impl Fleet {
    pub fn new(default_max_concurrency: u32) -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            dispatch_failures: Mutex::new(AHashMap::new()),
            tags_cache: Mutex::new(None),
            default_max_concurrency: default_max_concurrency.max(1),
        }
    }

    /// Registers a server. Fails when the id or normalized URL collides with
    /// an existing record.
    pub fn add_server(&self, spec: ServerSpec) -> Result<ServerRecord, OrchestratorError> {
        let record = spec.into_record(self.default_max_concurrency);
        record
            .validate()
            .map_err(|message| OrchestratorError::BadRequest { message })?;
        let mut servers = self.servers.write().unwrap();
        if servers.iter().any(|s| s.id == record.id) {
            return Err(OrchestratorError::BadRequest {
                message: format!("server id already registered: {}", record.id),
            });
        }
        if servers.iter().any(|s| s.url == record.url) {
            return Err(OrchestratorError::BadRequest {
                message: format!("server url already registered: {}", record.url),
            });
        }
        info!("registered server {} at {}", record.id, record.url);
        servers.push(record.clone());
        drop(servers);
        self.invalidate_tags();
        Ok(record)
    }

    /// Removes a server. Returns the removed record when it existed.
    pub fn remove_server(&self, id: &str) -> Option<ServerRecord> {
        let mut servers = self.servers.write().unwrap();
        let index = servers.iter().position(|s| s.id == id)?;
        let removed = servers.remove(index);
        drop(servers);
        self.dispatch_failures.lock().unwrap().remove(id);
        self.invalidate_tags();
        info!("removed server {}", id);
        Some(removed)
    }

    /// Applies an admin patch to a server.
    pub fn update_server(
        &self,
        id: &str,
        patch: ServerPatch,
    ) -> Result<ServerRecord, OrchestratorError> {
        let mut servers = self.servers.write().unwrap();
        if let Some(url) = &patch.url {
            let normalized = normalize_url(url);
            if servers.iter().any(|s| s.id != id && s.url == normalized) {
                return Err(OrchestratorError::BadRequest {
                    message: format!("server url already registered: {}", normalized),
                });
            }
        }
        let record = servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| OrchestratorError::BadRequest {
                message: format!("unknown server: {}", id),
            })?;
        if let Some(url) = patch.url {
            record.url = normalize_url(&url);
        }
        if let Some(max_concurrency) = patch.max_concurrency {
            if max_concurrency == 0 {
                return Err(OrchestratorError::BadRequest {
                    message: "maxConcurrency must be >= 1".to_string(),
                });
            }
            record.max_concurrency = max_concurrency;
        }
        if let Some(api_key) = patch.api_key {
            record.api_key = if api_key.is_empty() { None } else { Some(api_key) };
        }
        if let Some(header) = patch.api_key_header {
            record.api_key_header = if header.is_empty() { None } else { Some(header) };
        }
        let updated = record.clone();
        drop(servers);
        self.invalidate_tags();
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Option<ServerRecord> {
        self.servers.read().unwrap().iter().find(|s| s.id == id).cloned()
    }

    pub fn all(&self) -> Vec<ServerRecord> {
        self.servers.read().unwrap().clone()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.read().unwrap().iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets the drain bit. Draining servers admit no new requests but finish
    /// in-flight work.
    pub fn set_draining(&self, id: &str, draining: bool) -> bool {
        self.set_flag(id, |record| record.draining = draining)
    }

    /// Sets the maintenance bit, excluding the server from routing entirely.
    pub fn set_maintenance(&self, id: &str, maintenance: bool) -> bool {
        self.set_flag(id, |record| record.maintenance = maintenance)
    }

    /// Directly sets the health bit (breaker force-close cascades use this).
    pub fn set_healthy(&self, id: &str, healthy: bool) -> bool {
        self.set_flag(id, |record| {
            record.healthy = healthy;
            if healthy {
                record.consecutive_probe_failures = 0;
            }
        })
    }

    fn set_flag<F: FnOnce(&mut ServerRecord)>(&self, id: &str, apply: F) -> bool {
        let mut servers = self.servers.write().unwrap();
        match servers.iter_mut().find(|s| s.id == id) {
            Some(record) => {
                apply(record);
                true
            }
            None => false,
        }
    }

    /// Applies a successful health probe: refreshes discovery data and
    /// flips the server healthy once the success threshold is met.
    ///
    /// The caller is responsible for the breaker gate: a server whose
    /// breaker is open must not be marked healthy, so `breaker_open` is
    /// passed in rather than looked up here.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_probe_success(
        &self,
        id: &str,
        models: Vec<String>,
        openai_models: Option<Vec<String>>,
        version: Option<String>,
        hardware: Option<HardwareSnapshot>,
        latency_ms: u64,
        success_threshold: u32,
        breaker_open: bool,
    ) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::default();
        let mut servers = self.servers.write().unwrap();
        let record = match servers.iter_mut().find(|s| s.id == id) {
            Some(record) => record,
            None => return outcome,
        };
        outcome.models_changed = record.models != models;
        record.models = models;
        if let Some(openai) = openai_models {
            record.supports_openai_compatible = true;
            record.openai_models = Some(openai);
        }
        if version.is_some() {
            record.version = version;
        }
        if hardware.is_some() {
            record.hardware = hardware;
        }
        record.last_probe_latency_ms = Some(latency_ms);
        record.last_probe_at = Some(Utc::now());
        record.consecutive_probe_failures = 0;
        record.consecutive_probe_successes += 1;
        if !record.healthy
            && record.consecutive_probe_successes >= success_threshold
            && !breaker_open
        {
            record.healthy = true;
            outcome.became_healthy = true;
            info!("server {} is healthy again", id);
        }
        drop(servers);
        if outcome.models_changed {
            self.invalidate_tags();
        }
        outcome
    }

    /// Applies a failed health probe; flips the server unhealthy once the
    /// failure threshold is met. Returns true when health was cleared.
    pub fn apply_probe_failure(&self, id: &str, failure_threshold: u32) -> bool {
        let mut servers = self.servers.write().unwrap();
        let record = match servers.iter_mut().find(|s| s.id == id) {
            Some(record) => record,
            None => return false,
        };
        record.consecutive_probe_successes = 0;
        record.consecutive_probe_failures += 1;
        record.last_probe_at = Some(Utc::now());
        if record.healthy && record.consecutive_probe_failures >= failure_threshold {
            record.healthy = false;
            warn!(
                "server {} marked unhealthy after {} failed probes",
                id, record.consecutive_probe_failures
            );
            return true;
        }
        false
    }

    /// Records a dispatch failure against the server-wide consecutive
    /// counter; clears the healthy bit once `threshold` is reached.
    pub fn record_dispatch_failure(&self, id: &str, threshold: u32) -> bool {
        let mut failures = self.dispatch_failures.lock().unwrap();
        let count = failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        let tripped = *count >= threshold;
        drop(failures);
        if tripped {
            warn!("server {} unhealthy after {} consecutive dispatch failures", id, threshold);
            self.set_healthy(id, false);
        }
        tripped
    }

    /// Resets the consecutive dispatch-failure counter after any success.
    pub fn record_dispatch_success(&self, id: &str) {
        self.dispatch_failures.lock().unwrap().remove(id);
    }

    /// Resolves the model name as each hosting server knows it, honoring the
    /// `:latest` rule. Returns `(server, resolved_name)` pairs for servers
    /// that host the model, regardless of health (the candidate filter
    /// applies health separately).
    pub fn servers_hosting(&self, model: &str) -> Vec<(ServerRecord, String)> {
        self.servers
            .read()
            .unwrap()
            .iter()
            .filter_map(|server| {
                resolve_model_name(model, &server.models)
                    .map(|resolved| (server.clone(), resolved.to_string()))
            })
            .collect()
    }

    /// Whether any server in the fleet knows the model at all.
    pub fn model_known(&self, model: &str) -> bool {
        !self.servers_hosting(model).is_empty()
    }

    /// Aggregated fleet-wide model list, cached until the next model-list
    /// change or fleet mutation.
    pub fn aggregated_tags(&self) -> Vec<AggregatedModel> {
        if let Some(cached) = self.tags_cache.lock().unwrap().as_ref() {
            return cached.clone();
        }
        let servers = self.servers.read().unwrap();
        let mut by_name: AHashMap<String, Vec<String>> = AHashMap::new();
        for server in servers.iter() {
            for model in &server.models {
                by_name.entry(model.clone()).or_default().push(server.id.clone());
            }
        }
        drop(servers);
        let mut aggregated: Vec<AggregatedModel> = by_name
            .into_iter()
            .map(|(name, servers)| AggregatedModel { name, servers })
            .collect();
        aggregated.sort_by(|a, b| a.name.cmp(&b.name));
        *self.tags_cache.lock().unwrap() = Some(aggregated.clone());
        aggregated
    }

    /// Drops the aggregated model cache. Called on any model-list change.
    pub fn invalidate_tags(&self) {
        *self.tags_cache.lock().unwrap() = None;
    }

    /// Serializable fleet snapshot.
    pub fn export(&self) -> Vec<ServerRecord> {
        self.all()
    }

    /// Restores a persisted fleet. Servers come back unhealthy until the
    /// first probe confirms them; drain and maintenance bits survive.
    pub fn restore(&self, records: Vec<ServerRecord>) {
        let mut servers = self.servers.write().unwrap();
        servers.clear();
        for mut record in records {
            if record.validate().is_err() {
                warn!("skipping invalid persisted server record: {}", record.id);
                continue;
            }
            record.healthy = false;
            record.consecutive_probe_successes = 0;
            record.consecutive_probe_failures = 0;
            servers.push(record);
        }
        drop(servers);
        self.invalidate_tags();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, url: &str) -> ServerSpec {
        ServerSpec {
            id: Some(id.to_string()),
            url: url.to_string(),
            max_concurrency: Some(2),
            api_key: None,
            api_key_header: None,
        }
    }

    #[test]
    fn duplicate_ids_and_urls_are_rejected() {
        let fleet = Fleet::new(4);
        fleet.add_server(spec("a", "http://b1:11434")).unwrap();
        assert!(fleet.add_server(spec("a", "http://b2:11434")).is_err());
        assert!(fleet.add_server(spec("b", "http://B1:11434/")).is_err());
    }

    #[test]
    fn add_remove_round_trips() {
        let fleet = Fleet::new(4);
        fleet.add_server(spec("a", "http://b1:11434")).unwrap();
        assert_eq!(fleet.len(), 1);
        assert!(fleet.remove_server("a").is_some());
        assert!(fleet.is_empty());
        assert!(fleet.remove_server("a").is_none());
    }

    #[test]
    fn probe_thresholds_gate_health() {
        let fleet = Fleet::new(4);
        fleet.add_server(spec("a", "http://b1:11434")).unwrap();
        let outcome = fleet.apply_probe_success(
            "a",
            vec!["m1".to_string()],
            None,
            Some("0.5.1".to_string()),
            None,
            12,
            2,
            false,
        );
        assert!(!outcome.became_healthy);
        let outcome = fleet.apply_probe_success(
            "a",
            vec!["m1".to_string()],
            None,
            None,
            None,
            15,
            2,
            false,
        );
        assert!(outcome.became_healthy);
        assert!(fleet.get("a").unwrap().healthy);
        // Open breaker suppresses the healthy flip.
        fleet.set_healthy("a", false);
        let outcome = fleet.apply_probe_success(
            "a",
            vec!["m1".to_string()],
            None,
            None,
            None,
            15,
            1,
            true,
        );
        assert!(!outcome.became_healthy);
    }

    #[test]
    fn aggregated_tags_deduplicate_across_servers() {
        let fleet = Fleet::new(4);
        fleet.add_server(spec("a", "http://b1:11434")).unwrap();
        fleet.add_server(spec("b", "http://b2:11434")).unwrap();
        fleet.apply_probe_success("a", vec!["m1".into(), "m2".into()], None, None, None, 1, 1, false);
        fleet.apply_probe_success("b", vec!["m1".into()], None, None, None, 1, 1, false);
        let tags = fleet.aggregated_tags();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "m1");
        assert_eq!(tags[0].servers.len(), 2);
    }

    #[test]
    fn latest_rule_applies_in_hosting_lookup() {
        let fleet = Fleet::new(4);
        fleet.add_server(spec("a", "http://b1:11434")).unwrap();
        fleet.apply_probe_success("a", vec!["llama3:latest".into()], None, None, None, 1, 1, false);
        let hosting = fleet.servers_hosting("llama3");
        assert_eq!(hosting.len(), 1);
        assert_eq!(hosting[0].1, "llama3:latest");
    }
}
