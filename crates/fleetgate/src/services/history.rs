//! Bounded observability rings: routing decisions and completed requests.
//!
//! Decisions live in one global ring; request history keeps one bounded
//! ring per server, so a single busy backend can never evict another
//! server's history. Readers get clones so the rings never block the
//! request path.

use crate::models::error::ErrorCategory;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Score vector for one candidate considered by the balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub server_id: String,
    pub score: f64,
    pub latency_score: f64,
    pub success_score: f64,
    pub load_score: f64,
    pub capacity_score: f64,
    /// Breaker multiplier applied to the composite (1.0, 0.5 or 0.0)
    pub breaker_multiplier: f64,
}

/// One routing decision made by the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub at: DateTime<Utc>,
    pub model: String,
    pub candidates: Vec<CandidateScore>,
    pub selected: Option<String>,
    pub algorithm: String,
    pub reason: String,
}

/// One completed (or failed) proxied request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHistoryEntry {
    pub id: String,
    pub server_id: String,
    pub model: String,
    pub endpoint: String,
    pub streaming: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_generated: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_prompt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

/// Serializable snapshot of both rings for best-effort persistence. Request
/// entries are flattened across servers, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryExport {
    pub decisions: Vec<DecisionLogEntry>,
    pub requests: Vec<RequestHistoryEntry>,
}

/// Bounded rings for decisions and request history.
pub struct HistoryStore {
    decisions: Mutex<VecDeque<DecisionLogEntry>>,
    /// One bounded ring per server id.
    requests: Mutex<AHashMap<String, VecDeque<RequestHistoryEntry>>>,
    decision_capacity: usize,
    per_server_request_capacity: usize,
}

impl HistoryStore {
    /// `request_capacity` bounds each server's ring, not the total.
    pub fn new(decision_capacity: usize, request_capacity: usize) -> Self {
        Self {
            decisions: Mutex::new(VecDeque::with_capacity(decision_capacity.min(256))),
            requests: Mutex::new(AHashMap::new()),
            decision_capacity: decision_capacity.max(1),
            per_server_request_capacity: request_capacity.max(1),
        }
    }

    pub fn record_decision(&self, entry: DecisionLogEntry) {
        let mut ring = self.decisions.lock().unwrap();
        if ring.len() >= self.decision_capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    pub fn record_request(&self, entry: RequestHistoryEntry) {
        let mut rings = self.requests.lock().unwrap();
        let ring = rings.entry(entry.server_id.clone()).or_default();
        if ring.len() >= self.per_server_request_capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Recent decisions, newest last, up to `limit`.
    pub fn decisions(&self, limit: usize) -> Vec<DecisionLogEntry> {
        let ring = self.decisions.lock().unwrap();
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Recent requests, newest last, up to `limit`. With a server id only
    /// that server's ring is read; without one, rings are merged in
    /// completion-time order.
    pub fn requests(&self, limit: usize, server_id: Option<&str>) -> Vec<RequestHistoryEntry> {
        let rings = self.requests.lock().unwrap();
        match server_id {
            Some(id) => rings
                .get(id)
                .map(|ring| {
                    let skip = ring.len().saturating_sub(limit);
                    ring.iter().skip(skip).cloned().collect()
                })
                .unwrap_or_default(),
            None => {
                let mut merged: Vec<RequestHistoryEntry> =
                    rings.values().flat_map(|ring| ring.iter().cloned()).collect();
                merged.sort_by_key(|entry| entry.finished_at);
                let skip = merged.len().saturating_sub(limit);
                merged.into_iter().skip(skip).collect()
            }
        }
    }

    /// Drops a removed server's ring.
    pub fn remove_server(&self, server_id: &str) {
        self.requests.lock().unwrap().remove(server_id);
    }

    pub fn export(&self) -> HistoryExport {
        HistoryExport {
            decisions: self.decisions.lock().unwrap().iter().cloned().collect(),
            requests: self.requests(usize::MAX, None),
        }
    }

    pub fn restore(&self, export: HistoryExport) {
        let mut decisions = self.decisions.lock().unwrap();
        decisions.clear();
        decisions.extend(
            export
                .decisions
                .into_iter()
                .rev()
                .take(self.decision_capacity)
                .rev(),
        );
        drop(decisions);
        let mut rings = self.requests.lock().unwrap();
        rings.clear();
        for entry in export.requests {
            let ring = rings.entry(entry.server_id.clone()).or_default();
            if ring.len() >= self.per_server_request_capacity {
                ring.pop_front();
            }
            ring.push_back(entry);
        }
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(500, 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(model: &str) -> DecisionLogEntry {
        DecisionLogEntry {
            at: Utc::now(),
            model: model.to_string(),
            candidates: Vec::new(),
            selected: None,
            algorithm: "composite_score".to_string(),
            reason: "test".to_string(),
        }
    }

    fn request(id: &str, server: &str) -> RequestHistoryEntry {
        RequestHistoryEntry {
            id: id.to_string(),
            server_id: server.to_string(),
            model: "m".to_string(),
            endpoint: "generate".to_string(),
            streaming: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 1.0,
            success: true,
            tokens_generated: None,
            tokens_prompt: None,
            ttft_ms: None,
            error_category: None,
            error_message: None,
            cancelled: false,
        }
    }

    #[test]
    fn decision_ring_is_bounded() {
        let store = HistoryStore::new(3, 3);
        for i in 0..10 {
            store.record_decision(decision(&format!("m{}", i)));
        }
        let entries = store.decisions(100);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].model, "m7");
        assert_eq!(entries[2].model, "m9");
    }

    #[test]
    fn request_filter_by_server() {
        let store = HistoryStore::default();
        for (i, server) in ["a", "b", "a"].iter().enumerate() {
            store.record_request(request(&format!("r{}", i), server));
        }
        assert_eq!(store.requests(10, Some("a")).len(), 2);
        assert_eq!(store.requests(10, None).len(), 3);
        assert_eq!(store.requests(1, None).len(), 1);
        assert!(store.requests(10, Some("c")).is_empty());
    }

    #[test]
    fn busy_server_cannot_evict_anothers_history() {
        let store = HistoryStore::new(10, 2);
        store.record_request(request("b0", "b"));
        for i in 0..50 {
            store.record_request(request(&format!("a{}", i), "a"));
        }
        // Server a's ring is bounded; server b's entry survives the flood.
        assert_eq!(store.requests(100, Some("a")).len(), 2);
        let b_entries = store.requests(100, Some("b"));
        assert_eq!(b_entries.len(), 1);
        assert_eq!(b_entries[0].id, "b0");
    }

    #[test]
    fn remove_server_drops_its_ring() {
        let store = HistoryStore::default();
        store.record_request(request("r1", "a"));
        store.record_request(request("r2", "b"));
        store.remove_server("a");
        assert!(store.requests(10, Some("a")).is_empty());
        assert_eq!(store.requests(10, None).len(), 1);
    }

    #[test]
    fn export_restore_rebuckets_per_server() {
        let store = HistoryStore::new(10, 5);
        store.record_request(request("r1", "a"));
        store.record_request(request("r2", "b"));
        let export = store.export();

        let restored = HistoryStore::new(10, 5);
        restored.restore(export);
        assert_eq!(restored.requests(10, Some("a")).len(), 1);
        assert_eq!(restored.requests(10, Some("b")).len(), 1);
    }
}
