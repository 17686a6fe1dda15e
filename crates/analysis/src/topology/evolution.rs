//! Topology evolution across ledger windows: windowed snapshots (cached) and
//! numeric deltas between windows, preserving replay determinism by keying
//! everything on event ranges.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use serde_json::{Map, Value};

use pmm_core::EventLog;
use pmm_projections::{ConceptGraph, IDENTITY_CONCEPTS_V1};

use super::graph::GraphTopologyAnalyzer;
use super::identity::{IdentityTopologyAnalyzer, IdentityTopologyThresholds};

const SNAPSHOT_CACHE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyWindow {
    pub start_id: u64,
    pub end_id: u64,
    pub event_count: usize,
}

#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub window: TopologyWindow,
    pub summary: Value,
    pub identity_metrics: Value,
}

#[derive(Debug, Clone)]
pub struct TopologyDelta {
    pub summary: Map<String, Value>,
    pub identity: Map<String, Value>,
}

/// Compute topology snapshots and deltas across ledger spans.
pub struct GraphEvolutionTracker {
    log: Arc<EventLog>,
    identity_tokens: Vec<String>,
    identity_thresholds: Option<IdentityTopologyThresholds>,
    snapshots: Mutex<LruCache<(u64, u64), TopologySnapshot>>,
}

impl GraphEvolutionTracker {
    pub fn new(
        log: Arc<EventLog>,
        identity_tokens: Option<Vec<String>>,
        identity_thresholds: Option<IdentityTopologyThresholds>,
    ) -> Self {
        Self {
            log,
            identity_tokens: identity_tokens.unwrap_or_else(|| {
                IDENTITY_CONCEPTS_V1.iter().map(|t| t.to_string()).collect()
            }),
            identity_thresholds,
            snapshots: Mutex::new(LruCache::new(
                NonZeroUsize::new(SNAPSHOT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn snapshot_window(&self, start_id: u64, end_id: u64) -> TopologySnapshot {
        {
            let mut cache = self.lock_snapshots();
            if let Some(snapshot) = cache.get(&(start_id, end_id)) {
                return snapshot.clone();
            }
        }

        let events = self.log.read_range(start_id, end_id, None);
        let mut concept_graph = ConceptGraph::new();
        concept_graph.rebuild(&events);
        let mut analyzer = GraphTopologyAnalyzer::new(&concept_graph);
        let mut identity =
            IdentityTopologyAnalyzer::new(self.identity_tokens.clone(), self.identity_thresholds);
        let report = identity.analyze(&analyzer);

        let snapshot = TopologySnapshot {
            window: TopologyWindow { start_id, end_id, event_count: events.len() },
            summary: analyzer.summary(),
            identity_metrics: serde_json::json!({
                "total_identity_tokens": report.metrics.total_identity_tokens,
                "present_identity_nodes": report.metrics.present_identity_nodes,
                "missing_identity_tokens": report.metrics.missing_identity_tokens,
                "cohesion": report.metrics.cohesion,
                "fragmentation_count": report.metrics.fragmentation_count,
                "bridge_dependency": report.metrics.bridge_dependency,
            }),
        };
        self.lock_snapshots().put((start_id, end_id), snapshot.clone());
        snapshot
    }

    pub fn compare_windows(
        &self,
        start_a: u64,
        end_a: u64,
        start_b: u64,
        end_b: u64,
    ) -> TopologyDelta {
        let snap_a = self.snapshot_window(start_a, end_a);
        let snap_b = self.snapshot_window(start_b, end_b);
        TopologyDelta {
            summary: diff_numeric(&snap_a.summary, &snap_b.summary),
            identity: diff_numeric(&snap_a.identity_metrics, &snap_b.identity_metrics),
        }
    }

    fn lock_snapshots(
        &self,
    ) -> std::sync::MutexGuard<'_, LruCache<(u64, u64), TopologySnapshot>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Numeric keys present in both maps become `b − a`.
fn diff_numeric(a: &Value, b: &Value) -> Map<String, Value> {
    let mut delta = Map::new();
    let (Some(a), Some(b)) = (a.as_object(), b.as_object()) else {
        return delta;
    };
    for (key, value) in b {
        let (Some(vb), Some(va)) = (value.as_f64(), a.get(key).and_then(Value::as_f64)) else {
            continue;
        };
        if let Some(number) = serde_json::Number::from_f64(vb - va) {
            delta.insert(key.clone(), Value::Number(number));
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshots_are_cached_and_deltas_numeric() {
        let log = Arc::new(EventLog::in_memory());
        log.append(
            "concept_relate",
            &json!({"from": "identity.continuity", "to": "identity.anchor", "relation": "supports"})
                .to_string(),
            json!({}),
        )
        .unwrap();
        let first_end = log.count();
        log.append(
            "concept_relate",
            &json!({"from": "identity.anchor", "to": "identity.chain", "relation": "supports"})
                .to_string(),
            json!({}),
        )
        .unwrap();
        let second_end = log.count();

        let tracker = GraphEvolutionTracker::new(log.clone(), None, None);
        let snap_a = tracker.snapshot_window(1, first_end);
        assert_eq!(snap_a.summary["node_count"], json!(2));
        let snap_a_again = tracker.snapshot_window(1, first_end);
        assert_eq!(snap_a.summary, snap_a_again.summary);

        let delta = tracker.compare_windows(1, first_end, 1, second_end);
        assert_eq!(delta.summary.get("node_count").and_then(Value::as_f64), Some(1.0));
        assert_eq!(delta.summary.get("edge_count").and_then(Value::as_f64), Some(1.0));
        assert_eq!(
            delta.identity.get("present_identity_nodes").and_then(Value::as_f64),
            Some(1.0)
        );
    }
}
