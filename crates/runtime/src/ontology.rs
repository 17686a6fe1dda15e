//! Periodic ontological self-reflection: commitment-metric snapshots at
//! fixed event intervals and insight events derived from comparing the two
//! most recent snapshots.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Map, Value};
use tracing::debug;

use pmm_analysis::CommitmentAnalyzer;
use pmm_core::{canonical_json, EventKind, EventLog, LedgerError};

/// Relative success-rate change that counts as improvement or decline.
const SUCCESS_DELTA_THRESHOLD: f64 = 0.2;
/// Abandonment rate that counts as a spike.
const ABANDONMENT_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct OntologyInsight {
    pub pattern: String,
    pub description: String,
    pub evidence: Vec<u64>,
    pub severity: &'static str,
}

/// Snapshot/insight engine over the commitment analyzer.
pub struct OntologyAutonomy {
    log: Arc<EventLog>,
    analyzer: CommitmentAnalyzer,
    snapshot_interval: u64,
    last_snapshot_at: Mutex<Option<u64>>,
}

impl OntologyAutonomy {
    pub fn new(log: Arc<EventLog>, snapshot_interval: u64) -> Self {
        let last = log
            .last_of_kind(EventKind::OntologySnapshot)
            .and_then(|e| e.content_json())
            .and_then(|data| data.get("at_event").and_then(Value::as_u64));
        Self {
            analyzer: CommitmentAnalyzer::new(log.clone()),
            log,
            snapshot_interval: snapshot_interval.max(1),
            last_snapshot_at: Mutex::new(last),
        }
    }

    /// Emit an `ontology_snapshot` when the interval threshold has been
    /// crossed; anchors snap to interval multiples and never duplicate.
    pub fn maybe_emit_snapshot(&self) -> Result<bool, LedgerError> {
        let current = self.log.count();
        let mut last = self
            .last_snapshot_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let snapshot_at = match *last {
            None => {
                if current < self.snapshot_interval {
                    return Ok(false);
                }
                (current / self.snapshot_interval) * self.snapshot_interval
            }
            Some(prev) => {
                let next = prev + self.snapshot_interval;
                if current < next {
                    return Ok(false);
                }
                next
            }
        };

        let metrics = self.analyzer.compute_metrics();
        let outcomes = self.analyzer.outcome_distribution();
        let durations = self.analyzer.duration_distribution();
        let by_origin = self.analyzer.by_origin();

        let mut origin_map = Map::new();
        for (origin, m) in by_origin {
            origin_map.insert(
                origin,
                json!({
                    "open_count": m.open_count,
                    "closed_count": m.closed_count,
                    "success_rate": m.success_rate,
                }),
            );
        }

        let content = canonical_json(&json!({
            "at_event": snapshot_at,
            "by_origin": origin_map,
            "distributions": {
                "duration": {"fast": durations.fast, "medium": durations.medium, "slow": durations.slow},
                "outcome": {"high": outcomes.high, "partial": outcomes.partial, "low": outcomes.low},
            },
            "metrics": {
                "abandonment_rate": metrics.abandonment_rate,
                "avg_duration_events": metrics.avg_duration_events,
                "closed_count": metrics.closed_count,
                "open_count": metrics.open_count,
                "still_open": metrics.still_open,
                "success_rate": metrics.success_rate,
            },
        }));

        self.log.append(
            EventKind::OntologySnapshot.as_str(),
            &content,
            json!({"source": "ontology_autonomy"}),
        )?;
        *last = Some(snapshot_at);
        debug!(anchor = snapshot_at, "ontology snapshot emitted");
        Ok(true)
    }

    /// Compare the two most recent snapshots for notable commitment
    /// evolution patterns.
    pub fn detect_insights(&self) -> Vec<OntologyInsight> {
        let snapshots = self.log.read_by_kind(EventKind::OntologySnapshot, Some(2), true);
        if snapshots.len() < 2 {
            return Vec::new();
        }
        let Some(current) = snapshots[0].content_json() else { return Vec::new() };
        let Some(previous) = snapshots[1].content_json() else { return Vec::new() };

        let current_anchor = current.get("at_event").and_then(Value::as_u64).unwrap_or(0);
        let previous_anchor = previous.get("at_event").and_then(Value::as_u64).unwrap_or(0);
        let curr_success = metric(&current, "success_rate");
        let prev_success = metric(&previous, "success_rate");

        let mut insights = Vec::new();

        if prev_success > 0.0 && curr_success > prev_success {
            let improvement = (curr_success - prev_success) / prev_success;
            if improvement >= SUCCESS_DELTA_THRESHOLD {
                insights.push(OntologyInsight {
                    pattern: "success_improvement".to_string(),
                    description: format!(
                        "Success rate increased {:.0}% (from {prev_success:.2} to {curr_success:.2})",
                        improvement * 100.0
                    ),
                    evidence: vec![current_anchor, previous_anchor],
                    severity: "positive",
                });
            }
        }

        if prev_success > 0.0 && curr_success < prev_success {
            let decline = (prev_success - curr_success) / prev_success;
            if decline >= SUCCESS_DELTA_THRESHOLD {
                insights.push(OntologyInsight {
                    pattern: "success_decline".to_string(),
                    description: format!(
                        "Success rate decreased {:.0}% (from {prev_success:.2} to {curr_success:.2})",
                        decline * 100.0
                    ),
                    evidence: vec![current_anchor, previous_anchor],
                    severity: "negative",
                });
            }
        }

        let abandonment = metric(&current, "abandonment_rate");
        if abandonment >= ABANDONMENT_THRESHOLD {
            insights.push(OntologyInsight {
                pattern: "abandonment_spike".to_string(),
                description: format!(
                    "High abandonment rate: {:.0}% of commitments still open",
                    abandonment * 100.0
                ),
                evidence: vec![current_anchor],
                severity: "negative",
            });
        }

        insights
    }

    pub fn emit_insights(&self, insights: &[OntologyInsight]) -> Result<(), LedgerError> {
        for insight in insights {
            let content = canonical_json(&json!({
                "description": insight.description,
                "evidence": insight.evidence,
                "pattern": insight.pattern,
                "severity": insight.severity,
            }));
            self.log.append(
                EventKind::OntologyInsight.as_str(),
                &content,
                json!({"source": "ontology_autonomy"}),
            )?;
        }
        Ok(())
    }
}

fn metric(snapshot: &Value, key: &str) -> f64 {
    snapshot
        .get("metrics")
        .and_then(|m| m.get(key))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    fn fill(log: &EventLog, n: usize) {
        for i in 0..n {
            log.append("filler", &format!("e{i}"), j!({})).unwrap();
        }
    }

    #[test]
    fn no_snapshot_before_threshold() {
        let log = Arc::new(EventLog::in_memory());
        fill(&log, 30);
        let autonomy = OntologyAutonomy::new(log.clone(), 50);
        assert!(!autonomy.maybe_emit_snapshot().unwrap());
        assert!(log.read_by_kind(EventKind::OntologySnapshot, None, false).is_empty());
    }

    #[test]
    fn snapshot_at_threshold_carries_metrics() {
        let log = Arc::new(EventLog::in_memory());
        fill(&log, 50);
        let autonomy = OntologyAutonomy::new(log.clone(), 50);
        assert!(autonomy.maybe_emit_snapshot().unwrap());

        let snapshots = log.read_by_kind(EventKind::OntologySnapshot, None, false);
        assert_eq!(snapshots.len(), 1);
        let content = snapshots[0].content_json().unwrap();
        assert_eq!(content["at_event"], j!(50));
        assert!(content["metrics"].is_object());
    }

    #[test]
    fn no_duplicate_snapshots_at_same_anchor() {
        let log = Arc::new(EventLog::in_memory());
        fill(&log, 50);
        let autonomy = OntologyAutonomy::new(log.clone(), 50);
        assert!(autonomy.maybe_emit_snapshot().unwrap());
        assert!(!autonomy.maybe_emit_snapshot().unwrap());
        assert_eq!(log.read_by_kind(EventKind::OntologySnapshot, None, false).len(), 1);
    }

    #[test]
    fn reopening_seeds_last_anchor_from_ledger() {
        let log = Arc::new(EventLog::in_memory());
        fill(&log, 50);
        OntologyAutonomy::new(log.clone(), 50).maybe_emit_snapshot().unwrap();

        // Fresh engine over the same ledger sees the recorded anchor.
        let again = OntologyAutonomy::new(log.clone(), 50);
        assert!(!again.maybe_emit_snapshot().unwrap());
    }

    #[test]
    fn success_improvement_insight_between_snapshots() {
        let log = Arc::new(EventLog::in_memory());
        let autonomy = OntologyAutonomy::new(log.clone(), 50);

        // First window: one close at 0.5.
        log.append("commitment_open", "a", j!({"cid": "a"})).unwrap();
        log.append("commitment_close", "a", j!({"cid": "a", "outcome_score": 0.5})).unwrap();
        fill(&log, 48);
        assert!(autonomy.maybe_emit_snapshot().unwrap());

        // Second window: enough high closes to lift the mean by >= 20%.
        for i in 0..6 {
            let cid = format!("b{i}");
            log.append("commitment_open", &cid, j!({"cid": &cid})).unwrap();
            log.append("commitment_close", &cid, j!({"cid": &cid, "outcome_score": 1.0}))
                .unwrap();
        }
        fill(&log, 40);
        assert!(autonomy.maybe_emit_snapshot().unwrap());

        let insights = autonomy.detect_insights();
        let improvement = insights
            .iter()
            .find(|i| i.pattern == "success_improvement")
            .expect("improvement insight");
        assert_eq!(improvement.severity, "positive");
        assert_eq!(improvement.evidence.len(), 2);

        autonomy.emit_insights(&insights).unwrap();
        let recorded = log.read_by_kind(EventKind::OntologyInsight, None, false);
        assert_eq!(recorded.len(), insights.len());
        assert!(recorded[0].content.contains("success_improvement"));
    }
}
