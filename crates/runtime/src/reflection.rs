//! Reflection synthesis, periodic summaries, and lifetime memory.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use pmm_core::{canonical_json, Event, EventKind, EventLog, LedgerError};
use pmm_projections::ConceptGraph;

use crate::markers::Claim;

/// Net effect of one turn on the derived self-state.
#[derive(Debug, Clone, Default)]
pub struct TurnDelta {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub failed_claims: Vec<Claim>,
    pub reflect_block: Option<Value>,
}

impl TurnDelta {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
            && self.closed.is_empty()
            && self.failed_claims.is_empty()
            && self.reflect_block.is_none()
    }
}

/// Deterministic reflection text for a non-empty delta.
pub fn build_reflection_text(delta: &TurnDelta) -> Option<String> {
    if delta.is_empty() {
        return None;
    }
    let mut parts = Vec::new();
    if !delta.opened.is_empty() {
        parts.push(format!("opened: {}", delta.opened.join(", ")));
    }
    if !delta.closed.is_empty() {
        parts.push(format!("closed: {}", delta.closed.join(", ")));
    }
    if !delta.failed_claims.is_empty() {
        let types: Vec<&str> = delta
            .failed_claims
            .iter()
            .map(|c| c.claim_type.as_str())
            .collect();
        parts.push(format!("rejected claims: {}", types.join(", ")));
    }
    if let Some(block) = &delta.reflect_block {
        parts.push(format!("reflect: {}", canonical_json(block)));
    }
    Some(format!("Turn delta: {}.", parts.join("; ")))
}

/// Open commitments with their open events, by replaying opens minus closes.
fn open_commitments(log: &EventLog) -> BTreeMap<String, Event> {
    let mut open: BTreeMap<String, Event> = BTreeMap::new();
    for event in log.read_all() {
        match event.kind {
            EventKind::CommitmentOpen => {
                if let Some(cid) = event.meta_str("cid") {
                    open.insert(cid.to_string(), event.clone());
                }
            }
            EventKind::CommitmentClose => {
                if let Some(cid) = event.meta_str("cid") {
                    open.remove(cid);
                }
            }
            _ => {}
        }
    }
    open
}

/// Staleness and auto-close scan plus reflection emission.
///
/// Commitments open for more than `auto_close_threshold` events are closed
/// with a zero outcome score (origin `autonomy_kernel`); those past
/// `staleness_threshold` are named in the reflection text. When `force` is
/// false and neither scan finds anything, no event is appended.
pub fn synthesize_reflection(
    log: &EventLog,
    staleness_threshold: u64,
    auto_close_threshold: u64,
    meta_extra: Map<String, Value>,
    force: bool,
) -> Result<Option<u64>, LedgerError> {
    let current = log.count();
    let open = open_commitments(log);

    let mut stale: Vec<String> = Vec::new();
    let mut expired: Vec<String> = Vec::new();
    for (cid, event) in &open {
        let age = current.saturating_sub(event.id);
        if age > auto_close_threshold {
            expired.push(cid.clone());
        } else if age > staleness_threshold {
            stale.push(cid.clone());
        }
    }

    for cid in &expired {
        log.append(
            EventKind::CommitmentClose.as_str(),
            cid,
            json!({
                "cid": cid,
                "source": "autonomy_kernel",
                "origin": "autonomy_kernel",
                "actual_outcome": "auto_close",
                "criteria_met": {},
                "outcome_score": 0.0,
            }),
        )?;
    }

    if stale.is_empty() && expired.is_empty() && !force {
        return Ok(None);
    }

    let mut text = format!(
        "Commitment scan at event {current}: {} open.",
        open.len().saturating_sub(expired.len())
    );
    if !stale.is_empty() {
        text.push_str(&format!(" Stale (> {staleness_threshold} events): {}.", stale.join(", ")));
    }
    if !expired.is_empty() {
        text.push_str(&format!(
            " Auto-closed (> {auto_close_threshold} events): {}.",
            expired.join(", ")
        ));
    }

    let mut meta = meta_extra;
    meta.entry("about_event".to_string())
        .or_insert_with(|| json!(current));
    let id = log.append(EventKind::Reflection.as_str(), &text, Value::Object(meta))?;
    debug!(reflection = id, stale = stale.len(), expired = expired.len(), "reflection synthesized");
    Ok(Some(id))
}

/// Append a `summary_update` when `interval` events have passed since the
/// last one (or since genesis).
pub fn maybe_append_summary(log: &EventLog, interval: u64) -> Result<Option<u64>, LedgerError> {
    let current = log.count();
    let last = log
        .last_of_kind(EventKind::SummaryUpdate)
        .map(|e| e.id)
        .unwrap_or(0);
    if current < last + interval {
        return Ok(None);
    }
    let open = open_commitments(log);
    let content = canonical_json(&json!({
        "at_event": current,
        "open_commitments": open.len(),
        "since": last,
    }));
    let id = log.append(
        EventKind::SummaryUpdate.as_str(),
        &content,
        json!({"source": "runtime"}),
    )?;
    Ok(Some(id))
}

/// Append a `lifetime_memory` on a long-horizon cadence, summarizing
/// aggregate state and the concept vocabulary.
pub fn maybe_append_lifetime_memory(
    log: &EventLog,
    concept_graph: &ConceptGraph,
    interval: u64,
) -> Result<Option<u64>, LedgerError> {
    let current = log.count();
    let last = log
        .last_of_kind(EventKind::LifetimeMemory)
        .map(|e| e.id)
        .unwrap_or(0);
    if current < last + interval {
        return Ok(None);
    }
    let stats = concept_graph.stats();
    let content = canonical_json(&json!({
        "at_event": current,
        "concepts": stats.concepts,
        "relations": stats.edges,
        "open_commitments": open_commitments(log).len(),
    }));
    let id = log.append(
        EventKind::LifetimeMemory.as_str(),
        &content,
        json!({"source": "runtime"}),
    )?;
    Ok(Some(id))
}

/// Parse `REF: path#id` lines, resolving each against the external ledger
/// and recording whether the reference verified.
pub fn record_inter_ledger_refs(log: &Arc<EventLog>, content: &str) -> Result<(), LedgerError> {
    for (path, event_id) in crate::markers::extract_refs(content) {
        let resolved = EventLog::open(&path)
            .ok()
            .and_then(|target| target.get(event_id));
        match resolved {
            Some(target_event) => {
                log.append(
                    EventKind::InterLedgerRef.as_str(),
                    &format!("REF: {path}#{event_id}"),
                    json!({"target_hash": target_event.hash, "verified": true}),
                )?;
            }
            None => {
                log.append(
                    EventKind::InterLedgerRef.as_str(),
                    &format!("REF: {path}#{event_id}"),
                    json!({"verified": false, "error": "not found"}),
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    #[test]
    fn delta_text_mentions_opens_and_closes() {
        let delta = TurnDelta {
            opened: vec!["ab12cd34".to_string()],
            closed: vec!["cid_xyz".to_string()],
            ..Default::default()
        };
        let text = build_reflection_text(&delta).unwrap();
        assert!(text.contains("ab12cd34"));
        assert!(text.contains("cid_xyz"));
        assert!(build_reflection_text(&TurnDelta::default()).is_none());
    }

    #[test]
    fn quiet_ledger_yields_no_reflection_unless_forced() {
        let log = EventLog::in_memory();
        log.append("user_message", "hi", j!({"role": "user"})).unwrap();
        let none = synthesize_reflection(&log, 20, 50, Map::new(), false).unwrap();
        assert!(none.is_none());

        let forced = synthesize_reflection(&log, 20, 50, Map::new(), true).unwrap();
        assert!(forced.is_some());
        assert_eq!(log.read_by_kind(EventKind::Reflection, None, false).len(), 1);
    }

    #[test]
    fn stale_commitments_are_named_and_expired_ones_closed() {
        let log = EventLog::in_memory();
        log.append("commitment_open", "old work", j!({"cid": "aged0001"})).unwrap();
        for _ in 0..12 {
            log.append("filler", "x", j!({})).unwrap();
        }
        // staleness 5, auto-close 10: commitment age is 12.
        let id = synthesize_reflection(&log, 5, 10, Map::new(), false).unwrap();
        assert!(id.is_some());

        let closes = log.read_by_kind(EventKind::CommitmentClose, None, false);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].meta_str("actual_outcome"), Some("auto_close"));
        assert_eq!(closes[0].meta_f64("outcome_score"), Some(0.0));
        assert_eq!(closes[0].meta_str("origin"), Some("autonomy_kernel"));

        let reflection = log.read_by_kind(EventKind::Reflection, None, false);
        assert!(reflection[0].content.contains("aged0001"));
    }

    #[test]
    fn summary_respects_interval() {
        let log = EventLog::in_memory();
        for _ in 0..5 {
            log.append("filler", "x", j!({})).unwrap();
        }
        assert!(maybe_append_summary(&log, 10).unwrap().is_none());
        for _ in 0..5 {
            log.append("filler", "x", j!({})).unwrap();
        }
        assert!(maybe_append_summary(&log, 10).unwrap().is_some());
        // Immediately after, the interval resets.
        assert!(maybe_append_summary(&log, 10).unwrap().is_none());
    }

    #[test]
    fn lifetime_memory_summarizes_concepts() {
        let log = EventLog::in_memory();
        for _ in 0..4 {
            log.append("filler", "x", j!({})).unwrap();
        }
        let mut cg = ConceptGraph::new();
        cg.rebuild(&log.read_all());
        let id = maybe_append_lifetime_memory(&log, &cg, 3).unwrap();
        assert!(id.is_some());
        let event = log.last_of_kind(EventKind::LifetimeMemory).unwrap();
        assert!(event.content.contains("\"at_event\""));
    }

    #[test]
    fn unresolvable_refs_record_unverified() {
        let log = Arc::new(EventLog::in_memory());
        record_inter_ledger_refs(&log, "REF: /nonexistent/path.redb#3").unwrap();
        let refs = log.read_by_kind(EventKind::InterLedgerRef, None, false);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].meta.get("verified"), Some(&j!(false)));
    }

    #[test]
    fn resolvable_refs_record_target_hash() {
        let dir = tempfile::tempdir().unwrap();
        let other_path = dir.path().join("other.redb");
        let expected_hash = {
            let other = EventLog::open(&other_path).unwrap();
            other.append("filler", "target", j!({})).unwrap();
            other.read_all()[0].hash.clone()
        };

        let log = Arc::new(EventLog::in_memory());
        record_inter_ledger_refs(&log, &format!("REF: {}#1", other_path.display())).unwrap();
        let refs = log.read_by_kind(EventKind::InterLedgerRef, None, false);
        assert_eq!(refs[0].meta.get("verified"), Some(&j!(true)));
        assert_eq!(refs[0].meta_str("target_hash"), Some(expected_hash.as_str()));
    }
}
