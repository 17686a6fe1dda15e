use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use pmm_core::{sha256_hex, EventKind, EventLog, LedgerError};

/// Parsed `COMMIT:` payload, either structured JSON or a legacy plain title.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommitment {
    pub title: String,
    pub intended_outcome: String,
    pub criteria: Vec<String>,
}

/// Parsed `CLOSE:` payload. `outcome_score` derives from `criteria_met`
/// (fraction met), defaulting to 1.0 for legacy closes.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedClosure {
    pub cid: String,
    pub actual_outcome: String,
    pub criteria_met: BTreeMap<String, bool>,
    pub outcome_score: f64,
}

/// Parse commitment text, handling both JSON and legacy formats.
pub fn parse_commitment(raw: &str) -> ParsedCommitment {
    let raw = raw.trim();
    if raw.starts_with('{') {
        if let Ok(Value::Object(data)) = serde_json::from_str::<Value>(raw) {
            if let Some(title) = data.get("title").and_then(Value::as_str) {
                let intended = data
                    .get("intended_outcome")
                    .and_then(Value::as_str)
                    .unwrap_or(title);
                let criteria = data
                    .get("criteria")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                return ParsedCommitment {
                    title: title.to_string(),
                    intended_outcome: intended.to_string(),
                    criteria,
                };
            }
        }
    }
    ParsedCommitment {
        title: raw.to_string(),
        intended_outcome: raw.to_string(),
        criteria: Vec::new(),
    }
}

/// Parse closure text, handling both JSON and legacy formats.
pub fn parse_closure(raw: &str) -> ParsedClosure {
    let raw = raw.trim();
    if raw.starts_with('{') {
        if let Ok(Value::Object(data)) = serde_json::from_str::<Value>(raw) {
            if let Some(cid) = data.get("cid").and_then(Value::as_str) {
                let criteria_met: BTreeMap<String, bool> = data
                    .get("criteria_met")
                    .and_then(Value::as_object)
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| (k.clone(), v.as_bool().unwrap_or(false)))
                            .collect()
                    })
                    .unwrap_or_default();
                let outcome_score = if criteria_met.is_empty() {
                    1.0
                } else {
                    criteria_met.values().filter(|met| **met).count() as f64
                        / criteria_met.len() as f64
                };
                return ParsedClosure {
                    cid: cid.to_string(),
                    actual_outcome: data
                        .get("actual_outcome")
                        .and_then(Value::as_str)
                        .unwrap_or("completed")
                        .to_string(),
                    criteria_met,
                    outcome_score,
                };
            }
        }
    }
    ParsedClosure {
        cid: raw.to_string(),
        actual_outcome: "completed".to_string(),
        criteria_met: BTreeMap::new(),
        outcome_score: 1.0,
    }
}

/// Commitment lifecycle writer. Cids are derived deterministically from the
/// title and the next event id, yielding the 8-hex form; closures accept any
/// non-empty token as a cid.
pub struct CommitmentManager {
    log: Arc<EventLog>,
}

impl CommitmentManager {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    /// Open a commitment from raw marker text (JSON or plain title).
    /// Empty text yields no event.
    pub fn open_commitment(&self, text: &str, source: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let parsed = parse_commitment(text);
        self.open_commitment_structured(
            &parsed.title,
            &parsed.intended_outcome,
            &parsed.criteria,
            source,
        )
        .ok()
    }

    pub fn open_commitment_structured(
        &self,
        title: &str,
        intended_outcome: &str,
        criteria: &[String],
        source: &str,
    ) -> Result<String, LedgerError> {
        let next_id = self.log.count() + 1;
        let cid = sha256_hex(&format!("{title}{next_id}"))[..8].to_string();
        self.log.append(
            EventKind::CommitmentOpen.as_str(),
            title,
            json!({
                "cid": cid,
                "source": source,
                "origin": source,
                "intended_outcome": intended_outcome,
                "success_criteria": criteria,
            }),
        )?;
        debug!(%cid, source, "opened commitment");
        Ok(cid)
    }

    /// Apply closure payloads to currently-open cids only; duplicates and
    /// unknown cids are silently skipped. Returns the cids actually closed.
    pub fn apply_closures(&self, raw_closures: &[String], source: &str) -> Vec<String> {
        let mut open = self.open_cids();
        let mut closed = Vec::new();
        for raw in raw_closures {
            let parsed = parse_closure(raw);
            if parsed.cid.is_empty() || !open.contains(&parsed.cid) {
                continue;
            }
            let result = self.close_commitment_structured(
                &parsed.cid,
                &parsed.actual_outcome,
                &parsed.criteria_met,
                source,
            );
            if result.is_ok() {
                open.remove(&parsed.cid);
                closed.push(parsed.cid);
            }
        }
        closed
    }

    pub fn close_commitment_structured(
        &self,
        cid: &str,
        actual_outcome: &str,
        criteria_met: &BTreeMap<String, bool>,
        source: &str,
    ) -> Result<u64, LedgerError> {
        let outcome_score = if criteria_met.is_empty() {
            1.0
        } else {
            criteria_met.values().filter(|met| **met).count() as f64 / criteria_met.len() as f64
        };
        self.log.append(
            EventKind::CommitmentClose.as_str(),
            cid,
            json!({
                "cid": cid,
                "source": source,
                "origin": source,
                "actual_outcome": actual_outcome,
                "criteria_met": criteria_met,
                "outcome_score": outcome_score,
            }),
        )
    }

    /// Currently-open cids: opens minus closes over the whole ledger.
    pub fn open_cids(&self) -> BTreeSet<String> {
        let mut open = BTreeSet::new();
        for event in self.log.read_all() {
            match event.kind {
                EventKind::CommitmentOpen => {
                    if let Some(cid) = event.meta_str("cid") {
                        open.insert(cid.to_string());
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    fn manager() -> (Arc<EventLog>, CommitmentManager) {
        let log = Arc::new(EventLog::in_memory());
        let mgr = CommitmentManager::new(log.clone());
        (log, mgr)
    }

    #[test]
    fn open_commitment_with_structured_fields() {
        let (log, mgr) = manager();
        let cid = mgr
            .open_commitment_structured(
                "Analyze Q1",
                "Summary of trends",
                &["identify_trends".to_string(), "compare_to_Q0".to_string()],
                "assistant",
            )
            .unwrap();
        assert_eq!(cid.len(), 8);
        assert!(cid.chars().all(|c| c.is_ascii_hexdigit()));

        let events = log.read_by_kind(EventKind::CommitmentOpen, None, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].meta_str("intended_outcome"), Some("Summary of trends"));
        assert_eq!(
            events[0].meta.get("success_criteria"),
            Some(&j!(["identify_trends", "compare_to_Q0"]))
        );
        assert_eq!(events[0].meta_str("origin"), Some("assistant"));
    }

    #[test]
    fn close_commitment_with_structured_fields() {
        let (log, mgr) = manager();
        let cid = mgr.open_commitment("Test commitment", "assistant").unwrap();
        let mut met = BTreeMap::new();
        met.insert("identify_trends".to_string(), true);
        mgr.close_commitment_structured(&cid, "Completed successfully", &met, "assistant")
            .unwrap();

        let events = log.read_by_kind(EventKind::CommitmentClose, None, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].meta_str("actual_outcome"), Some("Completed successfully"));
        assert_eq!(events[0].meta_f64("outcome_score"), Some(1.0));
        assert_eq!(events[0].meta.get("criteria_met"), Some(&j!({"identify_trends": true})));
    }

    #[test]
    fn closures_skip_unknown_and_duplicate_cids() {
        let (_log, mgr) = manager();
        let cid = mgr.open_commitment("Ship the report", "assistant").unwrap();
        let closed = mgr.apply_closures(
            &[cid.clone(), cid.clone(), "missing1".to_string()],
            "assistant",
        );
        assert_eq!(closed, vec![cid]);
        assert!(mgr.open_cids().is_empty());
    }

    #[test]
    fn json_closure_computes_outcome_score_from_criteria() {
        let parsed = parse_closure(
            r#"{"cid":"ab12cd34","actual_outcome":"partial","criteria_met":{"a":true,"b":false}}"#,
        );
        assert_eq!(parsed.cid, "ab12cd34");
        assert!((parsed.outcome_score - 0.5).abs() < 1e-9);
        assert_eq!(parsed.actual_outcome, "partial");
    }

    #[test]
    fn legacy_forms_parse_as_plain_title_and_cid() {
        let commit = parse_commitment("Write the summary");
        assert_eq!(commit.title, "Write the summary");
        assert_eq!(commit.intended_outcome, "Write the summary");
        assert!(commit.criteria.is_empty());

        let close = parse_closure("mc_000123");
        assert_eq!(close.cid, "mc_000123");
        assert_eq!(close.outcome_score, 1.0);
    }

    #[test]
    fn json_commit_parses_title_and_criteria() {
        let parsed = parse_commitment(
            r#"{"title":"Analyze Q1","intended_outcome":"Trends","criteria":["a","b"]}"#,
        );
        assert_eq!(parsed.title, "Analyze Q1");
        assert_eq!(parsed.intended_outcome, "Trends");
        assert_eq!(parsed.criteria, vec!["a".to_string(), "b".to_string()]);
    }
}
