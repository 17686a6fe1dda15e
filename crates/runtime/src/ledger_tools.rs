//! Marker-driven ledger read helpers. Both helpers return deterministic JSON
//! payloads with `ok`/`error` fields; failures are payloads, not errors, so
//! the turn can continue with the result injected.

use serde_json::{json, Value};

use pmm_core::EventLog;

use crate::markers::{LedgerFindRequest, LedgerGetRequest};

const GET_MAX_CONTENT_CHARS: usize = 4000;
const FIND_MAX_CONTENT_CHARS: usize = 2000;

fn normalize_entry(event: &pmm_core::Event, include_meta: bool, max_content_chars: usize) -> Value {
    let mut content: String = event.content.chars().take(max_content_chars).collect();
    if event.content.chars().count() > max_content_chars {
        content.push_str("...");
    }
    let mut entry = json!({
        "id": event.id,
        "ts": event.ts,
        "kind": event.kind.as_str(),
        "content": content,
    });
    if include_meta {
        entry["meta"] = Value::Object(event.meta.clone());
    }
    entry
}

/// Single event lookup for the `LEDGER_GET` marker.
pub fn run_ledger_get(log: &EventLog, request: &LedgerGetRequest) -> Value {
    let Some(id) = request.id.as_i64() else {
        return json!({"ok": false, "id": null, "entry": null, "error": "invalid event id"});
    };
    if id < 1 {
        return json!({"ok": false, "id": id, "entry": null, "error": "event id must be >= 1"});
    }
    match log.get(id as u64) {
        Some(event) => json!({
            "ok": true,
            "id": id,
            "entry": normalize_entry(&event, true, GET_MAX_CONTENT_CHARS),
            "error": null,
        }),
        None => json!({"ok": false, "id": id, "entry": null, "error": "event not found"}),
    }
}

/// Filtered search for the `LEDGER_FIND` marker.
pub fn run_ledger_find(log: &EventLog, request: &LedgerFindRequest) -> Value {
    let limit = request
        .limit
        .as_ref()
        .and_then(Value::as_i64)
        .unwrap_or(20)
        .clamp(1, 50) as usize;
    let query = request.query.clone().unwrap_or_default();
    let kind = request.kind.clone().unwrap_or_default();

    let base = |error: &str| {
        json!({
            "ok": false,
            "query": query.trim(),
            "kind": kind.trim(),
            "from_id": request.from_id.as_ref().and_then(Value::as_i64),
            "to_id": request.to_id.as_ref().and_then(Value::as_i64),
            "limit": limit,
            "total_hits": 0,
            "entries": [],
            "error": error,
        })
    };

    let from_id = match &request.from_id {
        None => None,
        Some(v) => match v.as_i64() {
            Some(n) => Some(n),
            None => return base("invalid from_id"),
        },
    };
    let to_id = match &request.to_id {
        None => None,
        Some(v) => match v.as_i64() {
            Some(n) => Some(n),
            None => return base("invalid to_id"),
        },
    };
    if matches!(from_id, Some(n) if n < 1) {
        return base("from_id must be >= 1");
    }
    if matches!(to_id, Some(n) if n < 1) {
        return base("to_id must be >= 1");
    }
    if let (Some(from), Some(to)) = (from_id, to_id) {
        if from > to {
            return base("from_id must be <= to_id");
        }
    }

    let events = log.find_entries(
        if query.trim().is_empty() { None } else { Some(query.trim()) },
        if kind.trim().is_empty() { None } else { Some(kind.trim()) },
        from_id.map(|n| n as u64),
        to_id.map(|n| n as u64),
        limit,
    );
    let entries: Vec<Value> = events
        .iter()
        .map(|e| normalize_entry(e, true, FIND_MAX_CONTENT_CHARS))
        .collect();

    json!({
        "ok": true,
        "query": query.trim(),
        "kind": kind.trim(),
        "from_id": from_id,
        "to_id": to_id,
        "limit": limit,
        "total_hits": entries.len(),
        "entries": entries,
        "error": null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    fn sample_log() -> EventLog {
        let log = EventLog::in_memory();
        log.append("claim", "identity coherence improved", j!({})).unwrap();
        log.append("assistant_message", "noted", j!({"role": "assistant"})).unwrap();
        log
    }

    #[test]
    fn get_returns_entry_for_valid_id() {
        let log = sample_log();
        let payload = run_ledger_get(&log, &LedgerGetRequest { id: j!(1) });
        assert_eq!(payload["ok"], j!(true));
        assert_eq!(payload["id"], j!(1));
        assert_eq!(payload["entry"]["kind"], j!("claim"));
        assert!(payload["entry"]["meta"].is_object());
    }

    #[test]
    fn get_rejects_invalid_and_missing_ids() {
        let log = sample_log();
        let bad = run_ledger_get(&log, &LedgerGetRequest { id: j!("abc") });
        assert_eq!(bad["ok"], j!(false));
        assert_eq!(bad["error"], j!("invalid event id"));

        let zero = run_ledger_get(&log, &LedgerGetRequest { id: j!(0) });
        assert_eq!(zero["error"], j!("event id must be >= 1"));

        let missing = run_ledger_get(&log, &LedgerGetRequest { id: j!(99) });
        assert_eq!(missing["error"], j!("event not found"));
    }

    #[test]
    fn get_truncates_long_content() {
        let log = EventLog::in_memory();
        log.append("assistant_message", &"x".repeat(5000), j!({})).unwrap();
        let payload = run_ledger_get(&log, &LedgerGetRequest { id: j!(1) });
        let content = payload["entry"]["content"].as_str().unwrap();
        assert!(content.ends_with("..."));
        assert!(content.chars().count() <= 4003);
    }

    #[test]
    fn find_filters_by_query_and_kind() {
        let log = sample_log();
        let request = LedgerFindRequest {
            query: Some("identity".to_string()),
            kind: Some("claim".to_string()),
            limit: Some(j!(5)),
            ..Default::default()
        };
        let payload = run_ledger_find(&log, &request);
        assert_eq!(payload["ok"], j!(true));
        assert_eq!(payload["total_hits"], j!(1));
        assert_eq!(payload["entries"][0]["kind"], j!("claim"));
    }

    #[test]
    fn find_rejects_inverted_and_invalid_ranges() {
        let log = sample_log();
        let inverted = LedgerFindRequest {
            from_id: Some(j!(10)),
            to_id: Some(j!(2)),
            ..Default::default()
        };
        let payload = run_ledger_find(&log, &inverted);
        assert_eq!(payload["error"], j!("from_id must be <= to_id"));

        let invalid = LedgerFindRequest {
            from_id: Some(j!("nope")),
            ..Default::default()
        };
        let payload = run_ledger_find(&log, &invalid);
        assert_eq!(payload["error"], j!("invalid from_id"));

        let below = LedgerFindRequest {
            from_id: Some(j!(0)),
            ..Default::default()
        };
        let payload = run_ledger_find(&log, &below);
        assert_eq!(payload["error"], j!("from_id must be >= 1"));
    }

    #[test]
    fn find_without_query_returns_recent_entries() {
        let log = sample_log();
        let payload = run_ledger_find(&log, &LedgerFindRequest::default());
        assert_eq!(payload["ok"], j!(true));
        assert_eq!(payload["total_hits"], j!(2));
        assert_eq!(payload["entries"][0]["id"], j!(2), "recency-first");
    }
}
