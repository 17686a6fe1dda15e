//! Claim validation and ledger-derived identity adoption.

use regex::Regex;
use serde_json::{json, Value};

use pmm_core::{canonical_json, EventKind, EventLog, LedgerError};

use crate::markers::Claim;

/// Validate a claim before it is persisted.
///
/// The type must be a lowercase dotted/underscore token, the payload a JSON
/// object. `identity_*` claims additionally need a string `name` or `token`,
/// and a `ref_event` (when present) must resolve in the ledger.
pub fn validate_claim(claim: &Claim, log: &EventLog) -> Result<(), String> {
    let type_re = Regex::new(r"^[a-z][a-z0-9_.]*$").map_err(|e| e.to_string())?;
    if !type_re.is_match(&claim.claim_type) {
        return Err(format!("invalid claim type '{}'", claim.claim_type));
    }
    let Some(data) = claim.data.as_object() else {
        return Err("claim data must be a JSON object".to_string());
    };
    if claim.claim_type.starts_with("identity_") {
        let has_subject = data.get("name").and_then(Value::as_str).is_some()
            || data.get("token").and_then(Value::as_str).is_some();
        if !has_subject {
            return Err("identity claims require a 'name' or 'token'".to_string());
        }
    }
    if let Some(ref_event) = data.get("ref_event") {
        let Some(id) = ref_event.as_u64() else {
            return Err("ref_event must be a positive integer".to_string());
        };
        if !log.exists(id) {
            return Err(format!("ref_event {id} does not exist"));
        }
    }
    Ok(())
}

/// Derive `identity_adoption` events from validated `identity_ratify`
/// claims, idempotently (one adoption per source claim event).
pub fn maybe_append_identity_adoptions(log: &EventLog) -> Result<Vec<u64>, LedgerError> {
    let claims = log.read_by_kind(EventKind::Claim, None, false);
    let adoptions = log.read_by_kind(EventKind::IdentityAdoption, None, false);
    let adopted_sources: Vec<u64> = adoptions
        .iter()
        .filter_map(|e| e.meta_u64("source_claim"))
        .collect();

    let mut appended = Vec::new();
    for claim_event in claims {
        if claim_event.meta_str("claim_type") != Some("identity_ratify") {
            continue;
        }
        if claim_event.meta.get("validated") != Some(&Value::Bool(true)) {
            continue;
        }
        if adopted_sources.contains(&claim_event.id) {
            continue;
        }
        let Some(payload) = claim_event.content.split_once('=').map(|(_, raw)| raw) else {
            continue;
        };
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        let name = data.get("name").and_then(Value::as_str).unwrap_or("");
        let token = data
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or("identity.continuity");

        let content = canonical_json(&json!({
            "name": name,
            "source_claim": claim_event.id,
            "token": token,
        }));
        let id = log.append(
            EventKind::IdentityAdoption.as_str(),
            &content,
            json!({"source": "identity_manager", "source_claim": claim_event.id}),
        )?;
        appended.push(id);
    }
    Ok(appended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    fn claim(claim_type: &str, data: Value) -> Claim {
        Claim { claim_type: claim_type.to_string(), data }
    }

    #[test]
    fn claim_types_must_be_lowercase_tokens() {
        let log = EventLog::in_memory();
        assert!(validate_claim(&claim("identity_ratify", j!({"name": "Echo"})), &log).is_ok());
        assert!(validate_claim(&claim("Bad Type", j!({})), &log).is_err());
        assert!(validate_claim(&claim("", j!({})), &log).is_err());
        assert!(validate_claim(&claim("ok_type", j!("not an object")), &log).is_err());
    }

    #[test]
    fn identity_claims_need_a_subject() {
        let log = EventLog::in_memory();
        assert!(validate_claim(&claim("identity_ratify", j!({})), &log).is_err());
        assert!(validate_claim(&claim("identity_ratify", j!({"token": "identity.anchor"})), &log)
            .is_ok());
    }

    #[test]
    fn ref_event_must_exist() {
        let log = EventLog::in_memory();
        log.append("filler", "x", j!({})).unwrap();
        assert!(validate_claim(&claim("note", j!({"ref_event": 1})), &log).is_ok());
        assert!(validate_claim(&claim("note", j!({"ref_event": 9})), &log).is_err());
        assert!(validate_claim(&claim("note", j!({"ref_event": "one"})), &log).is_err());
    }

    #[test]
    fn adoptions_derive_once_per_ratify_claim() {
        let log = EventLog::in_memory();
        log.append(
            "claim",
            r#"CLAIM:identity_ratify={"name":"Echo","token":"identity.anchor"}"#,
            j!({"claim_type": "identity_ratify", "validated": true}),
        )
        .unwrap();

        let first = maybe_append_identity_adoptions(&log).unwrap();
        assert_eq!(first.len(), 1);
        let second = maybe_append_identity_adoptions(&log).unwrap();
        assert!(second.is_empty(), "idempotent over the ledger");

        let adoption = log.last_of_kind(EventKind::IdentityAdoption).unwrap();
        let data: Value = serde_json::from_str(&adoption.content).unwrap();
        assert_eq!(data["name"], j!("Echo"));
        assert_eq!(data["token"], j!("identity.anchor"));
    }

    #[test]
    fn unvalidated_or_other_claims_are_ignored() {
        let log = EventLog::in_memory();
        log.append(
            "claim",
            r#"CLAIM:identity_proposal={"name":"Echo"}"#,
            j!({"claim_type": "identity_proposal", "validated": true}),
        )
        .unwrap();
        log.append(
            "claim",
            r#"CLAIM:identity_ratify={"name":"Echo"}"#,
            j!({"claim_type": "identity_ratify", "validated": false}),
        )
        .unwrap();
        assert!(maybe_append_identity_adoptions(&log).unwrap().is_empty());
    }
}
