//! Deterministic marker extraction from model replies.
//!
//! Recognizers are keyed by exact line prefix; the two LEDGER tools also
//! accept an XML `<invoke>` shell, a bracketed `[TOOL_CALL]` shell, and a
//! canonical `{"tool": ..., "arguments": ...}` JSON shell. Each recognizer
//! returns a typed request or nothing; no heuristics beyond that.

use regex::Regex;
use serde_json::{Map, Value};

/// A `CLAIM:<type>=<json>` line.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub claim_type: String,
    pub data: Value,
}

/// A `WEB:` tool request.
#[derive(Debug, Clone, PartialEq)]
pub struct WebRequest {
    pub query: String,
    pub provider: Option<String>,
    pub limit: Option<u64>,
}

/// A `LEDGER_GET` request; `id` stays raw so the tool layer can report
/// invalid forms uniformly.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerGetRequest {
    pub id: Value,
}

/// A `LEDGER_FIND` request with raw-valued filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerFindRequest {
    pub query: Option<String>,
    pub kind: Option<String>,
    pub from_id: Option<Value>,
    pub to_id: Option<Value>,
    pub limit: Option<Value>,
}

/// Outcome of scanning a reply for a ledger tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolAttempt {
    Get(LedgerGetRequest),
    Find(LedgerFindRequest),
    /// A recognizable attempt with a protocol error (wrong parameter name,
    /// unknown tool tag). Triggers a `[TOOL_PROTOCOL_ERROR]` re-prompt.
    Malformed { tool: String, reason: String },
}

/// Commitment texts for exact `COMMIT:` prefix lines.
pub fn extract_commitments(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.strip_prefix("COMMIT:"))
        .map(|rest| rest.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Closure payloads for exact `CLOSE:` prefix lines.
pub fn extract_closures(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.strip_prefix("CLOSE:"))
        .map(|rest| rest.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `(type, data)` pairs for `CLAIM:<type>=<json>` lines.
/// Any invalid claim line invalidates the whole batch, keeping the turn
/// robust against half-structured replies.
pub fn extract_claims(text: &str) -> Result<Vec<Claim>, String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("CLAIM:") else { continue };
        let Some((claim_type, raw)) = rest.split_once('=') else {
            return Err(format!("claim line missing '=': {line}"));
        };
        let data: Value = serde_json::from_str(raw.trim())
            .map_err(|e| format!("claim payload is not JSON: {e}"))?;
        out.push(Claim { claim_type: claim_type.trim().to_string(), data });
    }
    Ok(out)
}

/// Parsed JSON object from the first `REFLECT:` line; non-objects rejected.
pub fn extract_reflect(text: &str) -> Option<Value> {
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("REFLECT:") else { continue };
        return match serde_json::from_str::<Value>(rest) {
            Ok(value) if value.is_object() => Some(value),
            _ => None,
        };
    }
    None
}

/// `path#id` pairs from `REF: ` lines (or a JSON `{"refs": [...]}` body).
pub fn extract_refs(content: &str) -> Vec<(String, u64)> {
    let mut refs: Vec<String> = Vec::new();
    if let Ok(Value::Object(data)) = serde_json::from_str::<Value>(content) {
        if let Some(list) = data.get("refs").and_then(Value::as_array) {
            refs = list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }
    if refs.is_empty() {
        refs = content
            .lines()
            .filter_map(|line| line.strip_prefix("REF: "))
            .map(|rest| rest.trim().to_string())
            .collect();
    }

    refs.into_iter()
        .filter_map(|r| {
            let (path, id) = r.split_once('#')?;
            let id = id.trim().parse::<u64>().ok()?;
            Some((path.to_string(), id))
        })
        .collect()
}

/// `WEB:` request: JSON dict with `query`/`provider`/`limit`, or a bare
/// query string.
pub fn extract_web_request(text: &str) -> Option<WebRequest> {
    for line in text.lines() {
        let Some(payload) = line.trim().strip_prefix("WEB:") else { continue };
        let payload = payload.trim();
        if payload.is_empty() {
            continue;
        }
        if let Ok(Value::Object(data)) = serde_json::from_str::<Value>(payload) {
            return Some(WebRequest {
                query: data
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                provider: data.get("provider").and_then(Value::as_str).map(str::to_string),
                limit: data.get("limit").and_then(Value::as_u64),
            });
        }
        return Some(WebRequest { query: payload.to_string(), provider: None, limit: None });
    }
    None
}

/// Scan a reply for a LEDGER_GET / LEDGER_FIND invocation in any accepted
/// shell. GET takes precedence over FIND; the first recognized shell wins.
pub fn extract_ledger_tool(text: &str) -> Option<ToolAttempt> {
    if let Some(attempt) = line_prefix_get(text) {
        return Some(attempt);
    }
    if let Some(attempt) = line_prefix_find(text) {
        return Some(attempt);
    }
    if let Some(attempt) = canonical_json_tool(text) {
        return Some(attempt);
    }
    if let Some(attempt) = bracket_tool(text) {
        return Some(attempt);
    }
    if let Some(attempt) = xml_invoke_get(text) {
        return Some(attempt);
    }
    if let Some(attempt) = xml_invoke_find(text) {
        return Some(attempt);
    }
    bare_json_find(text)
}

fn line_prefix_get(text: &str) -> Option<ToolAttempt> {
    for line in text.lines() {
        let Some(payload) = line.trim().strip_prefix("LEDGER_GET:") else { continue };
        let payload = payload.trim();
        if payload.is_empty() {
            continue;
        }
        if let Ok(Value::Object(data)) = serde_json::from_str::<Value>(payload) {
            return Some(get_from_args(&data));
        }
        let id = payload
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(payload.to_string()));
        return Some(ToolAttempt::Get(LedgerGetRequest { id }));
    }
    None
}

fn line_prefix_find(text: &str) -> Option<ToolAttempt> {
    for line in text.lines() {
        let Some(payload) = line.trim().strip_prefix("LEDGER_FIND:") else { continue };
        let payload = payload.trim();
        if payload.is_empty() {
            continue;
        }
        if let Ok(Value::Object(data)) = serde_json::from_str::<Value>(payload) {
            return Some(ToolAttempt::Find(find_from_args(&data)));
        }
        return Some(ToolAttempt::Find(LedgerFindRequest {
            query: Some(payload.to_string()),
            ..Default::default()
        }));
    }
    None
}

/// Canonical `{"tool":"ledger_get"|"ledger_find","arguments":{…}}` on any line.
fn canonical_json_tool(text: &str) -> Option<ToolAttempt> {
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(line) else { continue };
        let Some(tool) = data.get("tool").and_then(Value::as_str) else { continue };
        let args = data
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        return Some(match tool {
            "ledger_get" => get_from_args(&args),
            "ledger_find" => ToolAttempt::Find(find_from_args(&args)),
            other => ToolAttempt::Malformed {
                tool: other.to_string(),
                reason: format!("unknown tool '{other}'"),
            },
        });
    }
    None
}

/// Bracketed shell: `[TOOL_CALL] {tool => "LEDGER_GET", args => { --id 1 }}`.
fn bracket_tool(text: &str) -> Option<ToolAttempt> {
    if !text.contains("[TOOL_CALL]") {
        return None;
    }
    let tool_re = Regex::new(r#"\{\s*tool\s*=>\s*"(LEDGER_GET|LEDGER_FIND)""#).ok()?;
    let tool = tool_re.captures(text)?.get(1)?.as_str().to_string();

    let arg_re = Regex::new(r#"--(\w+)\s+"?([^\n"]*)"?"#).ok()?;
    let mut args = Map::new();
    for captures in arg_re.captures_iter(text) {
        let key = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        let raw = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        let value = raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        args.insert(key.to_string(), value);
    }

    Some(match tool.as_str() {
        "LEDGER_GET" => get_from_args(&args),
        _ => ToolAttempt::Find(find_from_args(&args)),
    })
}

fn xml_invoke_get(text: &str) -> Option<ToolAttempt> {
    if !text.contains("LEDGER_GET") {
        return None;
    }
    let id_re = Regex::new(
        r#"(?s)<invoke\s+name="LEDGER_GET".*?<parameter\s+name="id">\s*([^<]+?)\s*</parameter>"#,
    )
    .ok()?;
    if let Some(captures) = id_re.captures(text) {
        let raw = captures.get(1)?.as_str().trim();
        let id = raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        return Some(ToolAttempt::Get(LedgerGetRequest { id }));
    }
    // An invoke block without the `id` parameter is a protocol error.
    let invoke_re = Regex::new(r#"<invoke\s+name="LEDGER_GET""#).ok()?;
    if invoke_re.is_match(text) {
        return Some(ToolAttempt::Malformed {
            tool: "LEDGER_GET".to_string(),
            reason: "missing required parameter 'id'".to_string(),
        });
    }
    None
}

fn xml_invoke_find(text: &str) -> Option<ToolAttempt> {
    if !text.contains("LEDGER_FIND") {
        return None;
    }
    let mut request = LedgerFindRequest::default();
    let mut any = false;
    for key in ["query", "kind", "from_id", "to_id", "limit"] {
        let pattern = format!(
            r#"(?s)<invoke\s+name="LEDGER_FIND".*?<parameter\s+name="{key}">\s*([^<]+?)\s*</parameter>"#
        );
        let re = Regex::new(&pattern).ok()?;
        let Some(captures) = re.captures(text) else { continue };
        let raw = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        any = true;
        match key {
            "query" => request.query = Some(raw.to_string()),
            "kind" => request.kind = Some(raw.to_string()),
            "from_id" => request.from_id = Some(parse_raw(raw)),
            "to_id" => request.to_id = Some(parse_raw(raw)),
            "limit" => request.limit = Some(parse_raw(raw)),
            _ => {}
        }
    }
    any.then_some(ToolAttempt::Find(request))
}

/// Bare-JSON FIND fallback: a line that is a JSON object carrying only
/// find-shaped filters (no `tool`, no `id`).
fn bare_json_find(text: &str) -> Option<ToolAttempt> {
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(line) else { continue };
        if data.contains_key("tool") || data.contains_key("id") || data.contains_key("event_id") {
            continue;
        }
        let find_keys = ["query", "kind", "from_id", "to_id", "limit"];
        if data.keys().any(|k| find_keys.contains(&k.as_str())) {
            return Some(ToolAttempt::Find(find_from_args(&data)));
        }
    }
    None
}

fn get_from_args(args: &Map<String, Value>) -> ToolAttempt {
    if let Some(id) = args.get("id") {
        return ToolAttempt::Get(LedgerGetRequest { id: id.clone() });
    }
    if args.contains_key("event_id") {
        return ToolAttempt::Malformed {
            tool: "LEDGER_GET".to_string(),
            reason: "wrong parameter name 'event_id'; use 'id'".to_string(),
        };
    }
    ToolAttempt::Malformed {
        tool: "LEDGER_GET".to_string(),
        reason: "missing required parameter 'id'".to_string(),
    }
}

fn find_from_args(args: &Map<String, Value>) -> LedgerFindRequest {
    LedgerFindRequest {
        query: args.get("query").and_then(Value::as_str).map(str::to_string),
        kind: args.get("kind").and_then(Value::as_str).map(str::to_string),
        from_id: args.get("from_id").cloned(),
        to_id: args.get("to_id").cloned(),
        limit: args.get("limit").cloned(),
    }
}

fn parse_raw(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// True when the user input reads like a ledger lookup, warranting a
/// `[TOOL_HINT]` block on the prompt.
pub fn detect_lookup_intent(user_input: &str) -> bool {
    let lower = user_input.to_lowercase();
    if lower.contains("inspect") || lower.contains("ledger") {
        return true;
    }
    let range = Regex::new(r"\d+\s*\.\.\s*\d+");
    if matches!(&range, Ok(re) if re.is_match(&lower)) {
        return true;
    }
    let event_ref = Regex::new(r"\bevents?\s+\d");
    matches!(&event_ref, Ok(re) if re.is_match(&lower))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_and_close_lines_extract_exactly() {
        let text = "prose\nCOMMIT: Analyze Q1\nCLOSE: cid_xyz\n COMMIT: not this (indented)";
        assert_eq!(extract_commitments(text), vec!["Analyze Q1"]);
        assert_eq!(extract_closures(text), vec!["cid_xyz"]);
    }

    #[test]
    fn claims_parse_type_and_json() {
        let claims = extract_claims(r#"CLAIM:identity_ratify={"name":"Echo"}"#).unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].claim_type, "identity_ratify");
        assert_eq!(claims[0].data, json!({"name": "Echo"}));

        assert!(extract_claims("CLAIM:bad_no_equals").is_err());
        assert!(extract_claims("CLAIM:t=not json").is_err());
    }

    #[test]
    fn reflect_takes_first_object_line_only() {
        let text = "REFLECT:{\"theme\":\"focus\"}\nREFLECT:{\"theme\":\"second\"}";
        assert_eq!(extract_reflect(text), Some(json!({"theme": "focus"})));
        assert_eq!(extract_reflect("REFLECT:\"just a string\""), None);
    }

    #[test]
    fn refs_parse_path_and_id() {
        let refs = extract_refs("REF: /tmp/other.redb#12\nREF: bad-no-hash\nREF: x#notint");
        assert_eq!(refs, vec![("/tmp/other.redb".to_string(), 12)]);
    }

    #[test]
    fn web_request_accepts_json_and_bare_query() {
        let json_form = extract_web_request(r#"WEB: {"query":"rust ledgers","limit":3}"#).unwrap();
        assert_eq!(json_form.query, "rust ledgers");
        assert_eq!(json_form.limit, Some(3));

        let bare = extract_web_request("WEB: plain search terms").unwrap();
        assert_eq!(bare.query, "plain search terms");
        assert!(bare.provider.is_none());
    }

    #[test]
    fn ledger_get_line_prefix_and_int_fallback() {
        match extract_ledger_tool("Need evidence\nLEDGER_GET: {\"id\": 1}") {
            Some(ToolAttempt::Get(req)) => assert_eq!(req.id, json!(1)),
            other => panic!("expected get, got {other:?}"),
        }
        match extract_ledger_tool("LEDGER_GET: 7") {
            Some(ToolAttempt::Get(req)) => assert_eq!(req.id, json!(7)),
            other => panic!("expected get, got {other:?}"),
        }
    }

    #[test]
    fn ledger_find_line_prefix_and_bare_query() {
        match extract_ledger_tool(r#"LEDGER_FIND: {"query":"identity","kind":"claim","limit":5}"#) {
            Some(ToolAttempt::Find(req)) => {
                assert_eq!(req.query.as_deref(), Some("identity"));
                assert_eq!(req.kind.as_deref(), Some("claim"));
                assert_eq!(req.limit, Some(json!(5)));
            }
            other => panic!("expected find, got {other:?}"),
        }
        match extract_ledger_tool("LEDGER_FIND: free text query") {
            Some(ToolAttempt::Find(req)) => {
                assert_eq!(req.query.as_deref(), Some("free text query"))
            }
            other => panic!("expected find, got {other:?}"),
        }
    }

    #[test]
    fn xml_invoke_shells_parse() {
        let get = "<minimax:tool_call>\n<invoke name=\"LEDGER_GET\">\n<parameter name=\"id\">1</parameter>\n</invoke>\n</minimax:tool_call>";
        match extract_ledger_tool(get) {
            Some(ToolAttempt::Get(req)) => assert_eq!(req.id, json!(1)),
            other => panic!("expected get, got {other:?}"),
        }

        let find = "<invoke name=\"LEDGER_FIND\">\n<parameter name=\"query\">identity</parameter>\n<parameter name=\"kind\">claim</parameter>\n<parameter name=\"limit\">5</parameter>\n</invoke>";
        match extract_ledger_tool(find) {
            Some(ToolAttempt::Find(req)) => {
                assert_eq!(req.query.as_deref(), Some("identity"));
                assert_eq!(req.limit, Some(json!(5)));
            }
            other => panic!("expected find, got {other:?}"),
        }
    }

    #[test]
    fn bracket_shells_parse_and_flag_wrong_parameter() {
        let get = "[TOOL_CALL]\n{tool => \"LEDGER_GET\", args => {\n  --id 1\n}}\n[/TOOL_CALL]";
        match extract_ledger_tool(get) {
            Some(ToolAttempt::Get(req)) => assert_eq!(req.id, json!(1)),
            other => panic!("expected get, got {other:?}"),
        }

        let bad = "[TOOL_CALL]\n{tool => \"LEDGER_GET\", args => {\n  --event_id 1\n}}\n[/TOOL_CALL]";
        match extract_ledger_tool(bad) {
            Some(ToolAttempt::Malformed { tool, reason }) => {
                assert_eq!(tool, "LEDGER_GET");
                assert!(reason.contains("event_id"));
            }
            other => panic!("expected malformed, got {other:?}"),
        }

        let find = "[TOOL_CALL]\n{tool => \"LEDGER_FIND\", args => {\n  --query \"identity\"\n  --kind \"claim\"\n  --from_id 1\n  --to_id 100\n  --limit 5\n}}\n[/TOOL_CALL]";
        match extract_ledger_tool(find) {
            Some(ToolAttempt::Find(req)) => {
                assert_eq!(req.query.as_deref(), Some("identity"));
                assert_eq!(req.from_id, Some(json!(1)));
                assert_eq!(req.to_id, Some(json!(100)));
            }
            other => panic!("expected find, got {other:?}"),
        }
    }

    #[test]
    fn canonical_json_shells_parse_and_flag_event_id() {
        match extract_ledger_tool(r#"{"tool":"ledger_get","arguments":{"id":1}}"#) {
            Some(ToolAttempt::Get(req)) => assert_eq!(req.id, json!(1)),
            other => panic!("expected get, got {other:?}"),
        }
        match extract_ledger_tool(r#"{"tool":"ledger_get","arguments":{"event_id":1}}"#) {
            Some(ToolAttempt::Malformed { .. }) => {}
            other => panic!("expected malformed, got {other:?}"),
        }
        match extract_ledger_tool(
            r#"{"tool":"ledger_find","arguments":{"query":"identity","kind":"claim","from_id":1,"to_id":1000,"limit":5}}"#,
        ) {
            Some(ToolAttempt::Find(req)) => assert_eq!(req.kind.as_deref(), Some("claim")),
            other => panic!("expected find, got {other:?}"),
        }
    }

    #[test]
    fn bare_json_find_fallback_parses_filters() {
        match extract_ledger_tool(r#"{"query":"","from_id":1,"to_id":50,"limit":3}"#) {
            Some(ToolAttempt::Find(req)) => {
                assert_eq!(req.query.as_deref(), Some(""));
                assert_eq!(req.from_id, Some(json!(1)));
            }
            other => panic!("expected find, got {other:?}"),
        }
        assert_eq!(extract_ledger_tool("plain prose, no tools here"), None);
    }

    #[test]
    fn lookup_intent_detection() {
        assert!(detect_lookup_intent("inspect events 10..20"));
        assert!(detect_lookup_intent("inspect 35170..35289"));
        assert!(detect_lookup_intent("show me event 1"));
        assert!(!detect_lookup_intent("how are you today"));
    }
}
