//! Exec bindings: commitments can carry `exec: <command>` lines which are
//! recorded as `config {type:"exec_bind"}` events; the router turns each
//! open bind into exactly one internal goal.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use pmm_core::{canonical_json, EventKind, EventLog, LedgerError};

/// Parse `exec:` lines from commitment text and record a bind per command.
pub fn extract_exec_binds(
    log: &EventLog,
    commitment_text: &str,
    cid: &str,
) -> Result<Vec<u64>, LedgerError> {
    let mut appended = Vec::new();
    for line in commitment_text.lines() {
        let trimmed = line.trim();
        let Some(command) = trimmed
            .strip_prefix("exec:")
            .or_else(|| trimmed.strip_prefix("EXEC:"))
        else {
            continue;
        };
        let command = command.trim();
        if command.is_empty() {
            continue;
        }
        let content = canonical_json(&json!({
            "cid": cid,
            "command": command,
            "type": "exec_bind",
        }));
        let id = log.append(
            EventKind::Config.as_str(),
            &content,
            json!({"source": "runtime", "cid": cid}),
        )?;
        appended.push(id);
    }
    Ok(appended)
}

/// Routes exec binds to internal goals. `tick` is idempotent over the
/// ledger: each bound cid yields at most one `internal_goal_created`.
pub struct ExecBindRouter {
    log: Arc<EventLog>,
}

impl ExecBindRouter {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    pub fn tick(&self) -> Result<Vec<u64>, LedgerError> {
        let events = self.log.read_all();

        let mut open: Vec<&str> = Vec::new();
        for event in &events {
            match event.kind {
                EventKind::CommitmentOpen => {
                    if let Some(cid) = event.meta_str("cid") {
                        open.push(cid);
                    }
                }
                EventKind::CommitmentClose => {
                    if let Some(cid) = event.meta_str("cid") {
                        open.retain(|c| *c != cid);
                    }
                }
                _ => {}
            }
        }

        let routed: Vec<Option<String>> = events
            .iter()
            .filter(|e| e.kind == EventKind::InternalGoalCreated)
            .map(|e| e.meta_str("cid").map(str::to_string))
            .collect();

        let mut appended = Vec::new();
        for event in &events {
            if event.kind != EventKind::Config {
                continue;
            }
            let Some(data) = event.content_json() else { continue };
            if data.get("type").and_then(Value::as_str) != Some("exec_bind") {
                continue;
            }
            let Some(cid) = data.get("cid").and_then(Value::as_str) else { continue };
            if !open.contains(&cid) {
                continue;
            }
            if routed.iter().any(|r| r.as_deref() == Some(cid)) {
                continue;
            }
            let command = data.get("command").and_then(Value::as_str).unwrap_or("");
            let content = canonical_json(&json!({"cid": cid, "command": command}));
            let id = self.log.append(
                EventKind::InternalGoalCreated.as_str(),
                &content,
                json!({"source": "exec_router", "cid": cid}),
            )?;
            debug!(%cid, goal = id, "exec bind routed to internal goal");
            appended.push(id);
        }
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    #[test]
    fn exec_lines_create_bind_configs() {
        let log = EventLog::in_memory();
        let binds = extract_exec_binds(
            &log,
            "Ship the tool\nexec: cargo build --release\nmore prose",
            "ab12cd34",
        )
        .unwrap();
        assert_eq!(binds.len(), 1);
        assert!(log.has_exec_bind("ab12cd34"));
    }

    #[test]
    fn plain_commitments_create_no_binds() {
        let log = EventLog::in_memory();
        let binds = extract_exec_binds(&log, "Just think about it", "ab12cd34").unwrap();
        assert!(binds.is_empty());
        assert!(!log.has_exec_bind("ab12cd34"));
    }

    #[test]
    fn router_tick_is_idempotent_and_respects_open_state() {
        let log = Arc::new(EventLog::in_memory());
        log.append("commitment_open", "run it", j!({"cid": "aa11bb22"})).unwrap();
        extract_exec_binds(&log, "exec: echo hi", "aa11bb22").unwrap();

        let router = ExecBindRouter::new(log.clone());
        let first = router.tick().unwrap();
        assert_eq!(first.len(), 1);
        let second = router.tick().unwrap();
        assert!(second.is_empty(), "one goal per bind");

        // Closing the commitment stops further routing for that cid.
        log.append("commitment_close", "aa11bb22", j!({"cid": "aa11bb22"})).unwrap();
        extract_exec_binds(&log, "exec: echo again", "aa11bb22").unwrap();
        assert!(router.tick().unwrap().is_empty());
    }
}
