use std::collections::BTreeMap;

use serde_json::{Map, Value};

use pmm_core::{Event, EventKind};

/// Current self-state view: open commitments, last adopted identity, the
/// active retrieval config, and aggregate counters.
///
/// Invariant: the open-cid set equals `{opens.cid} − {closes.cid}` over the
/// whole ledger; the retrieval config is the last `config` event whose parsed
/// content has `type == "retrieval"`.
#[derive(Debug, Default, Clone)]
pub struct Mirror {
    open_commitments: BTreeMap<String, Event>,
    last_identity: Option<Event>,
    retrieval_config: Option<Map<String, Value>>,
    kind_counts: BTreeMap<String, u64>,
    events_seen: u64,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&mut self, events: &[Event]) {
        *self = Self::default();
        for event in events {
            self.sync(event);
        }
    }

    pub fn sync(&mut self, event: &Event) {
        self.events_seen += 1;
        *self
            .kind_counts
            .entry(event.kind.as_str().to_string())
            .or_insert(0) += 1;

        match event.kind {
            EventKind::CommitmentOpen => {
                if let Some(cid) = event.meta_str("cid") {
                    self.open_commitments.insert(cid.to_string(), event.clone());
                }
            }
            EventKind::CommitmentClose => {
                if let Some(cid) = event.meta_str("cid") {
                    self.open_commitments.remove(cid);
                }
            }
            EventKind::IdentityAdoption => {
                self.last_identity = Some(event.clone());
            }
            EventKind::Config => {
                if let Some(Value::Object(data)) = event.content_json() {
                    if data.get("type").and_then(Value::as_str) == Some("retrieval") {
                        self.retrieval_config = Some(data);
                    }
                }
            }
            _ => {}
        }
    }

    /// Open commitments ordered by open-event id.
    pub fn get_open_commitment_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.open_commitments.values().cloned().collect();
        events.sort_by_key(|e| e.id);
        events
    }

    pub fn open_cids(&self) -> Vec<String> {
        self.open_commitments.keys().cloned().collect()
    }

    pub fn is_open(&self, cid: &str) -> bool {
        self.open_commitments.contains_key(cid)
    }

    pub fn last_identity(&self) -> Option<&Event> {
        self.last_identity.as_ref()
    }

    pub fn current_retrieval_config(&self) -> Option<&Map<String, Value>> {
        self.retrieval_config.as_ref()
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    pub fn count_of(&self, kind: EventKind) -> u64 {
        self.kind_counts.get(kind.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm_core::EventLog;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn open_set_is_opens_minus_closes() {
        let log = EventLog::in_memory();
        log.append("commitment_open", "a", json!({"cid": "aa11"})).unwrap();
        log.append("commitment_open", "b", json!({"cid": "bb22"})).unwrap();
        log.append("commitment_close", "aa11", json!({"cid": "aa11"})).unwrap();

        let mut mirror = Mirror::new();
        mirror.rebuild(&log.read_all());

        let expected: BTreeSet<String> = ["bb22".to_string()].into_iter().collect();
        let actual: BTreeSet<String> = mirror.open_cids().into_iter().collect();
        assert_eq!(actual, expected);
        assert!(mirror.is_open("bb22"));
        assert!(!mirror.is_open("aa11"));
    }

    #[test]
    fn retrieval_config_tracks_last_retrieval_typed_config() {
        let log = EventLog::in_memory();
        log.append(
            "config",
            r#"{"type":"retrieval","strategy":"fixed","limit":10}"#,
            json!({"source": "runtime"}),
        )
        .unwrap();
        log.append(
            "config",
            r#"{"type":"policy","forbid_sources":{}}"#,
            json!({"source": "runtime"}),
        )
        .unwrap();
        log.append(
            "config",
            r#"{"type":"retrieval","strategy":"vector","limit":5,"model":"hash64","dims":64}"#,
            json!({"source": "runtime"}),
        )
        .unwrap();

        let mut mirror = Mirror::new();
        mirror.rebuild(&log.read_all());
        let cfg = mirror.current_retrieval_config().expect("retrieval config");
        assert_eq!(cfg.get("strategy").and_then(Value::as_str), Some("vector"));
        assert_eq!(cfg.get("limit").and_then(Value::as_u64), Some(5));
    }

    #[test]
    fn identity_and_counters_follow_the_stream() {
        let log = EventLog::in_memory();
        log.append("user_message", "hi", json!({"role": "user"})).unwrap();
        log.append(
            "identity_adoption",
            r#"{"token":"identity.continuity","name":"Echo"}"#,
            json!({}),
        )
        .unwrap();

        let mut mirror = Mirror::new();
        mirror.rebuild(&log.read_all());
        assert_eq!(mirror.events_seen(), 2);
        assert_eq!(mirror.count_of(EventKind::UserMessage), 1);
        assert!(mirror.last_identity().is_some());
    }
}
