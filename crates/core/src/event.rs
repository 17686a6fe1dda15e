use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Closed set of ledger event kinds. The wire tag is the snake_case name;
/// appending any other tag is rejected at the log boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    AssistantMessage,
    Reflection,
    IdentityAdoption,
    MetaSummary,
    MetricsTurn,
    MetricCheck,
    CommitmentOpen,
    CommitmentClose,
    Claim,
    AutonomyRuleTable,
    AutonomyTick,
    AutonomyStimulus,
    AutonomyKernel,
    SummaryUpdate,
    InterLedgerRef,
    Config,
    Filler,
    TestEvent,
    MetricsUpdate,
    AutonomyMetrics,
    InternalGoalCreated,
    RetrievalSelection,
    CheckpointManifest,
    EmbeddingAdd,
    LifetimeMemory,
    WebSearch,
    LedgerRead,
    LedgerSearch,
    StabilityMetrics,
    CoherenceCheck,
    OutcomeObservation,
    PolicyUpdate,
    MetaPolicyUpdate,
    ConceptDefine,
    ConceptAlias,
    ConceptBindEvent,
    ConceptRelate,
    ConceptStateSnapshot,
    ConceptBindThread,
    ClaimFromText,
    ConceptBindAsync,
    OntologySnapshot,
    OntologyInsight,
    CommitmentAnalysis,
    Violation,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::UserMessage,
        EventKind::AssistantMessage,
        EventKind::Reflection,
        EventKind::IdentityAdoption,
        EventKind::MetaSummary,
        EventKind::MetricsTurn,
        EventKind::MetricCheck,
        EventKind::CommitmentOpen,
        EventKind::CommitmentClose,
        EventKind::Claim,
        EventKind::AutonomyRuleTable,
        EventKind::AutonomyTick,
        EventKind::AutonomyStimulus,
        EventKind::AutonomyKernel,
        EventKind::SummaryUpdate,
        EventKind::InterLedgerRef,
        EventKind::Config,
        EventKind::Filler,
        EventKind::TestEvent,
        EventKind::MetricsUpdate,
        EventKind::AutonomyMetrics,
        EventKind::InternalGoalCreated,
        EventKind::RetrievalSelection,
        EventKind::CheckpointManifest,
        EventKind::EmbeddingAdd,
        EventKind::LifetimeMemory,
        EventKind::WebSearch,
        EventKind::LedgerRead,
        EventKind::LedgerSearch,
        EventKind::StabilityMetrics,
        EventKind::CoherenceCheck,
        EventKind::OutcomeObservation,
        EventKind::PolicyUpdate,
        EventKind::MetaPolicyUpdate,
        EventKind::ConceptDefine,
        EventKind::ConceptAlias,
        EventKind::ConceptBindEvent,
        EventKind::ConceptRelate,
        EventKind::ConceptStateSnapshot,
        EventKind::ConceptBindThread,
        EventKind::ClaimFromText,
        EventKind::ConceptBindAsync,
        EventKind::OntologySnapshot,
        EventKind::OntologyInsight,
        EventKind::CommitmentAnalysis,
        EventKind::Violation,
    ];

    /// Kinds whose writes pass through the policy guard before insertion.
    pub const SENSITIVE: &'static [EventKind] = &[
        EventKind::Config,
        EventKind::CheckpointManifest,
        EventKind::EmbeddingAdd,
        EventKind::RetrievalSelection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserMessage => "user_message",
            EventKind::AssistantMessage => "assistant_message",
            EventKind::Reflection => "reflection",
            EventKind::IdentityAdoption => "identity_adoption",
            EventKind::MetaSummary => "meta_summary",
            EventKind::MetricsTurn => "metrics_turn",
            EventKind::MetricCheck => "metric_check",
            EventKind::CommitmentOpen => "commitment_open",
            EventKind::CommitmentClose => "commitment_close",
            EventKind::Claim => "claim",
            EventKind::AutonomyRuleTable => "autonomy_rule_table",
            EventKind::AutonomyTick => "autonomy_tick",
            EventKind::AutonomyStimulus => "autonomy_stimulus",
            EventKind::AutonomyKernel => "autonomy_kernel",
            EventKind::SummaryUpdate => "summary_update",
            EventKind::InterLedgerRef => "inter_ledger_ref",
            EventKind::Config => "config",
            EventKind::Filler => "filler",
            EventKind::TestEvent => "test_event",
            EventKind::MetricsUpdate => "metrics_update",
            EventKind::AutonomyMetrics => "autonomy_metrics",
            EventKind::InternalGoalCreated => "internal_goal_created",
            EventKind::RetrievalSelection => "retrieval_selection",
            EventKind::CheckpointManifest => "checkpoint_manifest",
            EventKind::EmbeddingAdd => "embedding_add",
            EventKind::LifetimeMemory => "lifetime_memory",
            EventKind::WebSearch => "web_search",
            EventKind::LedgerRead => "ledger_read",
            EventKind::LedgerSearch => "ledger_search",
            EventKind::StabilityMetrics => "stability_metrics",
            EventKind::CoherenceCheck => "coherence_check",
            EventKind::OutcomeObservation => "outcome_observation",
            EventKind::PolicyUpdate => "policy_update",
            EventKind::MetaPolicyUpdate => "meta_policy_update",
            EventKind::ConceptDefine => "concept_define",
            EventKind::ConceptAlias => "concept_alias",
            EventKind::ConceptBindEvent => "concept_bind_event",
            EventKind::ConceptRelate => "concept_relate",
            EventKind::ConceptStateSnapshot => "concept_state_snapshot",
            EventKind::ConceptBindThread => "concept_bind_thread",
            EventKind::ClaimFromText => "claim_from_text",
            EventKind::ConceptBindAsync => "concept_bind_async",
            EventKind::OntologySnapshot => "ontology_snapshot",
            EventKind::OntologyInsight => "ontology_insight",
            EventKind::CommitmentAnalysis => "commitment_analysis",
            EventKind::Violation => "violation",
        }
    }

    pub fn parse(tag: &str) -> Option<EventKind> {
        EventKind::ALL.iter().copied().find(|k| k.as_str() == tag)
    }

    pub fn is_sensitive(&self) -> bool {
        EventKind::SENSITIVE.contains(self)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ledger row. `ts` is excluded from the hash so two runs that
/// produce identical semantic content chain identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub ts: String,
    pub kind: EventKind,
    pub content: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub prev_hash: Option<String>,
    pub hash: String,
}

impl Event {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.meta.get(key).and_then(Value::as_u64)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.meta.get(key).and_then(Value::as_f64)
    }

    /// Parse `content` as JSON, `None` when it is free text.
    pub fn content_json(&self) -> Option<Value> {
        serde_json::from_str(&self.content).ok()
    }
}

/// Canonical JSON: sorted keys, no whitespace. `serde_json`'s default map is
/// ordered, so serializing a `Value` built from one is already canonical.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Digest of the hash payload `{content, kind, meta, prev_hash}`.
pub fn hash_payload(
    kind: EventKind,
    content: &str,
    meta: &Map<String, Value>,
    prev_hash: Option<&str>,
) -> String {
    let mut payload = Map::new();
    payload.insert("kind".to_string(), Value::String(kind.as_str().to_string()));
    payload.insert("content".to_string(), Value::String(content.to_string()));
    payload.insert("meta".to_string(), Value::Object(meta.clone()));
    payload.insert(
        "prev_hash".to_string(),
        prev_hash.map(|h| Value::String(h.to_string())).unwrap_or(Value::Null),
    );
    sha256_hex(&canonical_json(&Value::Object(payload)))
}

/// ISO-8601 UTC with microseconds and trailing Z.
pub fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_tags_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(EventKind::parse("nonsense_kind"), None);
    }

    #[test]
    fn kind_serde_uses_wire_tag() {
        let v = serde_json::to_value(EventKind::InterLedgerRef).unwrap();
        assert_eq!(v, json!("inter_ledger_ref"));
        let k: EventKind = serde_json::from_value(json!("meta_policy_update")).unwrap();
        assert_eq!(k, EventKind::MetaPolicyUpdate);
    }

    #[test]
    fn canonical_json_sorts_keys_compactly() {
        let v = json!({"zeta": 1, "alpha": {"b": 2, "a": 1}});
        assert_eq!(canonical_json(&v), r#"{"alpha":{"a":1,"b":2},"zeta":1}"#);
    }

    #[test]
    fn hash_payload_is_stable_and_hex() {
        let meta = json!({"role": "user"}).as_object().cloned().unwrap();
        let a = hash_payload(EventKind::UserMessage, "hi", &meta, None);
        let b = hash_payload(EventKind::UserMessage, "hi", &meta, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        let c = hash_payload(EventKind::UserMessage, "hi", &meta, Some(&a));
        assert_ne!(a, c);
    }

    #[test]
    fn timestamps_carry_microseconds_and_z() {
        let ts = iso_now();
        assert!(ts.ends_with('Z'));
        let frac = ts.split('.').nth(1).unwrap();
        assert_eq!(frac.len(), 7, "expected 6 fractional digits plus Z: {ts}");
    }
}
