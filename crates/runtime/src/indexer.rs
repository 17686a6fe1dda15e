//! Background indexing: bind recent unbound conversation events into the
//! concept layer and mirror first-person statements as text-derived claims.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use pmm_analysis::temporal::cognitive::extract_domain;
use pmm_core::{canonical_json, EventKind, EventLog, LedgerError};
use pmm_projections::ConceptGraph;

/// How many recent events one indexing cycle examines.
const INDEX_WINDOW: usize = 50;

pub struct Indexer {
    log: Arc<EventLog>,
}

impl Indexer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    /// Bind unbound user/assistant events to a lexicon-derived domain
    /// concept via `concept_bind_async`, and append `claim_from_text` for
    /// first-person statements. Deterministic over the ledger.
    pub fn run_indexing_cycle(&self, concept_graph: &ConceptGraph) -> Result<usize, LedgerError> {
        let tail = self.log.read_tail(INDEX_WINDOW);
        let mut indexed = 0usize;

        for event in tail {
            if !matches!(event.kind, EventKind::UserMessage | EventKind::AssistantMessage) {
                continue;
            }
            if concept_graph.is_event_bound(event.id) {
                continue;
            }

            let domain = extract_domain(&event.content);
            let token = format!("domain.{domain}");
            let content = canonical_json(&json!({
                "event_id": event.id,
                "relation": "relevant_to",
                "tokens": [token],
            }));
            self.log.append(
                EventKind::ConceptBindAsync.as_str(),
                &content,
                json!({"source": "indexer"}),
            )?;
            indexed += 1;

            if let Some(statement) = first_person_statement(&event.content) {
                self.log.append(
                    EventKind::ClaimFromText.as_str(),
                    &statement,
                    json!({"source": "indexer", "origin_event": event.id}),
                )?;
            }
        }
        debug!(indexed, "indexing cycle complete");
        Ok(indexed)
    }
}

/// First sentence starting with a first-person stance marker, if any.
fn first_person_statement(content: &str) -> Option<String> {
    for sentence in content.split(['.', '\n']) {
        let trimmed = sentence.trim();
        if trimmed.starts_with("I am ") || trimmed.starts_with("I will ") {
            return Some(trimmed.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    #[test]
    fn unbound_messages_get_domain_bindings() {
        let log = Arc::new(EventLog::in_memory());
        log.append("user_message", "let us write code for the parser", j!({"role": "user"}))
            .unwrap();
        let mut cg = ConceptGraph::new();
        cg.rebuild(&log.read_all());

        let indexer = Indexer::new(log.clone());
        let indexed = indexer.run_indexing_cycle(&cg).unwrap();
        assert_eq!(indexed, 1);

        let binds = log.read_by_kind(EventKind::ConceptBindAsync, None, false);
        assert_eq!(binds.len(), 1);
        assert!(binds[0].content.contains("domain.technical"));
    }

    #[test]
    fn bound_events_are_skipped() {
        let log = Arc::new(EventLog::in_memory());
        let eid = log
            .append("assistant_message", "already indexed", j!({"role": "assistant"}))
            .unwrap();
        log.append(
            "concept_bind_event",
            &canonical_json(&j!({"event_id": eid, "tokens": ["topic.x"], "relation": "relevant_to"})),
            j!({}),
        )
        .unwrap();
        let mut cg = ConceptGraph::new();
        cg.rebuild(&log.read_all());

        let indexer = Indexer::new(log.clone());
        assert_eq!(indexer.run_indexing_cycle(&cg).unwrap(), 0);
    }

    #[test]
    fn first_person_statements_become_text_claims() {
        let log = Arc::new(EventLog::in_memory());
        log.append(
            "assistant_message",
            "Some prose. I will keep the ledger consistent. More prose.",
            j!({"role": "assistant"}),
        )
        .unwrap();
        let mut cg = ConceptGraph::new();
        cg.rebuild(&log.read_all());

        Indexer::new(log.clone()).run_indexing_cycle(&cg).unwrap();
        let claims = log.read_by_kind(EventKind::ClaimFromText, None, false);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].content, "I will keep the ledger consistent");
    }
}
