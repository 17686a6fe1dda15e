//! End-to-end turn orchestration over an in-memory ledger with scripted
//! adapters.

use std::sync::Arc;

use serde_json::{json, Value};

use pmm_core::{EventKind, EventLog};
use pmm_llm::ScriptedAdapter;
use pmm_runtime::{RuntimeLoop, RuntimeOptions};

fn runtime_with(replies: Vec<&'static str>) -> (Arc<EventLog>, Arc<RuntimeLoop>, Arc<ScriptedAdapter>) {
    let log = Arc::new(EventLog::in_memory());
    let adapter = Arc::new(ScriptedAdapter::new(replies));
    let runtime = RuntimeLoop::new(log.clone(), adapter.clone(), RuntimeOptions::default())
        .expect("runtime construction");
    (log, runtime, adapter)
}

#[test]
fn plain_turn_appends_user_assistant_and_diagnostics() {
    let (log, runtime, _adapter) = runtime_with(vec!["All good."]);
    runtime.run_turn("hello there").unwrap();

    let events = log.read_all();
    assert_eq!(events[0].kind, EventKind::UserMessage);
    assert_eq!(events[0].content, "hello there");
    let assistant = events
        .iter()
        .find(|e| e.kind == EventKind::AssistantMessage)
        .expect("assistant message");
    assert_eq!(assistant.content, "All good.");
    assert_eq!(assistant.meta_str("role"), Some("assistant"));
    assert_eq!(assistant.meta_str("provider"), Some("dummy"));

    assert!(log.last_of_kind(EventKind::MetricsTurn).is_some());
    assert!(log.last_of_kind(EventKind::RetrievalSelection).is_some());

    // Hash chain holds across everything the turn appended.
    for pair in events.windows(2) {
        assert_eq!(pair[1].prev_hash.as_deref(), Some(pair[0].hash.as_str()));
    }
}

#[test]
fn turn_seeds_continuity_concept_for_both_turn_events() {
    let (log, runtime, _adapter) = runtime_with(vec!["Plain reply."]);
    runtime.run_turn("bind me").unwrap();

    let binds = log.read_by_kind(EventKind::ConceptBindEvent, None, false);
    assert_eq!(binds.len(), 2, "user and assistant events both bound");
    for bind in &binds {
        assert!(bind.content.contains("identity.continuity"));
        assert_eq!(bind.meta_str("source"), Some("active_indexing"));
    }

    // Idempotent on repeat: a second identical binding is not re-appended
    // for already-bound events.
    let graph = runtime.concept_graph();
    let bound = graph
        .lock()
        .unwrap()
        .events_for_concept("identity.continuity");
    assert_eq!(bound.len(), 2);
}

#[test]
fn commitment_turn_opens_closes_and_reflects() {
    // S3: COMMIT plus CLOSE of an already-open cid.
    let (log, runtime, _adapter) = runtime_with(vec!["COMMIT: Analyze Q1\nCLOSE: cid_xyz"]);
    log.append("commitment_open", "earlier work", json!({"cid": "cid_xyz"})).unwrap();
    {
        // Re-sync the mirror with the pre-seeded open commitment.
        let mirror = runtime.mirror();
        mirror.lock().unwrap().rebuild(&log.read_all());
    }

    runtime.run_turn("work on the quarter").unwrap();

    let opens = log.read_by_kind(EventKind::CommitmentOpen, None, false);
    assert_eq!(opens.len(), 2);
    let fresh = opens.last().unwrap();
    assert_eq!(fresh.content, "Analyze Q1");
    let fresh_cid = fresh.meta_str("cid").unwrap().to_string();
    assert_eq!(fresh_cid.len(), 8);

    let closes = log.read_by_kind(EventKind::CommitmentClose, None, false);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].meta_str("cid"), Some("cid_xyz"));

    let reflection = log.last_of_kind(EventKind::Reflection).expect("delta reflection");
    assert!(reflection.content.contains(&fresh_cid));
    assert!(reflection.content.contains("cid_xyz"));

    let mirror = runtime.mirror();
    let open_now = mirror.lock().unwrap().open_cids();
    assert_eq!(open_now, vec![fresh_cid], "net change: fresh open, cid_xyz closed");
}

#[test]
fn structured_header_is_recorded_and_concepts_bound() {
    let (log, runtime, _adapter) = runtime_with(vec![
        "{\"intent\":\"answer\",\"outcome\":\"done\",\"next\":\"wait\",\"self_model\":\"steady\",\"concepts\":[\"topic.ledger\"]}\nHere is the answer.",
    ]);
    runtime.run_turn("describe yourself").unwrap();

    let assistant = log.last_of_kind(EventKind::AssistantMessage).unwrap();
    assert_eq!(assistant.meta.get("assistant_structured"), Some(&json!(true)));
    assert_eq!(assistant.meta_str("assistant_schema"), Some("assistant.v1"));
    let payload = assistant.meta_str("assistant_payload").unwrap();
    let parsed: Value = serde_json::from_str(payload).unwrap();
    assert_eq!(parsed["intent"], json!("answer"));

    let binds = log.read_by_kind(EventKind::ConceptBindEvent, None, false);
    assert!(binds.iter().all(|b| b.content.contains("topic.ledger")));
}

#[test]
fn claims_validate_persist_and_autobind() {
    let (log, runtime, _adapter) = runtime_with(vec![
        "CLAIM:identity_ratify={\"name\":\"Echo\",\"token\":\"identity.anchor\"}\nCLAIM:Bad Type={\"x\":1}\nDone.",
    ]);
    runtime.run_turn("ratify").unwrap();

    let claims = log.read_by_kind(EventKind::Claim, None, false);
    assert_eq!(claims.len(), 1, "only the valid claim persists");
    assert_eq!(claims[0].meta_str("claim_type"), Some("identity_ratify"));
    assert_eq!(claims[0].meta.get("validated"), Some(&json!(true)));

    // Auto-bound as a concept with relation `describes`.
    let binds = log.read_by_kind(EventKind::ConceptBindEvent, None, false);
    assert!(binds
        .iter()
        .any(|b| b.content.contains("identity_ratify") && b.content.contains("describes")));

    // Identity adoption derived from the ratify claim.
    let adoption = log.last_of_kind(EventKind::IdentityAdoption).expect("adoption");
    assert!(adoption.content.contains("identity.anchor"));
}

#[test]
fn reflect_block_feeds_the_delta_reflection() {
    let (log, runtime, _adapter) = runtime_with(vec!["REFLECT:{\"theme\":\"growth\"}\nOk."]);
    runtime.run_turn("reflect please").unwrap();

    let reflection = log.last_of_kind(EventKind::Reflection).expect("reflection");
    assert!(reflection.content.contains("growth"));
}

#[test]
fn exec_bind_lines_route_to_internal_goals() {
    let (log, runtime, _adapter) =
        runtime_with(vec!["COMMIT: Ship it\nexec: cargo package\nWorking on it."]);
    runtime.run_turn("ship the crate").unwrap();

    let opens = log.read_by_kind(EventKind::CommitmentOpen, None, false);
    let cid = opens[0].meta_str("cid").unwrap();
    assert!(log.has_exec_bind(cid));

    let goals = log.read_by_kind(EventKind::InternalGoalCreated, None, false);
    assert_eq!(goals.len(), 1);
    assert_eq!(goals[0].meta_str("cid"), Some(cid));
}

#[test]
fn replay_mode_never_mutates_the_ledger() {
    let log = Arc::new(EventLog::in_memory());
    log.append("user_message", "old", json!({"role": "user"})).unwrap();
    let adapter = Arc::new(ScriptedAdapter::new(vec!["should not be called"]));
    let runtime = RuntimeLoop::new(
        log.clone(),
        adapter.clone(),
        RuntimeOptions { replay: true, ..Default::default() },
    )
    .unwrap();

    let events = runtime.run_turn("new input").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(log.count(), 1);
    assert!(adapter.calls().is_empty(), "replay never calls the adapter");
}

#[test]
fn vector_mode_appends_embeddings_for_both_messages() {
    let (log, runtime, _adapter) = runtime_with(vec!["Reply text."]);
    log.append(
        "config",
        r#"{"type":"retrieval","strategy":"vector","limit":10,"model":"hash64","dims":32}"#,
        json!({"source": "runtime"}),
    )
    .unwrap();
    runtime.run_turn("embed this turn").unwrap();

    let embeddings = log.read_by_kind(EventKind::EmbeddingAdd, None, false);
    assert_eq!(embeddings.len(), 2, "user and assistant embeddings");
    for embedding in &embeddings {
        let data = embedding.content_json().unwrap();
        assert_eq!(data["model"], json!("hash64"));
        assert_eq!(data["dims"], json!(32));
    }

    let selection = log.last_of_kind(EventKind::RetrievalSelection).unwrap();
    let data = selection.content_json().unwrap();
    assert_eq!(data["strategy"], json!("vector"));
    let scores = data["scores"].as_array().unwrap();
    assert!(scores.iter().all(|s| s == &json!(0.0)));
}

#[test]
fn web_marker_records_search_and_reprompts() {
    let (log, runtime, adapter) = runtime_with(vec![
        "WEB: {\"query\":\"rust event sourcing\",\"limit\":3}",
        "Found what I needed.",
    ]);
    runtime.run_turn("research this").unwrap();

    let searches = log.read_by_kind(EventKind::WebSearch, None, false);
    assert_eq!(searches.len(), 1);
    let payload = searches[0].content_json().unwrap();
    assert_eq!(payload["query"], json!("rust event sourcing"));
    // No API key in the test environment: recorded as a tool failure.
    assert_eq!(payload["ok"], json!(false));

    let calls = adapter.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].contains("[WEB_SEARCH_RESULTS]"));

    let assistant = log.last_of_kind(EventKind::AssistantMessage).unwrap();
    assert_eq!(assistant.content, "Found what I needed.");
}
