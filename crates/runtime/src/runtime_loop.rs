//! Turn orchestration: strict-ordered parsing of structured markers in model
//! replies, producing new ledger events, plus the autonomy tick dispatcher.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use pmm_config::RuntimeConfig;
use pmm_core::{canonical_json, sha256_hex, Event, EventKind, EventLog};
use pmm_llm::Adapter;
use pmm_projections::{CommitmentManager, ConceptGraph, MemeGraph, Mirror};

use crate::context::{compose_system_prompt, render_context, tool_hint};
use crate::exec_bind::{extract_exec_binds, ExecBindRouter};
use crate::identity::{maybe_append_identity_adoptions, validate_claim};
use crate::indexer::Indexer;
use crate::kernel::{AutonomyKernel, KernelAction, KernelDecision};
use crate::ledger_tools::{run_ledger_get, run_ledger_find};
use crate::markers::{
    extract_claims, extract_closures, extract_commitments, extract_ledger_tool, extract_reflect,
    extract_web_request, ToolAttempt,
};
use crate::ontology::OntologyAutonomy;
use crate::reflection::{
    build_reflection_text, maybe_append_lifetime_memory, maybe_append_summary,
    record_inter_ledger_refs, synthesize_reflection, TurnDelta,
};
use crate::retrieval::{ensure_embedding_for_event, run_retrieval_pipeline};
use crate::supervisor::AutonomySupervisor;
use crate::web_search::run_web_search;

/// Marker-driven re-prompt budget per turn.
const MAX_TOOL_ROUNDS: usize = 5;
/// Delay before an out-of-band autonomy tick runs, letting the stimulus
/// append finish its fan-out first.
const TICK_DELAY_MS: u64 = 200;
/// Concepts seeded during active meditation turns.
const MEDITATION_CONCEPTS: &[&str] =
    &["ontology.structure", "identity.evolution", "awareness.loop"];
/// Universal continuity fallback concept.
const DEFAULT_CONCEPT: &str = "identity.continuity";

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub autonomy: bool,
    pub replay: bool,
    pub config: RuntimeConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self { autonomy: false, replay: false, config: RuntimeConfig::default() }
    }
}

#[derive(Default)]
struct TurnTelemetry {
    tool_hint_shown: bool,
    tool_called: bool,
    tool_name: Option<&'static str>,
    tool_parse_errors: u64,
    forced_finalizations: u64,
    forced_fallback: bool,
}

pub struct RuntimeLoop {
    log: Arc<EventLog>,
    adapter: Arc<dyn Adapter>,
    mirror: Arc<Mutex<Mirror>>,
    concept_graph: Arc<Mutex<ConceptGraph>>,
    meme_graph: Arc<Mutex<MemeGraph>>,
    commitments: CommitmentManager,
    kernel: Mutex<AutonomyKernel>,
    ontology: OntologyAutonomy,
    indexer: Indexer,
    exec_router: Option<ExecBindRouter>,
    supervisor: Option<Arc<AutonomySupervisor>>,
    config: RuntimeConfig,
    replay: bool,
}

impl RuntimeLoop {
    /// Wire projections as listeners, rebuild them from the existing ledger,
    /// and (optionally) start the autonomy supervisor on a background thread.
    pub fn new(
        log: Arc<EventLog>,
        adapter: Arc<dyn Adapter>,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>> {
        let events = log.read_all();

        let mirror = Arc::new(Mutex::new(Mirror::new()));
        let concept_graph = Arc::new(Mutex::new(ConceptGraph::new()));
        let meme_graph = Arc::new(Mutex::new(MemeGraph::new()));
        lock(&mirror).rebuild(&events);
        lock(&concept_graph).rebuild(&events);
        lock(&meme_graph).rebuild(&events);

        let supervisor = if options.autonomy && !options.replay {
            Some(Arc::new(
                AutonomySupervisor::new(
                    log.clone(),
                    &options.config.supervisor.epoch,
                    options.config.supervisor.interval_s,
                    options.config.supervisor.seed_limit,
                )
                .context("starting autonomy supervisor")?,
            ))
        } else {
            None
        };

        let runtime = Arc::new(Self {
            commitments: CommitmentManager::new(log.clone()),
            kernel: Mutex::new(AutonomyKernel::new(
                log.clone(),
                options.config.thresholds.clone(),
            )),
            ontology: OntologyAutonomy::new(log.clone(), options.config.thresholds.snapshot_interval),
            indexer: Indexer::new(log.clone()),
            exec_router: (!options.replay).then(|| ExecBindRouter::new(log.clone())),
            supervisor,
            mirror,
            concept_graph,
            meme_graph,
            adapter,
            config: options.config,
            replay: options.replay,
            log,
        });

        runtime.register_projection_listeners();

        if !runtime.replay {
            lock(&runtime.kernel).ensure_rule_table_event()?;
        }
        if runtime.supervisor.is_some() {
            runtime.register_stimulus_listener();
            runtime.spawn_supervisor_thread();
        }

        Ok(runtime)
    }

    fn register_projection_listeners(&self) {
        let mirror = self.mirror.clone();
        self.log.register_listener(move |event| {
            lock(&mirror).sync(event);
        });
        let concept_graph = self.concept_graph.clone();
        self.log.register_listener(move |event| {
            lock(&concept_graph).sync(event);
        });
        let meme_graph = self.meme_graph.clone();
        self.log.register_listener(move |event| {
            lock(&meme_graph).sync(event);
        });
    }

    /// Listener first, then the supervisor: every stimulus is caught and
    /// dispatched as a short-delayed tick on its own thread.
    fn register_stimulus_listener(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.log.register_listener(move |event| {
            if event.kind != EventKind::AutonomyStimulus {
                return;
            }
            let Some(data) = event.content_json() else { return };
            let (Some(slot), Some(slot_id)) = (
                data.get("slot").and_then(Value::as_u64),
                data.get("slot_id").and_then(Value::as_str).map(str::to_string),
            ) else {
                return;
            };
            let Some(runtime) = weak.upgrade() else { return };
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(TICK_DELAY_MS));
                if let Err(err) = runtime.run_tick(slot, &slot_id) {
                    warn!(error = %err, slot, "autonomy tick failed");
                }
            });
        });
    }

    fn spawn_supervisor_thread(&self) {
        let Some(supervisor) = self.supervisor.clone() else { return };
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build();
            match runtime {
                Ok(rt) => rt.block_on(supervisor.run_forever()),
                Err(err) => warn!(error = %err, "supervisor runtime failed to start"),
            }
        });
    }

    pub fn shutdown(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop();
        }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn mirror(&self) -> Arc<Mutex<Mirror>> {
        self.mirror.clone()
    }

    pub fn concept_graph(&self) -> Arc<Mutex<ConceptGraph>> {
        self.concept_graph.clone()
    }

    /// Run one foreground turn. See the module docs for the strict step
    /// ordering; later steps depend on events appended by earlier ones.
    pub fn run_turn(&self, user_input: &str) -> Result<Vec<Event>> {
        if self.replay {
            return Ok(self.log.read_all());
        }
        let mut telemetry = TurnTelemetry::default();

        // 1. Log the user message (plus its embedding in vector mode).
        let user_event_id = self
            .log
            .append(EventKind::UserMessage.as_str(), user_input, json!({"role": "user"}))?;
        let retrieval_settings = lock(&self.mirror).current_retrieval_config().cloned();
        let vector_mode = retrieval_settings
            .as_ref()
            .and_then(|cfg| cfg.get("strategy"))
            .and_then(Value::as_str)
            == Some("vector");
        let embed_model = retrieval_settings
            .as_ref()
            .and_then(|cfg| cfg.get("model"))
            .and_then(Value::as_str)
            .unwrap_or("hash64")
            .to_string();
        let embed_dims = retrieval_settings
            .as_ref()
            .and_then(|cfg| cfg.get("dims"))
            .and_then(Value::as_u64)
            .unwrap_or(64) as usize;
        if vector_mode {
            ensure_embedding_for_event(&self.log, user_event_id, user_input, &embed_model, embed_dims)?;
        }

        // 2. Retrieval context and system prompt.
        let mut pipeline_config = self.config.retrieval.clone();
        if let Some(settings) = &retrieval_settings {
            if let Some(limit) = settings.get("limit").and_then(Value::as_u64) {
                if limit > 0 {
                    pipeline_config.limit_total_events = limit as usize;
                }
            }
            pipeline_config.enable_vector_search = vector_mode;
        }

        let total_events = self.log.count();
        let meditation_active = total_events > 20 && total_events % 37 == 0;

        let (retrieval_result, ctx_block, open_commitment_events) = {
            let concept_graph = lock(&self.concept_graph);
            let meme_graph = lock(&self.meme_graph);
            let mirror = lock(&self.mirror);
            let result = run_retrieval_pipeline(
                user_input,
                &self.log,
                &concept_graph,
                &meme_graph,
                &pipeline_config,
            );
            let ctx = render_context(&result, &self.log, &concept_graph, &mirror);
            (result, ctx, mirror.get_open_commitment_events())
        };
        let context_has_graph = ctx_block.contains("## Graph");

        let history = self.log.read_tail(10);
        let mut system_prompt = compose_system_prompt(
            &history,
            &open_commitment_events,
            context_has_graph,
            total_events,
        );
        if let Some(temporal_context) = self.temporal_context() {
            system_prompt = format!("{temporal_context}\n\n{system_prompt}");
        }
        if !ctx_block.is_empty() {
            system_prompt = format!("{ctx_block}\n\n{system_prompt}");
        }

        // 3. Adapter call plus bounded tool rounds.
        let mut effective_user_prompt = user_input.to_string();
        if let Some(hint) = tool_hint(user_input) {
            telemetry.tool_hint_shown = true;
            effective_user_prompt = format!("{effective_user_prompt}\n\n{hint}");
        }

        let started = Instant::now();
        let mut assistant_reply = self
            .adapter
            .generate_reply(&system_prompt, &effective_user_prompt)?;

        // 3a. Web search, a single pass.
        if let Some(request) = extract_web_request(&assistant_reply) {
            let payload = run_web_search(
                &request.query,
                request.provider.as_deref(),
                request.limit,
            );
            let payload_text = canonical_json(&payload);
            self.log.append(
                EventKind::WebSearch.as_str(),
                &payload_text,
                json!({"source": "assistant", "trigger": "marker"}),
            )?;
            telemetry.tool_called = true;
            telemetry.tool_name = Some("WEB");
            effective_user_prompt =
                format!("{effective_user_prompt}\n\n[WEB_SEARCH_RESULTS]\n{payload_text}");
            assistant_reply = self
                .adapter
                .generate_reply(&system_prompt, &effective_user_prompt)?;
        }

        // 3b/3c. Ledger tools: bounded rounds, then forced finalization.
        let mut rounds = 0usize;
        loop {
            let Some(attempt) = extract_ledger_tool(&assistant_reply) else { break };
            if rounds >= MAX_TOOL_ROUNDS {
                effective_user_prompt = format!(
                    "{effective_user_prompt}\n\n[FINAL_ANSWER_REQUIRED]\nAnswer in natural \
language using the tool results above; do not call further tools."
                );
                let final_reply = self
                    .adapter
                    .generate_reply(&system_prompt, &effective_user_prompt)?;
                if extract_ledger_tool(&final_reply).is_some() {
                    assistant_reply = "retry-ready".to_string();
                    telemetry.forced_fallback = true;
                } else {
                    assistant_reply = final_reply;
                    telemetry.forced_finalizations += 1;
                }
                break;
            }
            rounds += 1;
            match attempt {
                ToolAttempt::Get(request) => {
                    let payload = run_ledger_get(&self.log, &request);
                    let payload_text = canonical_json(&payload);
                    self.log.append(
                        EventKind::LedgerRead.as_str(),
                        &payload_text,
                        json!({
                            "source": "assistant",
                            "trigger": "marker",
                            "request": {"id": request.id},
                        }),
                    )?;
                    telemetry.tool_called = true;
                    telemetry.tool_name = Some("LEDGER_GET");
                    effective_user_prompt =
                        format!("{effective_user_prompt}\n\n[LEDGER_GET_RESULTS]\n{payload_text}");
                }
                ToolAttempt::Find(request) => {
                    let payload = run_ledger_find(&self.log, &request);
                    let payload_text = canonical_json(&payload);
                    self.log.append(
                        EventKind::LedgerSearch.as_str(),
                        &payload_text,
                        json!({
                            "source": "assistant",
                            "trigger": "marker",
                            "request": {
                                "query": request.query,
                                "kind": request.kind,
                                "from_id": request.from_id,
                                "to_id": request.to_id,
                                "limit": request.limit,
                            },
                        }),
                    )?;
                    telemetry.tool_called = true;
                    telemetry.tool_name = Some("LEDGER_FIND");
                    effective_user_prompt =
                        format!("{effective_user_prompt}\n\n[LEDGER_FIND_RESULTS]\n{payload_text}");
                }
                ToolAttempt::Malformed { tool, reason } => {
                    telemetry.tool_parse_errors += 1;
                    effective_user_prompt = format!(
                        "{effective_user_prompt}\n\n[TOOL_PROTOCOL_ERROR]\n{tool}: {reason}"
                    );
                }
            }
            assistant_reply = self
                .adapter
                .generate_reply(&system_prompt, &effective_user_prompt)?;
        }
        let latency_ms = self
            .adapter
            .deterministic_latency_ms()
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);

        // 4. Optional structured JSON header on the first reply line.
        let (structured_payload, mut active_concepts) = parse_reply_header(&assistant_reply);

        // 5. Concept seeding: meditation set, then the continuity fallback.
        if meditation_active && active_concepts.is_empty() {
            active_concepts.extend(MEDITATION_CONCEPTS.iter().map(|c| c.to_string()));
        }
        if active_concepts.is_empty() {
            active_concepts.push(DEFAULT_CONCEPT.to_string());
        }

        // 6. Log the assistant message with generation metadata.
        let meta = self.assistant_meta(structured_payload.as_deref());
        let ai_event_id = self.log.append(
            EventKind::AssistantMessage.as_str(),
            &assistant_reply,
            Value::Object(meta),
        )?;

        // 7. Active indexing: bind this turn's events to the seed concepts.
        for token in &active_concepts {
            let existing = lock(&self.concept_graph).events_for_concept(token);
            for event_id in [user_event_id, ai_event_id] {
                if existing.contains(&event_id) {
                    continue;
                }
                let content = canonical_json(&json!({
                    "event_id": event_id,
                    "relation": "relevant_to",
                    "tokens": [token],
                }));
                self.log.append(
                    EventKind::ConceptBindEvent.as_str(),
                    &content,
                    json!({"source": "active_indexing"}),
                )?;
            }
        }

        // 8. Compile structured concept ops from the header, if any.
        self.compile_concept_ops(&assistant_reply)?;

        if vector_mode {
            ensure_embedding_for_event(&self.log, ai_event_id, &assistant_reply, &embed_model, embed_dims)?;
        }

        // 9. REF lines in the raw reply.
        record_inter_ledger_refs(&self.log, &assistant_reply)?;

        // 10. Retrieval selection provenance. Scores are not persisted.
        let scores = vec![0.0; retrieval_result.event_ids.len()];
        let digest = sha256_hex(&canonical_json(&json!({
            "dims": embed_dims,
            "model": &embed_model,
            "query": user_input,
            "selected": &retrieval_result.event_ids,
        })));
        let selection_content = canonical_json(&json!({
            "dims": embed_dims,
            "model": &embed_model,
            "scores": scores,
            "selected": &retrieval_result.event_ids,
            "strategy": if vector_mode { "vector" } else { "fixed" },
            "turn_id": ai_event_id,
        }));
        self.log.append(
            EventKind::RetrievalSelection.as_str(),
            &selection_content,
            json!({"source": "runtime", "digest": digest}),
        )?;

        // 11. Per-turn diagnostics.
        let meta = self.adapter.generation_meta();
        let in_tokens =
            system_prompt.split_whitespace().count() + effective_user_prompt.split_whitespace().count();
        let out_tokens = assistant_reply.split_whitespace().count();
        let diag = format!(
            "provider:{},model:{},in_tokens:{in_tokens},out_tokens:{out_tokens},lat_ms:{latency_ms}",
            meta.provider, meta.model
        );
        self.log.append(
            EventKind::MetricsTurn.as_str(),
            &diag,
            json!({
                "tool_hint_shown": telemetry.tool_hint_shown,
                "tool_called": telemetry.tool_called,
                "tool_name": telemetry.tool_name,
                "tool_parse_errors": telemetry.tool_parse_errors,
                "forced_finalizations": telemetry.forced_finalizations,
                "forced_fallback": telemetry.forced_fallback,
            }),
        )?;

        // 12. Staleness reflection, periodic summary, lifetime memory.
        synthesize_reflection(
            &self.log,
            self.config.thresholds.commitment_staleness,
            self.config.thresholds.commitment_auto_close,
            Map::new(),
            false,
        )?;
        maybe_append_summary(&self.log, self.config.thresholds.summary_interval)?;
        {
            // Snapshot the graph: appends re-enter the projection listeners.
            let graph_snapshot = lock(&self.concept_graph).clone();
            maybe_append_lifetime_memory(
                &self.log,
                &graph_snapshot,
                self.config.thresholds.lifetime_interval,
            )?;
        }

        let mut delta = TurnDelta::default();

        // 13. Open commitments, exec binds, thread bindings.
        for commitment_text in extract_commitments(&assistant_reply) {
            let Some(cid) = self.commitments.open_commitment(&commitment_text, "assistant") else {
                continue;
            };
            extract_exec_binds(&self.log, &commitment_text, &cid)?;

            let bound_cids = lock(&self.concept_graph).resolve_cids_for_concepts(&active_concepts);
            if !bound_cids.contains(&cid) {
                for token in &active_concepts {
                    let content = canonical_json(&json!({
                        "cid": &cid,
                        "relation": "relevant_to",
                        "tokens": [token],
                    }));
                    self.log.append(
                        EventKind::ConceptBindThread.as_str(),
                        &content,
                        json!({"source": "loop"}),
                    )?;
                }
            }
            delta.opened.push(cid);
        }
        if let Some(router) = &self.exec_router {
            router.tick()?;
        }

        // 14. Claims: validate, persist, auto-bind the claim type.
        let claims = extract_claims(&assistant_reply).unwrap_or_default();
        for claim in claims {
            match validate_claim(&claim, &self.log) {
                Ok(()) => {
                    let content = format!(
                        "CLAIM:{}={}",
                        claim.claim_type,
                        canonical_json(&claim.data)
                    );
                    let claim_event_id = self.log.append(
                        EventKind::Claim.as_str(),
                        &content,
                        json!({"claim_type": &claim.claim_type, "validated": true}),
                    )?;
                    let already_bound = lock(&self.concept_graph)
                        .events_for_concept(&claim.claim_type)
                        .contains(&claim_event_id);
                    if !already_bound {
                        let bind = canonical_json(&json!({
                            "event_id": claim_event_id,
                            "relation": "describes",
                            "tokens": [&claim.claim_type],
                        }));
                        self.log.append(
                            EventKind::ConceptBindEvent.as_str(),
                            &bind,
                            json!({"source": "auto_binder"}),
                        )?;
                    }
                }
                Err(reason) => {
                    debug!(claim_type = %claim.claim_type, %reason, "claim rejected");
                    delta.failed_claims.push(claim);
                }
            }
        }

        // 15. Identity adoption from validated claims, idempotent.
        maybe_append_identity_adoptions(&self.log)?;

        // 16. Closures.
        let closures = extract_closures(&assistant_reply);
        delta
            .closed
            .extend(self.commitments.apply_closures(&closures, "assistant"));

        // 17. REFLECT block.
        delta.reflect_block = extract_reflect(&assistant_reply);

        // 18. Delta reflection.
        if let Some(text) = build_reflection_text(&delta) {
            self.log.append(
                EventKind::Reflection.as_str(),
                &text,
                json!({"about_event": ai_event_id}),
            )?;
            record_inter_ledger_refs(&self.log, &text)?;
        }

        // 19. Ontology autonomy.
        if self.ontology.maybe_emit_snapshot()? {
            let insights = self.ontology.detect_insights();
            if !insights.is_empty() {
                self.ontology.emit_insights(&insights)?;
            }
        }

        info!(turn = ai_event_id, opened = delta.opened.len(), closed = delta.closed.len(), "turn complete");
        Ok(self.log.read_tail(200))
    }

    /// Execute one autonomy tick for a stimulus slot.
    pub fn run_tick(&self, slot: u64, slot_id: &str) -> Result<KernelDecision> {
        let last_id_before = self.log.count();

        let decision = {
            let concept_graph = lock(&self.concept_graph);
            lock(&self.kernel).decide_next_action(&concept_graph)
        };

        // Log the tick first, then execute.
        self.log.append(
            EventKind::AutonomyTick.as_str(),
            &canonical_json(&decision.to_value()),
            json!({"source": "autonomy_kernel", "slot": slot, "slot_id": slot_id}),
        )?;

        let thresholds = &self.config.thresholds;
        match decision.decision {
            KernelAction::Reflect | KernelAction::TemporalReflection => {
                let mut extra = Map::new();
                extra.insert("source".to_string(), json!("autonomy_kernel"));
                extra.insert("slot_id".to_string(), json!(slot_id));
                extra.insert(
                    "staleness_threshold".to_string(),
                    json!(thresholds.commitment_staleness.to_string()),
                );
                extra.insert(
                    "auto_close_threshold".to_string(),
                    json!(thresholds.commitment_auto_close.to_string()),
                );
                if decision.decision == KernelAction::TemporalReflection {
                    extra.insert("trigger".to_string(), json!("temporal_pattern"));
                    extra.insert("reason".to_string(), json!(decision.reasoning));
                }
                let reflection_id = synthesize_reflection(
                    &self.log,
                    thresholds.commitment_staleness,
                    thresholds.commitment_auto_close,
                    extra,
                    true,
                )?;
                if let Some(id) = reflection_id {
                    if let Some(event) = self.log.get(id) {
                        record_inter_ledger_refs(&self.log, &event.content)?;
                    }
                }
            }
            KernelAction::Summarize => {
                maybe_append_summary(&self.log, thresholds.summary_interval)?;
            }
            KernelAction::Index => {
                let concept_graph = lock(&self.concept_graph).clone();
                self.indexer.run_indexing_cycle(&concept_graph)?;
            }
            KernelAction::TemporalAnalysis => {
                let content = canonical_json(&json!({
                    "evidence": decision.evidence,
                    "reason": decision.reasoning,
                    "trigger": "temporal_analysis",
                }));
                self.log.append(
                    EventKind::AutonomyMetrics.as_str(),
                    &content,
                    json!({"source": "autonomy_kernel", "trigger": "temporal_pattern"}),
                )?;
            }
            KernelAction::None => {}
        }

        if let Some(router) = &self.exec_router {
            router.tick()?;
        }

        self.emit_tick_outcome_and_adapt(&decision, last_id_before, slot, slot_id)?;
        Ok(decision)
    }

    /// Observe whether the decided action actually produced its events, then
    /// run the adaptive telemetry emitters.
    fn emit_tick_outcome_and_adapt(
        &self,
        decision: &KernelDecision,
        last_id_before: u64,
        slot: u64,
        slot_id: &str,
    ) -> Result<()> {
        let events_since: Vec<Event> = self
            .log
            .read_tail(200)
            .into_iter()
            .filter(|e| e.id > last_id_before)
            .collect();

        let observed_result = match decision.decision {
            KernelAction::Reflect | KernelAction::TemporalReflection => {
                let hit = events_since.iter().any(|e| {
                    e.kind == EventKind::Reflection
                        && e.meta_str("source") == Some("autonomy_kernel")
                });
                if hit { "success" } else { "no_delta" }
            }
            KernelAction::Summarize => {
                let hit = events_since.iter().any(|e| e.kind == EventKind::SummaryUpdate);
                if hit { "success" } else { "no_delta" }
            }
            KernelAction::Index => {
                let hit = events_since.iter().any(|e| {
                    matches!(e.kind, EventKind::ClaimFromText | EventKind::ConceptBindAsync)
                });
                if hit { "success" } else { "no_delta" }
            }
            _ => "success",
        };

        let evidence_event_ids: Vec<u64> = events_since
            .iter()
            .map(|e| e.id)
            .rev()
            .take(10)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let content = canonical_json(&json!({
            "action_kind": format!("autonomy_{}", decision.decision.as_str()),
            "action_payload": format!("decision={}", decision.decision.as_str()),
            "commitment_id": "",
            "evidence_event_ids": evidence_event_ids,
            "observed_result": observed_result,
        }));
        self.log.append(
            EventKind::OutcomeObservation.as_str(),
            &content,
            json!({"source": "autonomy_kernel", "slot": slot, "slot_id": slot_id}),
        )?;

        {
            let kernel = lock(&self.kernel);
            kernel.maybe_emit_stability_metrics()?;
            kernel.maybe_emit_coherence_check()?;
            kernel.maybe_emit_meta_policy_update()?;
            kernel.maybe_emit_policy_update()?;
        }
        let concept_graph = lock(&self.concept_graph).clone();
        lock(&self.kernel).maybe_maintain_concepts(&concept_graph)?;
        Ok(())
    }

    /// Temporal context block for the system prompt, when the ledger is
    /// large enough to say something.
    fn temporal_context(&self) -> Option<String> {
        let count = self.log.count();
        if count < 10 {
            return None;
        }
        let start = count.saturating_sub(30).max(1);
        let kernel = lock(&self.kernel);
        let result = kernel.temporal.analyze_window(start, count);

        let mut parts = Vec::new();
        for pattern in &result.patterns {
            if pattern.confidence <= 0.7 {
                continue;
            }
            match pattern.pattern_type.as_str() {
                "low_identity_stability" => parts.push(format!(
                    "Recent identity coherence analysis shows stability degradation (confidence: {:.2})",
                    pattern.confidence
                )),
                "commitment_burst" => parts.push(format!(
                    "Recent commitment clustering detected (confidence: {:.2})",
                    pattern.confidence
                )),
                "engagement_periods" => parts.push(format!(
                    "High engagement periods detected (confidence: {:.2})",
                    pattern.confidence
                )),
                _ => {}
            }
        }
        let anomalies = kernel.temporal.detect_anomalies(0.6);
        if !anomalies.is_empty() {
            let shown: Vec<&str> = anomalies.iter().take(2).map(String::as_str).collect();
            parts.push(format!("Recent temporal anomalies: {}", shown.join("; ")));
        }

        if parts.is_empty() {
            None
        } else {
            let bullets: Vec<String> = parts.iter().map(|p| format!("- {p}")).collect();
            Some(format!("## Recent Temporal Patterns\n{}", bullets.join("\n")))
        }
    }

    fn assistant_meta(&self, structured_payload: Option<&str>) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("role".to_string(), json!("assistant"));
        if let Some(payload) = structured_payload {
            meta.insert("assistant_structured".to_string(), json!(true));
            meta.insert("assistant_schema".to_string(), json!("assistant.v1"));
            meta.insert("assistant_payload".to_string(), json!(payload));
        }
        let generation = self.adapter.generation_meta();
        meta.insert("provider".to_string(), json!(generation.provider));
        meta.insert("model".to_string(), json!(generation.model));
        meta.insert("temperature".to_string(), json!(generation.temperature));
        meta.insert("top_p".to_string(), json!(generation.top_p));
        meta.insert("seed".to_string(), json!(generation.seed));
        meta
    }

    /// Structured concept ops embedded in the reply header; a deterministic
    /// no-op when absent.
    fn compile_concept_ops(&self, assistant_reply: &str) -> Result<()> {
        let header = assistant_reply.lines().next().unwrap_or("");
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(header) else {
            return Ok(());
        };
        let Some(ops) = data.get("concept_ops").and_then(Value::as_array) else {
            return Ok(());
        };
        for op in ops {
            let Some(kind) = op.get("op").and_then(Value::as_str) else { continue };
            match kind {
                "define" => {
                    if let Some(token) = op.get("token").and_then(Value::as_str) {
                        let content = canonical_json(&json!({
                            "concept_kind": op.get("concept_kind").and_then(Value::as_str).unwrap_or("domain"),
                            "definition": op.get("definition").and_then(Value::as_str).unwrap_or(""),
                            "token": token,
                        }));
                        self.log.append(
                            EventKind::ConceptDefine.as_str(),
                            &content,
                            json!({"source": "concept_compiler"}),
                        )?;
                    }
                }
                "relate" => {
                    if let (Some(from), Some(to), Some(relation)) = (
                        op.get("from").and_then(Value::as_str),
                        op.get("to").and_then(Value::as_str),
                        op.get("relation").and_then(Value::as_str),
                    ) {
                        let content = canonical_json(&json!({
                            "from": from,
                            "relation": relation,
                            "to": to,
                        }));
                        self.log.append(
                            EventKind::ConceptRelate.as_str(),
                            &content,
                            json!({"source": "concept_compiler"}),
                        )?;
                    }
                }
                "alias" => {
                    if let (Some(alias), Some(canonical)) = (
                        op.get("alias").and_then(Value::as_str),
                        op.get("canonical").and_then(Value::as_str),
                    ) {
                        let content =
                            canonical_json(&json!({"alias": alias, "canonical": canonical}));
                        self.log.append(
                            EventKind::ConceptAlias.as_str(),
                            &content,
                            json!({"source": "concept_compiler"}),
                        )?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Parse the optional one-line JSON header `{intent, outcome, next,
/// self_model, concepts?}`. Returns the canonical payload (when all four
/// required keys are string-valued) and any declared concepts.
fn parse_reply_header(reply: &str) -> (Option<String>, Vec<String>) {
    let header_line = reply.split('\n').next().unwrap_or("");
    let Ok(parsed) = serde_json::from_str::<Value>(header_line) else {
        return (None, Vec::new());
    };
    let Value::Object(data) = &parsed else {
        return (None, Vec::new());
    };

    let required = ["intent", "outcome", "next", "self_model"];
    let structured = required
        .iter()
        .all(|key| data.get(*key).map(Value::is_string).unwrap_or(false));
    let payload = structured.then(|| canonical_json(&parsed));

    let concepts = data
        .get("concepts")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    (payload, concepts)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_header_requires_all_four_string_keys() {
        let (payload, concepts) = parse_reply_header(
            "{\"intent\":\"a\",\"outcome\":\"b\",\"next\":\"c\",\"self_model\":\"d\",\
\"concepts\":[\"x.y\"]}\nrest of reply",
        );
        assert!(payload.is_some());
        assert_eq!(concepts, vec!["x.y"]);

        let (missing, concepts) =
            parse_reply_header("{\"intent\":\"a\",\"concepts\":[\"x.y\"]}\nrest");
        assert!(missing.is_none());
        assert_eq!(concepts, vec!["x.y"], "concepts collected even without full header");

        let (none, empty) = parse_reply_header("plain text reply");
        assert!(none.is_none());
        assert!(empty.is_empty());
    }
}
