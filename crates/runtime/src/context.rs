//! System prompt composition and retrieval context rendering.

use pmm_core::{Event, EventLog};
use pmm_projections::{ConceptGraph, Mirror};

use crate::markers::detect_lookup_intent;
use crate::retrieval::RetrievalResult;

/// Standing instructions describing the marker grammar the runtime parses.
pub const SYSTEM_PRIMER: &str = "\
You are a persistent mind model backed by an append-only ledger. You may use \
line-prefixed markers, one per line: \
`COMMIT: <text|json>` to open a commitment, `CLOSE: <cid|json>` to close one, \
`CLAIM:<type>=<json>` to assert a validated claim, `REFLECT:<json>` for a \
structured reflection, `REF: path#id` to reference another ledger, \
`WEB: <json|query>` to search the web, and `LEDGER_GET: {\"id\": N}` / \
`LEDGER_FIND: {\"query\": ..., \"kind\": ..., \"from_id\": ..., \"to_id\": ..., \
\"limit\": ...}` to read your own ledger. Optionally begin your reply with a \
single-line JSON header {intent, outcome, next, self_model, concepts}.";

const CONTENT_PREVIEW_CHARS: usize = 160;

/// Hint block appended to the user prompt when the input reads like a
/// ledger lookup.
pub fn tool_hint(user_input: &str) -> Option<String> {
    if !detect_lookup_intent(user_input) {
        return None;
    }
    Some(
        "[TOOL_HINT] To inspect ledger events use LEDGER_GET: {\"id\": N} for one \
event or LEDGER_FIND: {\"query\": ..., \"from_id\": ..., \"to_id\": ..., \
\"limit\": ...} to search a range."
            .to_string(),
    )
}

/// Compose the base system prompt from recent history and open commitments.
pub fn compose_system_prompt(
    history: &[Event],
    open_commitments: &[Event],
    context_has_graph: bool,
    history_len: u64,
) -> String {
    let mut sections = vec![SYSTEM_PRIMER.to_string()];

    if !open_commitments.is_empty() {
        let mut block = String::from("## Open Commitments\n");
        for event in open_commitments {
            let cid = event.meta_str("cid").unwrap_or("?");
            block.push_str(&format!("- [{cid}] {}\n", preview(&event.content)));
        }
        sections.push(block.trim_end().to_string());
    }

    if !history.is_empty() {
        let mut block = String::from("## Recent Events\n");
        for event in history {
            block.push_str(&format!(
                "- #{} {}: {}\n",
                event.id,
                event.kind,
                preview(&event.content)
            ));
        }
        sections.push(block.trim_end().to_string());
    }

    if context_has_graph {
        sections.push(
            "The memory context includes a concept graph section; ground concept \
references in it."
                .to_string(),
        );
    }
    sections.push(format!("Ledger length: {history_len} events."));

    sections.join("\n\n")
}

/// Materialize the retrieval result into a context block. The `## Graph`
/// section appears only when at least one included event is bound to a
/// concept that participates in a relation edge.
pub fn render_context(
    result: &RetrievalResult,
    log: &EventLog,
    concept_graph: &ConceptGraph,
    mirror: &Mirror,
) -> String {
    if result.event_ids.is_empty() {
        return String::new();
    }

    let mut sections: Vec<String> = Vec::new();

    let mut memory = String::from("## Memory\n");
    for (id, why) in result.event_ids.iter().zip(result.rationale.iter()) {
        let Some(event) = log.get(*id) else { continue };
        memory.push_str(&format!(
            "- #{} {}: {} ({why})\n",
            event.id,
            event.kind,
            preview(&event.content)
        ));
    }
    sections.push(memory.trim_end().to_string());

    let mut graph_tokens: Vec<String> = Vec::new();
    for id in &result.event_ids {
        for token in concept_graph.all_tokens() {
            if concept_graph.events_for_concept(&token).contains(id)
                && concept_graph.has_edges(&token)
                && !graph_tokens.contains(&token)
            {
                graph_tokens.push(token);
            }
        }
    }
    if !graph_tokens.is_empty() {
        let mut graph = String::from("## Graph\n");
        for token in &graph_tokens {
            let edges: Vec<String> = concept_graph
                .edges()
                .filter(|(from, to, _)| from == token || to == token)
                .map(|(from, to, relation)| format!("{from} -[{relation}]-> {to}"))
                .collect();
            graph.push_str(&format!("- {token}: {}\n", edges.join("; ")));
        }
        sections.push(graph.trim_end().to_string());
    }

    let open = mirror.get_open_commitment_events();
    if !open.is_empty() {
        let mut block = String::from("## Open Commitments\n");
        for event in open {
            let cid = event.meta_str("cid").unwrap_or("?");
            block.push_str(&format!("- [{cid}] {}\n", preview(&event.content)));
        }
        sections.push(block.trim_end().to_string());
    }

    sections.join("\n\n")
}

fn preview(content: &str) -> String {
    let single_line = content.replace('\n', " ");
    let mut out: String = single_line.chars().take(CONTENT_PREVIEW_CHARS).collect();
    if single_line.chars().count() > CONTENT_PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}
