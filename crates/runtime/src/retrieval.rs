//! Retrieval pipeline: deterministically pick a bounded list of event ids to
//! render into the prompt, with a rationale for every inclusion.
//!
//! Candidates come from concept-seeded bindings, keyword matches (query
//! variants over entries and chunks), and optional vector similarity over
//! cached pseudo-embeddings. Ranking is hybrid
//! (keyword + concept overlap + recency), recency-only when hybrid scoring
//! is off, with an optional lexical rerank of the top K.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};
use tracing::trace;

use pmm_config::RetrievalConfig;
use pmm_core::{canonical_json, sha256_hex, EventKind, EventLog, LedgerError};
use pmm_projections::{ConceptGraph, MemeGraph};

use crate::query_rewrite::default_query_variants;

/// Hybrid scoring weights; tie-break is always descending id.
const W_KEYWORD: f64 = 0.55;
const W_CONCEPT: f64 = 0.25;
const W_RECENCY: f64 = 0.20;

/// Most recent concept-bound events considered as baseline candidates.
const BOUND_CANDIDATE_POOL: usize = 200;

/// Minimum cosine similarity for a vector-sourced candidate.
const VECTOR_MIN_SIM: f64 = 0.1;

#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub event_ids: Vec<u64>,
    pub concept_tokens: Vec<String>,
    pub rationale: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct Candidate {
    keyword: f64,
    concept_overlap: f64,
    seeded: bool,
}

pub fn run_retrieval_pipeline(
    query_text: &str,
    log: &EventLog,
    concept_graph: &ConceptGraph,
    meme_graph: &MemeGraph,
    config: &RetrievalConfig,
) -> RetrievalResult {
    let max_id = log.count();
    if max_id == 0 {
        return RetrievalResult::default();
    }

    let variants = default_query_variants(query_text);
    let query_tokens = tokenize(query_text);

    // Concepts present in the query, plus the sticky set.
    let mut seed_tokens: BTreeSet<String> = concepts_in_query(query_text, concept_graph);
    for token in &config.sticky_concepts {
        let canonical = concept_graph.canonical_token(token);
        if !canonical.is_empty() {
            seed_tokens.insert(canonical);
        }
    }

    let mut candidates: BTreeMap<u64, Candidate> = BTreeMap::new();

    // (a) seeded concept bindings, highest priority, expanded one hop
    // through the event graph.
    for token in &seed_tokens {
        for id in concept_graph.events_for_concept(token) {
            if id == 0 || id > max_id {
                continue;
            }
            let entry = candidates.entry(id).or_default();
            entry.seeded = true;
            entry.concept_overlap = 1.0;
            for neighbor in meme_graph.neighbors(id) {
                if neighbor == 0 || neighbor > max_id {
                    continue;
                }
                let entry = candidates.entry(neighbor).or_default();
                entry.concept_overlap = entry.concept_overlap.max(0.5);
            }
        }
    }

    // Baseline: recent concept-bound events keep the graph-aware window
    // populated even when the query names no concept.
    let mut bound: BTreeSet<u64> = BTreeSet::new();
    for token in concept_graph.all_tokens() {
        bound.extend(concept_graph.events_for_concept(&token));
    }
    for id in bound.iter().rev().take(BOUND_CANDIDATE_POOL) {
        if *id == 0 || *id > max_id {
            continue;
        }
        candidates.entry(*id).or_default();
    }

    // (b) keyword matches via entries and chunks, across all variants.
    for variant in &variants {
        for event in log.find_entries(Some(variant), None, None, None, 50) {
            candidates.entry(event.id).or_default().keyword = 1.0;
        }
        for hit in log.find_matching_chunks(variant, None, None, None, 50, 180) {
            candidates.entry(hit.event_id).or_default().keyword = 1.0;
        }
    }

    // (c) optional vector similarity over cached embeddings.
    if config.enable_vector_search {
        let query_vec = hash_embedding(query_text, 64);
        for event in log.read_by_kind(EventKind::EmbeddingAdd, None, false) {
            let Some(data) = event.content_json() else { continue };
            let Some(target) = data.get("event_id").and_then(Value::as_u64) else { continue };
            let Some(vector) = data.get("vector").and_then(Value::as_array) else { continue };
            let vector: Vec<f64> = vector.iter().filter_map(Value::as_f64).collect();
            let sim = cosine(&query_vec, &vector);
            if sim >= VECTOR_MIN_SIM {
                let entry = candidates.entry(target).or_default();
                entry.keyword = entry.keyword.max(sim);
            }
        }
    }

    // Fill token-overlap keyword scores for candidates without a direct hit.
    if !query_tokens.is_empty() {
        let ids: Vec<u64> = candidates
            .iter()
            .filter(|(_, c)| c.keyword == 0.0)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(event) = log.get(id) {
                let overlap = overlap_fraction(&query_tokens, &tokenize(&event.content));
                if let Some(candidate) = candidates.get_mut(&id) {
                    candidate.keyword = overlap;
                }
            }
        }
    }

    // Rank.
    let mut ranked: Vec<(u64, f64)> = candidates
        .iter()
        .map(|(id, c)| {
            let recency = *id as f64 / max_id as f64;
            let score = if config.enable_hybrid_scoring {
                W_KEYWORD * c.keyword + W_CONCEPT * c.concept_overlap + W_RECENCY * recency
            } else {
                recency
            };
            (*id, score)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));

    // Optional rerank of the top K by lexical overlap with the query.
    if config.enable_rerank && !query_tokens.is_empty() {
        let k = config.rerank_top_k.min(ranked.len());
        let mut head: Vec<(u64, f64)> = ranked[..k].to_vec();
        let mut overlaps: BTreeMap<u64, f64> = BTreeMap::new();
        for (id, _) in &head {
            let overlap = log
                .get(*id)
                .map(|e| overlap_fraction(&query_tokens, &tokenize(&e.content)))
                .unwrap_or(0.0);
            overlaps.insert(*id, overlap);
        }
        if overlaps.values().any(|o| *o > 0.0) {
            head.sort_by(|a, b| {
                let oa = overlaps.get(&a.0).copied().unwrap_or(0.0);
                let ob = overlaps.get(&b.0).copied().unwrap_or(0.0);
                ob.total_cmp(&oa).then(b.0.cmp(&a.0))
            });
            for (i, slot) in ranked[..k].iter_mut().enumerate() {
                *slot = head[i];
            }
        }
    }

    ranked.truncate(config.limit_total_events);

    let rationale = ranked
        .iter()
        .map(|(id, score)| {
            let c = candidates.get(id).cloned().unwrap_or_default();
            format!(
                "event {id}: score={score:.3} keyword={:.2} concept={:.2} seeded={}",
                c.keyword, c.concept_overlap, c.seeded
            )
        })
        .collect();

    trace!(candidates = candidates.len(), selected = ranked.len(), "retrieval pipeline done");

    RetrievalResult {
        event_ids: ranked.into_iter().map(|(id, _)| id).collect(),
        concept_tokens: seed_tokens.into_iter().collect(),
        rationale,
    }
}

/// Canonical tokens whose text (dotted or spaced) appears in the query.
fn concepts_in_query(query_text: &str, concept_graph: &ConceptGraph) -> BTreeSet<String> {
    let lower = query_text.to_lowercase();
    concept_graph
        .all_tokens()
        .into_iter()
        .filter(|token| {
            let spaced = token.replace(['.', '_'], " ");
            lower.contains(token.as_str()) || lower.contains(&spaced)
        })
        .collect()
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

fn overlap_fraction(query_tokens: &BTreeSet<String>, content_tokens: &BTreeSet<String>) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    query_tokens.intersection(content_tokens).count() as f64 / query_tokens.len() as f64
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

/// Replay-stable pseudo-embedding: unit vector derived from repeated SHA-256
/// of the text. The `hash64` model family.
pub fn hash_embedding(text: &str, dims: usize) -> Vec<f64> {
    let dims = dims.max(1);
    let mut bytes: Vec<u8> = Vec::with_capacity(dims);
    let mut counter = 0usize;
    while bytes.len() < dims {
        let digest = sha256_hex(&format!("{text}\u{0}{counter}"));
        bytes.extend(digest.as_bytes().iter().take(dims - bytes.len()));
        counter += 1;
    }
    let raw: Vec<f64> = bytes.iter().map(|b| (*b as f64 / 127.5) - 1.0).collect();
    let norm = raw.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 {
        raw
    } else {
        raw.into_iter().map(|v| v / norm).collect()
    }
}

/// Idempotently append an `embedding_add` for an event. No-op when one
/// already exists for the same event id and model.
pub fn ensure_embedding_for_event(
    log: &EventLog,
    event_id: u64,
    text: &str,
    model: &str,
    dims: usize,
) -> Result<(), LedgerError> {
    let existing = log.read_by_kind(EventKind::EmbeddingAdd, None, false);
    let already = existing.iter().any(|e| {
        e.content_json()
            .map(|d| {
                d.get("event_id").and_then(Value::as_u64) == Some(event_id)
                    && d.get("model").and_then(Value::as_str) == Some(model)
            })
            .unwrap_or(false)
    });
    if already {
        return Ok(());
    }
    let vector = hash_embedding(text, dims);
    let content = canonical_json(&json!({
        "content_hash": sha256_hex(text),
        "dims": dims,
        "event_id": event_id,
        "model": model,
        "vector": vector,
    }));
    log.append(
        EventKind::EmbeddingAdd.as_str(),
        &content,
        json!({"source": "runtime"}),
    )?;
    Ok(())
}
