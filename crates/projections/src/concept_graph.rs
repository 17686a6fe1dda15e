use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use pmm_core::{Event, EventKind};

/// Directed labeled edge between canonical tokens.
pub type ConceptEdge = (String, String, String);

/// Concept Token Layer projection: canonical tokens, alias map, event and
/// commitment bindings, and labeled relations, derived purely by replay.
///
/// Canonicalization applies aliases transitively until a fixed point; alias
/// cycles are broken by taking the lexicographic minimum of the cycle.
#[derive(Debug, Default, Clone)]
pub struct ConceptGraph {
    tokens: BTreeSet<String>,
    aliases: HashMap<String, String>,
    concept_events: HashMap<String, BTreeSet<u64>>,
    concept_cids: HashMap<String, BTreeSet<String>>,
    edges: BTreeSet<ConceptEdge>,
    concept_kinds: HashMap<String, String>,
    concept_roots: HashMap<String, u64>,
    concept_tails: HashMap<String, u64>,
    last_event_id: u64,
}

impl ConceptGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    /// Resolve a token through the alias map.
    pub fn canonical_token(&self, token: &str) -> String {
        let start = token.trim().to_string();
        if start.is_empty() {
            return start;
        }
        let mut current = start;
        let mut path: Vec<String> = Vec::new();
        loop {
            if let Some(pos) = path.iter().position(|t| *t == current) {
                // Alias cycle: deterministic winner.
                let mut cycle: Vec<String> = path[pos..].to_vec();
                cycle.sort();
                return cycle[0].clone();
            }
            path.push(current.clone());
            match self.aliases.get(&current) {
                Some(next) => current = next.clone(),
                None => return current,
            }
        }
    }

    pub fn rebuild(&mut self, events: &[Event]) {
        *self = Self::default();
        for event in events {
            self.sync(event);
        }
    }

    /// Listener entry point: fold one event into the projection.
    pub fn sync(&mut self, event: &Event) {
        match event.kind {
            EventKind::ConceptDefine => {
                if let Some(data) = event.content_json() {
                    if let Some(token) = str_field(&data, "token") {
                        let canonical = self.canonical_token(&token);
                        self.touch_token(&canonical, event.id);
                        if let Some(kind) = str_field(&data, "concept_kind") {
                            self.concept_kinds.insert(canonical, kind);
                        }
                    }
                }
            }
            EventKind::ConceptAlias => {
                if let Some(data) = event.content_json() {
                    if let (Some(alias), Some(canonical)) =
                        (str_field(&data, "alias"), str_field(&data, "canonical"))
                    {
                        if alias != canonical {
                            self.aliases.insert(alias, canonical);
                            self.rekey_after_alias();
                        }
                    }
                }
            }
            EventKind::ConceptBindEvent | EventKind::ConceptBindAsync => {
                if let Some(data) = event.content_json() {
                    let target = data.get("event_id").and_then(Value::as_u64);
                    for token in token_list(&data) {
                        let canonical = self.canonical_token(&token);
                        self.touch_token(&canonical, event.id);
                        if let Some(target_id) = target {
                            self.concept_events
                                .entry(canonical.clone())
                                .or_default()
                                .insert(target_id);
                        }
                    }
                }
            }
            EventKind::ConceptBindThread => {
                if let Some(data) = event.content_json() {
                    let cid = str_field(&data, "cid");
                    for token in token_list(&data) {
                        let canonical = self.canonical_token(&token);
                        self.touch_token(&canonical, event.id);
                        if let Some(cid) = &cid {
                            self.concept_cids
                                .entry(canonical.clone())
                                .or_default()
                                .insert(cid.clone());
                        }
                    }
                }
            }
            EventKind::ConceptRelate => {
                if let Some(data) = event.content_json() {
                    if let (Some(from), Some(to), Some(relation)) = (
                        str_field(&data, "from"),
                        str_field(&data, "to"),
                        str_field(&data, "relation"),
                    ) {
                        let from_c = self.canonical_token(&from);
                        let to_c = self.canonical_token(&to);
                        self.touch_token(&from_c, event.id);
                        self.touch_token(&to_c, event.id);
                        self.edges.insert((from_c, to_c, relation));
                    }
                }
            }
            EventKind::IdentityAdoption => {
                if let Some(data) = event.content_json() {
                    if let Some(token) = str_field(&data, "token") {
                        let canonical = self.canonical_token(&token);
                        self.touch_token(&canonical, event.id);
                        self.concept_kinds
                            .entry(canonical)
                            .or_insert_with(|| "identity".to_string());
                    }
                }
            }
            _ => return,
        }
        self.last_event_id = self.last_event_id.max(event.id);
    }

    fn touch_token(&mut self, canonical: &str, event_id: u64) {
        if canonical.is_empty() {
            return;
        }
        self.tokens.insert(canonical.to_string());
        self.concept_roots
            .entry(canonical.to_string())
            .or_insert(event_id);
        self.concept_tails.insert(canonical.to_string(), event_id);
    }

    /// Alias changes can reshape canonicalization for already-indexed keys;
    /// fold every keyed structure onto the new canonical forms.
    fn rekey_after_alias(&mut self) {
        let aliases = self.aliases.clone();
        let canon = |token: &str| -> String {
            let graph = ConceptGraph {
                aliases: aliases.clone(),
                ..Default::default()
            };
            graph.canonical_token(token)
        };

        self.tokens = self.tokens.iter().map(|t| canon(t)).collect();

        let mut events: HashMap<String, BTreeSet<u64>> = HashMap::new();
        for (token, ids) in self.concept_events.drain() {
            events.entry(canon(&token)).or_default().extend(ids);
        }
        self.concept_events = events;

        let mut cids: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (token, set) in self.concept_cids.drain() {
            cids.entry(canon(&token)).or_default().extend(set);
        }
        self.concept_cids = cids;

        self.edges = self
            .edges
            .iter()
            .map(|(f, t, r)| (canon(f), canon(t), r.clone()))
            .collect();

        let mut kinds: HashMap<String, String> = HashMap::new();
        for (token, kind) in self.concept_kinds.drain() {
            kinds.entry(canon(&token)).or_insert(kind);
        }
        self.concept_kinds = kinds;

        let mut roots: HashMap<String, u64> = HashMap::new();
        for (token, id) in self.concept_roots.drain() {
            let key = canon(&token);
            let entry = roots.entry(key).or_insert(id);
            *entry = (*entry).min(id);
        }
        self.concept_roots = roots;

        let mut tails: HashMap<String, u64> = HashMap::new();
        for (token, id) in self.concept_tails.drain() {
            let key = canon(&token);
            let entry = tails.entry(key).or_insert(id);
            *entry = (*entry).max(id);
        }
        self.concept_tails = tails;
    }

    pub fn all_tokens(&self) -> Vec<String> {
        self.tokens.iter().cloned().collect()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(&self.canonical_token(token))
    }

    /// Event ids bound to a concept (after canonicalization).
    pub fn events_for_concept(&self, token: &str) -> BTreeSet<u64> {
        self.concept_events
            .get(&self.canonical_token(token))
            .cloned()
            .unwrap_or_default()
    }

    /// True when any concept binds the given event id.
    pub fn is_event_bound(&self, event_id: u64) -> bool {
        self.concept_events.values().any(|ids| ids.contains(&event_id))
    }

    /// Commitment cids bound to any of the given concepts.
    pub fn resolve_cids_for_concepts(&self, tokens: &[String]) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for token in tokens {
            if let Some(cids) = self.concept_cids.get(&self.canonical_token(token)) {
                out.extend(cids.iter().cloned());
            }
        }
        out
    }

    pub fn edges(&self) -> impl Iterator<Item = &ConceptEdge> {
        self.edges.iter()
    }

    /// True when the token participates in at least one relation edge.
    pub fn has_edges(&self, token: &str) -> bool {
        let canonical = self.canonical_token(token);
        self.edges
            .iter()
            .any(|(f, t, _)| *f == canonical || *t == canonical)
    }

    pub fn concept_kind(&self, token: &str) -> Option<&str> {
        self.concept_kinds
            .get(&self.canonical_token(token))
            .map(String::as_str)
    }

    pub fn root_event(&self, token: &str) -> Option<u64> {
        self.concept_roots.get(&self.canonical_token(token)).copied()
    }

    pub fn tail_event(&self, token: &str) -> Option<u64> {
        self.concept_tails.get(&self.canonical_token(token)).copied()
    }

    pub fn binding_count(&self, token: &str) -> usize {
        self.concept_events
            .get(&self.canonical_token(token))
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> ConceptGraphStats {
        ConceptGraphStats {
            concepts: self.tokens.len(),
            edges: self.edges.len(),
            aliases: self.aliases.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConceptGraphStats {
    pub concepts: usize,
    pub edges: usize,
    pub aliases: usize,
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn token_list(data: &Value) -> Vec<String> {
    data.get("tokens")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm_core::EventLog;
    use serde_json::json;

    fn bind(log: &EventLog, event_id: u64, token: &str) {
        log.append(
            "concept_bind_event",
            &json!({"event_id": event_id, "tokens": [token], "relation": "relevant_to"})
                .to_string(),
            json!({}),
        )
        .unwrap();
    }

    fn replayed(log: &EventLog) -> ConceptGraph {
        let mut graph = ConceptGraph::new();
        graph.rebuild(&log.read_all());
        graph
    }

    #[test]
    fn define_and_bind_track_events() {
        let log = EventLog::in_memory();
        let eid = log.append("filler", "x", json!({})).unwrap();
        log.append(
            "concept_define",
            &json!({"token": "identity.continuity", "concept_kind": "identity"}).to_string(),
            json!({}),
        )
        .unwrap();
        bind(&log, eid, "identity.continuity");

        let graph = replayed(&log);
        assert!(graph.contains("identity.continuity"));
        assert_eq!(graph.concept_kind("identity.continuity"), Some("identity"));
        assert!(graph.events_for_concept("identity.continuity").contains(&eid));
    }

    #[test]
    fn aliases_resolve_transitively() {
        let log = EventLog::in_memory();
        log.append(
            "concept_alias",
            &json!({"alias": "self.continuity", "canonical": "identity.cont"}).to_string(),
            json!({}),
        )
        .unwrap();
        log.append(
            "concept_alias",
            &json!({"alias": "identity.cont", "canonical": "identity.continuity"}).to_string(),
            json!({}),
        )
        .unwrap();
        bind(&log, 1, "self.continuity");

        let graph = replayed(&log);
        assert_eq!(graph.canonical_token("self.continuity"), "identity.continuity");
        assert!(graph.events_for_concept("identity.continuity").contains(&1));
    }

    #[test]
    fn alias_cycles_break_lexicographically() {
        let log = EventLog::in_memory();
        log.append(
            "concept_alias",
            &json!({"alias": "b.token", "canonical": "a.token"}).to_string(),
            json!({}),
        )
        .unwrap();
        log.append(
            "concept_alias",
            &json!({"alias": "a.token", "canonical": "b.token"}).to_string(),
            json!({}),
        )
        .unwrap();

        let graph = replayed(&log);
        assert_eq!(graph.canonical_token("a.token"), "a.token");
        assert_eq!(graph.canonical_token("b.token"), "a.token");
    }

    #[test]
    fn late_alias_rekeys_existing_bindings() {
        let log = EventLog::in_memory();
        bind(&log, 1, "identity.cont");
        log.append(
            "concept_alias",
            &json!({"alias": "identity.cont", "canonical": "identity.continuity"}).to_string(),
            json!({}),
        )
        .unwrap();

        let graph = replayed(&log);
        assert!(graph.events_for_concept("identity.continuity").contains(&1));
        assert!(graph.all_tokens().contains(&"identity.continuity".to_string()));
        assert!(!graph.all_tokens().contains(&"identity.cont".to_string()));
    }

    #[test]
    fn relations_and_thread_bindings_are_projected() {
        let log = EventLog::in_memory();
        log.append(
            "concept_relate",
            &json!({"from": "identity.continuity", "to": "identity.anchor", "relation": "supports"})
                .to_string(),
            json!({}),
        )
        .unwrap();
        log.append(
            "concept_bind_thread",
            &json!({"cid": "ab12cd34", "tokens": ["identity.anchor"], "relation": "relevant_to"})
                .to_string(),
            json!({}),
        )
        .unwrap();

        let graph = replayed(&log);
        assert!(graph.has_edges("identity.continuity"));
        assert!(graph.has_edges("identity.anchor"));
        let cids = graph.resolve_cids_for_concepts(&["identity.anchor".to_string()]);
        assert!(cids.contains("ab12cd34"));
        assert_eq!(graph.stats().edges, 1);
    }

    #[test]
    fn rebuild_matches_incremental_sync() {
        let log = EventLog::in_memory();
        let mut live = ConceptGraph::new();
        for i in 0..6 {
            let token = if i % 2 == 0 { "a.even" } else { "b.odd" };
            bind(&log, i + 1, token);
        }
        for event in log.read_all() {
            live.sync(&event);
        }
        let rebuilt = replayed(&log);
        assert_eq!(live.all_tokens(), rebuilt.all_tokens());
        assert_eq!(
            live.events_for_concept("a.even"),
            rebuilt.events_for_concept("a.even")
        );
        assert_eq!(live.last_event_id(), rebuilt.last_event_id());
    }
}
