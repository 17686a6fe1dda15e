use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use pmm_core::{Event, EventKind};

/// Event-level graph: two events are adjacent when they share any concept
/// binding. Fed by the same bind events the ConceptGraph consumes.
#[derive(Debug, Default, Clone)]
pub struct MemeGraph {
    token_events: HashMap<String, BTreeSet<u64>>,
    adjacency: HashMap<u64, BTreeSet<u64>>,
}

impl MemeGraph {
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
        if !matches!(
            event.kind,
            EventKind::ConceptBindEvent | EventKind::ConceptBindAsync
        ) {
            return;
        }
        let Some(data) = event.content_json() else {
            return;
        };
        let Some(target) = data.get("event_id").and_then(Value::as_u64) else {
            return;
        };
        let tokens: Vec<String> = data
            .get("tokens")
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

        for token in tokens {
            let peers = self.token_events.entry(token).or_default();
            for peer in peers.iter().copied().collect::<Vec<_>>() {
                if peer == target {
                    continue;
                }
                self.adjacency.entry(target).or_default().insert(peer);
                self.adjacency.entry(peer).or_default().insert(target);
            }
            peers.insert(target);
        }
    }

    pub fn neighbors(&self, event_id: u64) -> BTreeSet<u64> {
        self.adjacency.get(&event_id).cloned().unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }
}
