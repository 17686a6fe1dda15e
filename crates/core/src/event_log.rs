use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use redb::{Database, ReadableTable, TableDefinition};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::LedgerError;
use crate::event::{canonical_json, hash_payload, iso_now, Event, EventKind};

/// Durable row table: event id → canonical JSON row.
const EVENTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

/// Fixed-size chunk window over event content.
const CHUNK_SIZE: usize = 320;
/// Overlap between consecutive chunk windows.
const CHUNK_OVERLAP: usize = 64;
/// At most one batch of this many events is chunk-backfilled at startup so
/// reopening a large ledger stays responsive.
const CHUNK_BACKFILL_BATCH: usize = 300;

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Chunk-level search hit with a window snippet around the query match.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHit {
    pub event_id: u64,
    pub kind: EventKind,
    pub chunk_idx: usize,
    pub snippet: String,
}

struct LogInner {
    db: Option<Database>,
    events: Vec<Event>,
    hash_index: HashMap<String, u64>,
    /// Inverted token index over (content, canonical meta). In-process stand-in
    /// for a full-text engine; disabled it degrades to substring scans.
    postings: HashMap<String, BTreeSet<u64>>,
    fts_enabled: bool,
    /// event id → content chunks. Populated on append and by the bounded
    /// startup backfill; missing events are re-chunked on the fly at query
    /// time.
    chunks: BTreeMap<u64, Vec<String>>,
}

/// Append-only hash-chained event store, the sole owner of durable state.
///
/// All public operations serialize through one lock; listeners run after the
/// row is durable and before `append` returns, in registration order.
pub struct EventLog {
    inner: Mutex<LogInner>,
    listeners: Mutex<Vec<Listener>>,
    path: Option<PathBuf>,
}

enum AppendOutcome {
    Inserted(Event),
    Duplicate(Event),
    Violation { event: Event, source: String, kind: EventKind },
}

impl EventLog {
    /// Memory-only log. Nothing survives the process; used by tests and
    /// ephemeral replays.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                db: None,
                events: Vec::new(),
                hash_index: HashMap::new(),
                postings: HashMap::new(),
                fts_enabled: true,
                chunks: BTreeMap::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            path: None,
        }
    }

    /// Open (or create) a durable log at `path` and replay its rows into
    /// memory. Index backfill is best-effort: a failure degrades search but
    /// never prevents startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
        }
        let db = Database::create(&path).map_err(|e| LedgerError::Storage(e.to_string()))?;

        {
            let tx = db.begin_write().map_err(|e| LedgerError::Storage(e.to_string()))?;
            tx.open_table(EVENTS_TABLE)
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
            tx.commit().map_err(|e| LedgerError::Storage(e.to_string()))?;
        }

        let mut events: Vec<Event> = Vec::new();
        {
            let tx = db.begin_read().map_err(|e| LedgerError::Storage(e.to_string()))?;
            let table = tx
                .open_table(EVENTS_TABLE)
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
            for row in table.iter().map_err(|e| LedgerError::Storage(e.to_string()))? {
                let (_, bytes) = row.map_err(|e| LedgerError::Storage(e.to_string()))?;
                match serde_json::from_slice::<Event>(bytes.value()) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable ledger row");
                    }
                }
            }
        }
        events.sort_by_key(|e| e.id);

        let mut inner = LogInner {
            db: Some(db),
            events,
            hash_index: HashMap::new(),
            postings: HashMap::new(),
            fts_enabled: true,
            chunks: BTreeMap::new(),
        };
        for event in &inner.events {
            inner.hash_index.insert(event.hash.clone(), event.id);
        }
        inner.backfill_fts();
        inner.backfill_chunks(CHUNK_BACKFILL_BATCH);

        Ok(Self {
            inner: Mutex::new(inner),
            listeners: Mutex::new(Vec::new()),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Register a callback invoked for every appended event. Listener panics
    /// are swallowed; they must never break a write.
    pub fn register_listener(&self, callback: impl Fn(&Event) + Send + Sync + 'static) {
        self.lock_listeners().push(Arc::new(callback));
    }

    /// Disable the token index, forcing the substring fallback paths.
    pub fn disable_fts(&self) {
        self.lock_inner().fts_enabled = false;
    }

    /// Append one event. Validates the kind, enforces the write policy,
    /// chains and hashes the payload, and fans out to listeners.
    ///
    /// An append whose computed hash already exists is a no-op returning the
    /// existing id. `meta` accepts a JSON object; anything else is treated as
    /// empty.
    pub fn append(&self, kind: &str, content: &str, meta: Value) -> Result<u64, LedgerError> {
        let kind = EventKind::parse(kind).ok_or_else(|| LedgerError::InvalidKind(kind.to_string()))?;
        let meta_map = meta.as_object().cloned().unwrap_or_default();

        let outcome = {
            let mut inner = self.lock_inner();
            let prev_hash = inner.events.last().map(|e| e.hash.clone());

            if kind.is_sensitive() {
                let source = meta_map
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                if inner.policy_forbids(&source, kind) {
                    let mut v_meta = Map::new();
                    v_meta.insert("source".into(), Value::String("runtime".into()));
                    v_meta.insert("actor".into(), Value::String(source.clone()));
                    v_meta.insert(
                        "attempt_kind".into(),
                        Value::String(kind.as_str().to_string()),
                    );
                    let v_content = format!("policy_violation:{source}:{kind}");
                    let event = inner.insert_row(
                        EventKind::Violation,
                        &v_content,
                        v_meta,
                        prev_hash,
                    )?;
                    AppendOutcome::Violation { event, source, kind }
                } else {
                    inner.append_or_dedupe(kind, content, meta_map, prev_hash)?
                }
            } else {
                inner.append_or_dedupe(kind, content, meta_map, prev_hash)?
            }
        };

        match outcome {
            AppendOutcome::Inserted(event) | AppendOutcome::Duplicate(event) => {
                let id = event.id;
                self.emit(&event);
                Ok(id)
            }
            AppendOutcome::Violation { event, source, kind } => {
                self.emit(&event);
                Err(LedgerError::PolicyForbidden {
                    actor: source,
                    kind: kind.as_str().to_string(),
                })
            }
        }
    }

    pub fn read_all(&self) -> Vec<Event> {
        self.lock_inner().events.clone()
    }

    pub fn read_tail(&self, limit: usize) -> Vec<Event> {
        let inner = self.lock_inner();
        let len = inner.events.len();
        inner.events[len.saturating_sub(limit)..].to_vec()
    }

    /// Events with id strictly greater than `after_id`, ascending.
    pub fn read_since(&self, after_id: u64, limit: usize) -> Vec<Event> {
        self.lock_inner()
            .events
            .iter()
            .filter(|e| e.id > after_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Events with `start_id <= id <= end_id`, ascending.
    pub fn read_range(&self, start_id: u64, end_id: u64, limit: Option<usize>) -> Vec<Event> {
        let inner = self.lock_inner();
        let iter = inner
            .events
            .iter()
            .filter(|e| e.id >= start_id && e.id <= end_id)
            .cloned();
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    pub fn read_by_kind(&self, kind: EventKind, limit: Option<usize>, reverse: bool) -> Vec<Event> {
        let inner = self.lock_inner();
        let mut rows: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();
        if reverse {
            rows.reverse();
        }
        if let Some(n) = limit {
            rows.truncate(n);
        }
        rows
    }

    pub fn last_of_kind(&self, kind: EventKind) -> Option<Event> {
        self.lock_inner()
            .events
            .iter()
            .rev()
            .find(|e| e.kind == kind)
            .cloned()
    }

    pub fn read_up_to(&self, event_id: u64) -> Vec<Event> {
        self.lock_inner()
            .events
            .iter()
            .filter(|e| e.id <= event_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, event_id: u64) -> Option<Event> {
        let inner = self.lock_inner();
        if event_id == 0 || event_id as usize > inner.events.len() {
            return None;
        }
        inner.events.get(event_id as usize - 1).cloned()
    }

    pub fn exists(&self, event_id: u64) -> bool {
        self.get(event_id).is_some()
    }

    pub fn hash_sequence(&self) -> Vec<String> {
        self.lock_inner().events.iter().map(|e| e.hash.clone()).collect()
    }

    /// Total events as the max id (append-only, ids are dense).
    pub fn count(&self) -> u64 {
        self.lock_inner().events.last().map(|e| e.id).unwrap_or(0)
    }

    /// Find events by optional keyword query plus structured filters,
    /// recency-first. Uses the token index when it admits the query, falling
    /// back to case-insensitive substring matching over content and canonical
    /// meta JSON.
    pub fn find_entries(
        &self,
        query: Option<&str>,
        kind: Option<&str>,
        start_id: Option<u64>,
        end_id: Option<u64>,
        limit: usize,
    ) -> Vec<Event> {
        let q = query.unwrap_or("").trim().to_string();
        let kind_filter = kind.map(str::trim).filter(|k| !k.is_empty()).map(str::to_string);
        let lim = limit.clamp(1, 50);

        let inner = self.lock_inner();
        let in_scope = |e: &Event| -> bool {
            if let Some(k) = &kind_filter {
                if e.kind.as_str() != k {
                    return false;
                }
            }
            if let Some(s) = start_id {
                if e.id < s {
                    return false;
                }
            }
            if let Some(t) = end_id {
                if e.id > t {
                    return false;
                }
            }
            true
        };

        if q.is_empty() {
            return inner
                .events
                .iter()
                .rev()
                .filter(|e| in_scope(e))
                .take(lim)
                .cloned()
                .collect();
        }

        if inner.fts_enabled && fts_admits(&q) {
            let tokens = tokenize(&q);
            if !tokens.is_empty() {
                let mut candidate_ids: Option<BTreeSet<u64>> = None;
                for token in &tokens {
                    let ids = inner.postings.get(token).cloned().unwrap_or_default();
                    candidate_ids = Some(match candidate_ids {
                        None => ids,
                        Some(acc) => acc.intersection(&ids).copied().collect(),
                    });
                }
                let ids = candidate_ids.unwrap_or_default();
                return ids
                    .iter()
                    .rev()
                    .filter_map(|id| inner.events.get(*id as usize - 1))
                    .filter(|e| in_scope(e))
                    .take(lim)
                    .cloned()
                    .collect();
            }
        }

        let needle = q.to_lowercase();
        inner
            .events
            .iter()
            .rev()
            .filter(|e| in_scope(e))
            .filter(|e| {
                e.content.to_lowercase().contains(&needle)
                    || canonical_json(&Value::Object(e.meta.clone()))
                        .to_lowercase()
                        .contains(&needle)
            })
            .take(lim)
            .cloned()
            .collect()
    }

    /// Chunk-level keyword hits with parent event ids, recency-first and
    /// chunk-ordered within an event. Falls back to re-chunking matching
    /// events on the fly when the chunk index has no row for them.
    pub fn find_matching_chunks(
        &self,
        query: &str,
        kind: Option<&str>,
        start_id: Option<u64>,
        end_id: Option<u64>,
        limit: usize,
        snippet_chars: usize,
    ) -> Vec<ChunkHit> {
        let q = query.trim();
        if q.is_empty() {
            return Vec::new();
        }
        let lim = limit.clamp(1, 100);
        let snip = snippet_chars.max(40);
        let needle = q.to_lowercase();

        let mut out: Vec<ChunkHit> = Vec::new();
        {
            let inner = self.lock_inner();
            let in_scope = |e: &Event| -> bool {
                if let Some(k) = kind.map(str::trim).filter(|k| !k.is_empty()) {
                    if e.kind.as_str() != k {
                        return false;
                    }
                }
                if let Some(s) = start_id {
                    if e.id < s {
                        return false;
                    }
                }
                if let Some(t) = end_id {
                    if e.id > t {
                        return false;
                    }
                }
                true
            };

            for event in inner.events.iter().rev().filter(|e| in_scope(e)) {
                let Some(chunks) = inner.chunks.get(&event.id) else {
                    continue;
                };
                for (idx, chunk) in chunks.iter().enumerate() {
                    if chunk.to_lowercase().contains(&needle) {
                        out.push(ChunkHit {
                            event_id: event.id,
                            kind: event.kind,
                            chunk_idx: idx,
                            snippet: snippet_around_query(chunk, q, snip),
                        });
                        if out.len() >= lim {
                            return out;
                        }
                    }
                }
            }
        }

        if out.is_empty() {
            // Works even before the chunk backfill has covered the ledger.
            let fallback = self.find_entries(Some(q), kind, start_id, end_id, (lim * 3).min(50));
            for event in fallback {
                for (idx, chunk) in split_content_chunks(&event.content).iter().enumerate() {
                    if chunk.to_lowercase().contains(&needle) {
                        out.push(ChunkHit {
                            event_id: event.id,
                            kind: event.kind,
                            chunk_idx: idx,
                            snippet: snippet_around_query(chunk, q, snip),
                        });
                        if out.len() >= lim {
                            return out;
                        }
                    }
                }
            }
        }
        out
    }

    /// True iff a `config` event with parsed `{type:"exec_bind", cid}` exists.
    pub fn has_exec_bind(&self, cid: &str) -> bool {
        let cid = cid.trim();
        if cid.is_empty() {
            return false;
        }
        let inner = self.lock_inner();
        inner.events.iter().any(|e| {
            e.kind == EventKind::Config
                && e.content_json()
                    .map(|data| {
                        data.get("type").and_then(Value::as_str) == Some("exec_bind")
                            && data.get("cid").and_then(Value::as_str) == Some(cid)
                    })
                    .unwrap_or(false)
        })
    }

    fn emit(&self, event: &Event) {
        let listeners = self.lock_listeners().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                warn!(event_id = event.id, kind = %event.kind, "listener panicked; swallowed");
            }
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogInner {
    fn append_or_dedupe(
        &mut self,
        kind: EventKind,
        content: &str,
        meta: Map<String, Value>,
        prev_hash: Option<String>,
    ) -> Result<AppendOutcome, LedgerError> {
        let digest = hash_payload(kind, content, &meta, prev_hash.as_deref());
        if let Some(&existing_id) = self.hash_index.get(&digest) {
            let event = self.events[existing_id as usize - 1].clone();
            return Ok(AppendOutcome::Duplicate(event));
        }
        let event = self.insert_row(kind, content, meta, prev_hash)?;
        Ok(AppendOutcome::Inserted(event))
    }

    fn insert_row(
        &mut self,
        kind: EventKind,
        content: &str,
        meta: Map<String, Value>,
        prev_hash: Option<String>,
    ) -> Result<Event, LedgerError> {
        let digest = hash_payload(kind, content, &meta, prev_hash.as_deref());
        if let Some(&existing_id) = self.hash_index.get(&digest) {
            return Ok(self.events[existing_id as usize - 1].clone());
        }

        let id = self.events.last().map(|e| e.id).unwrap_or(0) + 1;
        let event = Event {
            id,
            ts: iso_now(),
            kind,
            content: content.to_string(),
            meta,
            prev_hash,
            hash: digest.clone(),
        };

        if let Some(db) = &self.db {
            let bytes =
                serde_json::to_vec(&event).map_err(|e| LedgerError::Storage(e.to_string()))?;
            let tx = db
                .begin_write()
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
            {
                let mut table = tx
                    .open_table(EVENTS_TABLE)
                    .map_err(|e| LedgerError::Storage(e.to_string()))?;
                table
                    .insert(id, bytes.as_slice())
                    .map_err(|e| LedgerError::Storage(e.to_string()))?;
            }
            tx.commit().map_err(|e| LedgerError::Storage(e.to_string()))?;
        }

        self.index_event_for_search(&event);
        self.chunks.insert(id, split_content_chunks(&event.content));
        self.hash_index.insert(digest, id);
        self.events.push(event.clone());
        Ok(event)
    }

    fn index_event_for_search(&mut self, event: &Event) {
        if !self.fts_enabled {
            return;
        }
        let meta_text = canonical_json(&Value::Object(event.meta.clone()));
        for token in tokenize(&event.content).into_iter().chain(tokenize(&meta_text)) {
            self.postings.entry(token).or_default().insert(event.id);
        }
    }

    fn backfill_fts(&mut self) {
        if !self.fts_enabled {
            return;
        }
        let events = self.events.clone();
        for event in &events {
            self.index_event_for_search(event);
        }
    }

    fn backfill_chunks(&mut self, batch_size: usize) {
        let missing: Vec<(u64, String)> = self
            .events
            .iter()
            .filter(|e| !self.chunks.contains_key(&e.id))
            .take(batch_size)
            .map(|e| (e.id, e.content.clone()))
            .collect();
        for (id, content) in missing {
            self.chunks.insert(id, split_content_chunks(&content));
        }
    }

    /// Latest `config` event parsed as `{type:"policy"}` decides whether
    /// `source` may write `kind`. Unreadable policies fail open.
    fn policy_forbids(&self, source: &str, kind: EventKind) -> bool {
        for event in self.events.iter().rev() {
            if event.kind != EventKind::Config {
                continue;
            }
            let Ok(data) = serde_json::from_str::<Value>(&event.content) else {
                continue;
            };
            if data.get("type").and_then(Value::as_str) != Some("policy") {
                continue;
            }
            let Some(forbidden) = data
                .get("forbid_sources")
                .and_then(Value::as_object)
                .and_then(|m| m.get(source))
                .and_then(Value::as_array)
            else {
                return false;
            };
            return forbidden
                .iter()
                .filter_map(Value::as_str)
                .any(|k| k == kind.as_str());
        }
        false
    }
}

/// Split content into fixed windows of `CHUNK_SIZE` chars overlapping by
/// `CHUNK_OVERLAP`. Short content yields a single chunk; empty yields none.
pub fn split_content_chunks(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= CHUNK_SIZE {
        return vec![content.to_string()];
    }
    let step = CHUNK_SIZE - CHUNK_OVERLAP;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + CHUNK_SIZE).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end >= chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Window of at most `max_chars` centered on the first case-insensitive query
/// hit, with a third of the budget as left margin.
pub fn snippet_around_query(text: &str, query: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    let q = query.trim();
    if q.is_empty() {
        return chars.iter().take(max_chars).collect();
    }
    let lower: String = text.to_lowercase();
    let q_lower = q.to_lowercase();
    let Some(byte_at) = lower.find(&q_lower) else {
        return chars.iter().take(max_chars).collect();
    };
    let char_at = lower[..byte_at].chars().count();
    let left = char_at.saturating_sub(max_chars / 3);
    let right = (left + max_chars).min(chars.len());
    chars[left..right].iter().collect()
}

fn fts_admits(query: &str) -> bool {
    !query.is_empty() && query.chars().all(|c| c.is_alphanumeric() || c.is_whitespace())
}

fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        seen.insert(raw.to_lowercase());
    }
    seen.into_iter().collect()
}
