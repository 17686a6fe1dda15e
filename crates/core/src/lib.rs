pub mod error;
pub mod event;
pub mod event_log;

pub use error::LedgerError;
pub use event::{canonical_json, hash_payload, iso_now, sha256_hex, Event, EventKind};
pub use event_log::{split_content_chunks, snippet_around_query, ChunkHit, EventLog, Listener};
