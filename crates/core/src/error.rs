use thiserror::Error;

/// Errors surfaced by ledger writes.
///
/// Idempotent duplicates are not errors (the existing id is returned), and
/// listener panics are swallowed at the fan-out boundary. Content is typed
/// `&str` at the API, so the wire-level type-mismatch rejection has no
/// runtime representation here.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The kind tag is outside the closed set. No state change.
    #[error("invalid event kind: {0}")]
    InvalidKind(String),

    /// A sensitive write was attempted by a forbidden source. A `violation`
    /// event has already been appended when this surfaces.
    #[error("policy forbids {actor} writing {kind}")]
    PolicyForbidden { actor: String, kind: String },

    /// Underlying store failure. The chain never rolls back; callers decide
    /// whether to fail open (init-time indexing) or propagate.
    #[error("storage error: {0}")]
    Storage(String),
}
