/// Canonical identity concept tokens for structural identity analysis.
///
/// The list is versioned; topology consumers key their thresholds to it, so
/// additions go into a new version rather than mutating v1.
pub const IDENTITY_CONCEPTS_VERSION: &str = "v1";

pub const IDENTITY_CONCEPTS_V1: &[&str] = &[
    "identity.continuity",
    "identity.coherence",
    "identity.stability",
    "identity.ledger_bound_self",
    "identity.formation",
    "identity.evolution",
    "identity.fragmentation",
    "identity.emergence",
    "identity.chain",
    "identity.anchor",
    "identity.gap",
    "identity.nexus",
    "identity.awareness",
    "identity.model",
    "identity.ontology",
    "identity.validation",
    "identity.user_interaction",
    "identity.graph_binding",
    "identity.temporal_binding",
    "identity.evidence_binding",
];
