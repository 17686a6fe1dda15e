pub mod commitments;
pub mod concept_graph;
pub mod concepts;
pub mod meme_graph;
pub mod mirror;

pub use commitments::{parse_closure, parse_commitment, CommitmentManager, ParsedClosure, ParsedCommitment};
pub use concept_graph::{ConceptEdge, ConceptGraph, ConceptGraphStats};
pub use concepts::{IDENTITY_CONCEPTS_V1, IDENTITY_CONCEPTS_VERSION};
pub use meme_graph::MemeGraph;
pub use mirror::Mirror;
