pub mod evolution;
pub mod graph;
pub mod identity;

pub use evolution::{GraphEvolutionTracker, TopologyDelta, TopologySnapshot, TopologyWindow};
pub use graph::{Connectivity, GraphTopologyAnalyzer, PathMetrics};
pub use identity::{
    AlertLevel, IdentityAlert, IdentityTopologyAnalyzer, IdentityTopologyMetrics,
    IdentityTopologyReport, IdentityTopologyThresholds,
};
