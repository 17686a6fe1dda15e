pub mod commitment_analyzer;
pub mod temporal;
pub mod topology;

pub use commitment_analyzer::{
    CommitmentAnalyzer, CommitmentMetrics, CriteriaStats, DurationDistribution,
    OutcomeDistribution, TrendWindow, VelocityWindow,
};
pub use temporal::{
    AnalysisResult, AnalysisWindow, Severity, TemporalAnalyzer, TemporalPattern,
};
pub use topology::{
    AlertLevel, GraphEvolutionTracker, GraphTopologyAnalyzer, IdentityTopologyAnalyzer,
    IdentityTopologyReport, IdentityTopologyThresholds,
};
