//! Autonomy kernel: first-match decision policy over ledger-derived signals,
//! plus adaptive telemetry emitters, all idempotent over the ledger.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use pmm_analysis::{
    CommitmentAnalyzer, GraphTopologyAnalyzer, IdentityTopologyAnalyzer, TemporalAnalyzer,
};
use pmm_config::Thresholds;
use pmm_core::{canonical_json, EventKind, EventLog, LedgerError};
use pmm_projections::{ConceptGraph, IDENTITY_CONCEPTS_V1};

/// Window of recent events scanned for unindexed conversation turns.
const INDEX_SCAN_WINDOW: usize = 20;
/// Window of recent events for the temporal-pattern rule.
const TEMPORAL_SCAN_WINDOW: u64 = 30;
/// Confidence floor for the temporal-pattern rule.
const TEMPORAL_CONFIDENCE: f64 = 0.7;
/// Sensitivity for the anomaly rule.
const ANOMALY_SENSITIVITY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelAction {
    Reflect,
    Summarize,
    Index,
    TemporalReflection,
    TemporalAnalysis,
    None,
}

impl KernelAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelAction::Reflect => "reflect",
            KernelAction::Summarize => "summarize",
            KernelAction::Index => "index",
            KernelAction::TemporalReflection => "temporal_reflection",
            KernelAction::TemporalAnalysis => "temporal_analysis",
            KernelAction::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KernelDecision {
    pub decision: KernelAction,
    pub reasoning: String,
    pub evidence: Vec<String>,
}

impl KernelDecision {
    pub fn to_value(&self) -> Value {
        json!({
            "decision": self.decision.as_str(),
            "evidence": self.evidence,
            "reasoning": self.reasoning,
        })
    }
}

pub struct AutonomyKernel {
    log: Arc<EventLog>,
    thresholds: Thresholds,
    pub temporal: TemporalAnalyzer,
    commitment_analyzer: CommitmentAnalyzer,
    topology: GraphTopologyAnalyzer,
    identity_topology: IdentityTopologyAnalyzer,
}

impl AutonomyKernel {
    pub fn new(log: Arc<EventLog>, thresholds: Thresholds) -> Self {
        let empty = ConceptGraph::new();
        Self {
            temporal: TemporalAnalyzer::new(log.clone()),
            commitment_analyzer: CommitmentAnalyzer::new(log.clone()),
            topology: GraphTopologyAnalyzer::new(&empty),
            identity_topology: IdentityTopologyAnalyzer::new(
                IDENTITY_CONCEPTS_V1.iter().map(|t| t.to_string()).collect(),
                None,
            ),
            log,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Catch the topology analyzer up with the concept graph by replaying
    /// events it has not seen yet.
    pub fn refresh_topology(&mut self, concept_graph: &ConceptGraph) {
        let version = self.topology.graph_version();
        if version >= concept_graph.last_event_id() {
            return;
        }
        for event in self.log.read_since(version, usize::MAX) {
            self.topology.sync(&event, concept_graph);
        }
    }

    /// First-match decision policy.
    pub fn decide_next_action(&mut self, concept_graph: &ConceptGraph) -> KernelDecision {
        // 1. Structural identity alert.
        self.refresh_topology(concept_graph);
        let report = self.identity_topology.analyze(&self.topology);
        if report.has_structural_critical() {
            let evidence = report
                .alerts
                .iter()
                .map(|a| format!("{}={} ({})", a.alert_type, a.value, a.level.as_str()))
                .collect();
            return KernelDecision {
                decision: KernelAction::Reflect,
                reasoning: "identity topology signals critical fragmentation/cohesion".to_string(),
                evidence,
            };
        }

        // 2. Recent high-confidence identity-stability pattern.
        let count = self.log.count();
        if count >= 10 {
            let start = count.saturating_sub(TEMPORAL_SCAN_WINDOW).max(1);
            let result = self.temporal.analyze_window(start, count);
            let unstable = result.patterns.iter().find(|p| {
                p.pattern_type == "low_identity_stability" && p.confidence > TEMPORAL_CONFIDENCE
            });
            if let Some(pattern) = unstable {
                return KernelDecision {
                    decision: KernelAction::TemporalReflection,
                    reasoning: format!(
                        "identity stability degraded (confidence {:.2})",
                        pattern.confidence
                    ),
                    evidence: vec![pattern.description.clone()],
                };
            }
        }

        // 3. Temporal anomaly pressure.
        let anomalies = self.temporal.detect_anomalies(ANOMALY_SENSITIVITY);
        if anomalies.len() >= self.thresholds.anomaly_trigger {
            return KernelDecision {
                decision: KernelAction::TemporalAnalysis,
                reasoning: format!("{} temporal anomalies detected", anomalies.len()),
                evidence: anomalies,
            };
        }

        // 4. Stale open commitments.
        let stale = self.stale_open_cids();
        if stale.len() >= self.thresholds.stale_open_trigger {
            return KernelDecision {
                decision: KernelAction::Reflect,
                reasoning: format!(
                    "{} commitments stale beyond {} events",
                    stale.len(),
                    self.thresholds.commitment_staleness
                ),
                evidence: stale,
            };
        }

        // 5. Summary debt.
        let last_summary = self
            .log
            .last_of_kind(EventKind::SummaryUpdate)
            .map(|e| e.id)
            .unwrap_or(0);
        if count >= last_summary + self.thresholds.summary_interval {
            return KernelDecision {
                decision: KernelAction::Summarize,
                reasoning: format!(
                    "{} events since last summary",
                    count - last_summary
                ),
                evidence: vec![format!("last_summary_event={last_summary}")],
            };
        }

        // 6. Unindexed conversation events.
        let unindexed = self.unindexed_recent(concept_graph);
        if unindexed.len() >= self.thresholds.index_backlog {
            return KernelDecision {
                decision: KernelAction::Index,
                reasoning: format!("{} recent events lack concept bindings", unindexed.len()),
                evidence: unindexed.iter().map(|id| format!("event_{id}")).collect(),
            };
        }

        KernelDecision {
            decision: KernelAction::None,
            reasoning: "no action thresholds met".to_string(),
            evidence: Vec::new(),
        }
    }

    fn stale_open_cids(&self) -> Vec<String> {
        let count = self.log.count();
        let mut open: Vec<(String, u64)> = Vec::new();
        for event in self.log.read_all() {
            match event.kind {
                EventKind::CommitmentOpen => {
                    if let Some(cid) = event.meta_str("cid") {
                        open.push((cid.to_string(), event.id));
                    }
                }
                EventKind::CommitmentClose => {
                    if let Some(cid) = event.meta_str("cid") {
                        open.retain(|(c, _)| c != cid);
                    }
                }
                _ => {}
            }
        }
        open.into_iter()
            .filter(|(_, id)| count.saturating_sub(*id) > self.thresholds.commitment_staleness)
            .map(|(cid, _)| cid)
            .collect()
    }

    fn unindexed_recent(&self, concept_graph: &ConceptGraph) -> Vec<u64> {
        self.log
            .read_tail(INDEX_SCAN_WINDOW)
            .into_iter()
            .filter(|e| {
                matches!(e.kind, EventKind::UserMessage | EventKind::AssistantMessage)
                    && !concept_graph.is_event_bound(e.id)
            })
            .map(|e| e.id)
            .collect()
    }

    /// Document the decision rule list on the ledger exactly once.
    pub fn ensure_rule_table_event(&self) -> Result<(), LedgerError> {
        if self.log.last_of_kind(EventKind::AutonomyRuleTable).is_some() {
            return Ok(());
        }
        let content = canonical_json(&json!({
            "rules": [
                "identity_topology_critical -> reflect",
                "low_identity_stability -> temporal_reflection",
                "anomaly_pressure -> temporal_analysis",
                "stale_commitments -> reflect",
                "summary_debt -> summarize",
                "unindexed_events -> index",
                "default -> none",
            ],
        }));
        self.log.append(
            EventKind::AutonomyRuleTable.as_str(),
            &content,
            json!({"source": "autonomy_kernel"}),
        )?;
        Ok(())
    }

    // ── adaptive telemetry (idempotent, threshold-gated) ─────────────────────

    fn due(&self, kind: EventKind) -> bool {
        let count = self.log.count();
        let last = self.log.last_of_kind(kind).map(|e| e.id).unwrap_or(0);
        count >= last + self.thresholds.telemetry_interval
    }

    pub fn maybe_emit_stability_metrics(&self) -> Result<Option<u64>, LedgerError> {
        if !self.due(EventKind::StabilityMetrics) {
            return Ok(None);
        }
        let metrics = self.commitment_analyzer.compute_metrics();
        let content = canonical_json(&json!({
            "abandonment_rate": metrics.abandonment_rate,
            "open_count": metrics.open_count,
            "still_open": metrics.still_open,
            "success_rate": metrics.success_rate,
        }));
        let id = self.log.append(
            EventKind::StabilityMetrics.as_str(),
            &content,
            json!({"source": "autonomy_kernel"}),
        )?;
        Ok(Some(id))
    }

    pub fn maybe_emit_coherence_check(&self) -> Result<Option<u64>, LedgerError> {
        if !self.due(EventKind::CoherenceCheck) {
            return Ok(None);
        }
        let count = self.log.count();
        let start = count.saturating_sub(TEMPORAL_SCAN_WINDOW).max(1);
        let result = self.temporal.identity_analyzer.analyze_window(start, count);
        let stability = result
            .metrics
            .get("stability_score")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        let content = canonical_json(&json!({
            "stability_score": stability,
            "window_start": start,
            "window_end": count,
        }));
        let id = self.log.append(
            EventKind::CoherenceCheck.as_str(),
            &content,
            json!({"source": "autonomy_kernel"}),
        )?;
        Ok(Some(id))
    }

    pub fn maybe_emit_policy_update(&self) -> Result<Option<u64>, LedgerError> {
        if !self.due(EventKind::PolicyUpdate) {
            return Ok(None);
        }
        let outcomes = self.log.read_by_kind(EventKind::OutcomeObservation, None, false);
        let successes = outcomes
            .iter()
            .filter(|e| e.content.contains("\"observed_result\":\"success\""))
            .count();
        let content = canonical_json(&json!({
            "observations": outcomes.len(),
            "successes": successes,
        }));
        let id = self.log.append(
            EventKind::PolicyUpdate.as_str(),
            &content,
            json!({"source": "autonomy_kernel"}),
        )?;
        Ok(Some(id))
    }

    pub fn maybe_emit_meta_policy_update(&self) -> Result<Option<u64>, LedgerError> {
        if !self.due(EventKind::MetaPolicyUpdate) {
            return Ok(None);
        }
        let policies = self.log.read_by_kind(EventKind::PolicyUpdate, None, false).len();
        let content = canonical_json(&json!({"policy_updates_observed": policies}));
        let id = self.log.append(
            EventKind::MetaPolicyUpdate.as_str(),
            &content,
            json!({"source": "autonomy_kernel"}),
        )?;
        Ok(Some(id))
    }

    /// Concept maintenance: periodic state snapshot of the shared graph.
    pub fn maybe_maintain_concepts(
        &self,
        concept_graph: &ConceptGraph,
    ) -> Result<Option<u64>, LedgerError> {
        if !self.due(EventKind::ConceptStateSnapshot) {
            return Ok(None);
        }
        let stats = concept_graph.stats();
        let content = canonical_json(&json!({
            "aliases": stats.aliases,
            "concepts": stats.concepts,
            "edges": stats.edges,
        }));
        let id = self.log.append(
            EventKind::ConceptStateSnapshot.as_str(),
            &content,
            json!({"source": "autonomy_kernel"}),
        )?;
        debug!(snapshot = id, "concept maintenance snapshot");
        Ok(Some(id))
    }
}
