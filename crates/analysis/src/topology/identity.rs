//! Identity-focused topology: fragmentation, cohesion, and bridge dependency
//! over the identity-token subgraph, with hysteresis-latched alert levels.

use std::collections::{BTreeMap, HashMap};

use super::graph::GraphTopologyAnalyzer;

#[derive(Debug, Clone, Copy)]
pub struct IdentityTopologyThresholds {
    pub cohesion_warn: f64,
    pub cohesion_critical: f64,
    pub fragmentation_warn: f64,
    pub fragmentation_critical: f64,
    pub bridge_warn: f64,
    pub bridge_critical: f64,
    /// Band by which a value must clear a threshold before a level drops.
    pub hysteresis: f64,
}

impl Default for IdentityTopologyThresholds {
    fn default() -> Self {
        Self {
            cohesion_warn: 0.45,
            cohesion_critical: 0.30,
            fragmentation_warn: 2.0,
            fragmentation_critical: 3.0,
            bridge_warn: 0.35,
            bridge_critical: 0.50,
            hysteresis: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Ok,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Ok => "ok",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityAlert {
    pub alert_type: String,
    pub level: AlertLevel,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityTopologyMetrics {
    pub total_identity_tokens: usize,
    pub present_identity_nodes: usize,
    pub missing_identity_tokens: usize,
    pub cohesion: f64,
    pub fragmentation_count: usize,
    pub bridge_dependency: f64,
    pub bridge_nodes: Vec<(String, f64)>,
    pub articulation_points: Vec<String>,
    pub components: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct IdentityTopologyReport {
    pub metrics: IdentityTopologyMetrics,
    pub alerts: Vec<IdentityAlert>,
}

impl IdentityTopologyReport {
    /// True when fragmentation or cohesion sits at a critical level.
    pub fn has_structural_critical(&self) -> bool {
        self.alerts.iter().any(|a| {
            a.level == AlertLevel::Critical
                && (a.alert_type == "fragmentation" || a.alert_type == "cohesion")
        })
    }
}

enum Side {
    Below,
    Above,
}

/// Analyze structural identity coherence using topology signals.
pub struct IdentityTopologyAnalyzer {
    identity_tokens: Vec<String>,
    thresholds: IdentityTopologyThresholds,
    last_levels: BTreeMap<String, AlertLevel>,
    last_versions: HashMap<String, u64>,
}

impl IdentityTopologyAnalyzer {
    pub fn new(identity_tokens: Vec<String>, thresholds: Option<IdentityTopologyThresholds>) -> Self {
        Self {
            identity_tokens: identity_tokens.into_iter().filter(|t| !t.is_empty()).collect(),
            thresholds: thresholds.unwrap_or_default(),
            last_levels: BTreeMap::new(),
            last_versions: HashMap::new(),
        }
    }

    pub fn identity_tokens(&self) -> &[String] {
        &self.identity_tokens
    }

    pub fn analyze(&mut self, analyzer: &GraphTopologyAnalyzer) -> IdentityTopologyReport {
        let metrics = self.compute_metrics(analyzer);
        let alerts = self.evaluate_alerts(analyzer, &metrics);
        IdentityTopologyReport { metrics, alerts }
    }

    fn compute_metrics(&self, analyzer: &GraphTopologyAnalyzer) -> IdentityTopologyMetrics {
        let present: Vec<String> = self
            .identity_tokens
            .iter()
            .filter(|t| analyzer.contains_token(t))
            .cloned()
            .collect();
        let missing = self.identity_tokens.len() - present.len();

        if present.is_empty() {
            return IdentityTopologyMetrics {
                total_identity_tokens: self.identity_tokens.len(),
                missing_identity_tokens: missing,
                ..Default::default()
            };
        }

        let components = analyzer.subgraph_components(&present);
        let fragmentation = components.len();
        let largest = components.iter().map(Vec::len).max().unwrap_or(0);
        let cohesion = largest as f64 / present.len() as f64;

        let betweenness = analyzer.subgraph_betweenness(&present);
        let mut ranked: Vec<(String, f64)> = betweenness.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(5);
        let bridge_dependency = bridge_dependency(&ranked);

        IdentityTopologyMetrics {
            total_identity_tokens: self.identity_tokens.len(),
            present_identity_nodes: present.len(),
            missing_identity_tokens: missing,
            cohesion: round6(cohesion),
            fragmentation_count: fragmentation,
            bridge_dependency: round6(bridge_dependency),
            bridge_nodes: ranked,
            articulation_points: analyzer.subgraph_articulation_points(&present),
            components,
        }
    }

    fn evaluate_alerts(
        &mut self,
        analyzer: &GraphTopologyAnalyzer,
        metrics: &IdentityTopologyMetrics,
    ) -> Vec<IdentityAlert> {
        if metrics.present_identity_nodes < 2 {
            return Vec::new();
        }
        let t = self.thresholds;
        let mut alerts = Vec::new();

        let cohesion_level = self.apply_hysteresis(
            analyzer,
            "cohesion",
            metrics.cohesion,
            t.cohesion_warn,
            t.cohesion_critical,
            Side::Below,
        );
        if cohesion_level != AlertLevel::Ok {
            alerts.push(IdentityAlert {
                alert_type: "cohesion".to_string(),
                level: cohesion_level,
                value: metrics.cohesion,
            });
        }

        let fragmentation_level = self.apply_hysteresis(
            analyzer,
            "fragmentation",
            metrics.fragmentation_count as f64,
            t.fragmentation_warn,
            t.fragmentation_critical,
            Side::Above,
        );
        if fragmentation_level != AlertLevel::Ok {
            alerts.push(IdentityAlert {
                alert_type: "fragmentation".to_string(),
                level: fragmentation_level,
                value: metrics.fragmentation_count as f64,
            });
        }

        let bridge_level = self.apply_hysteresis(
            analyzer,
            "bridge",
            metrics.bridge_dependency,
            t.bridge_warn,
            t.bridge_critical,
            Side::Above,
        );
        if bridge_level != AlertLevel::Ok {
            alerts.push(IdentityAlert {
                alert_type: "bridge_dependency".to_string(),
                level: bridge_level,
                value: metrics.bridge_dependency,
            });
        }

        alerts
    }

    /// A level drops only when the value clears the threshold adjusted by the
    /// hysteresis band; the latched level is reused within one graph version.
    fn apply_hysteresis(
        &mut self,
        analyzer: &GraphTopologyAnalyzer,
        key: &str,
        value: f64,
        warn: f64,
        critical: f64,
        side: Side,
    ) -> AlertLevel {
        let last_level = self.last_levels.get(key).copied().unwrap_or(AlertLevel::Ok);
        if let Some(&version) = self.last_versions.get(key) {
            if version == analyzer.graph_version() {
                return last_level;
            }
        }
        let band = self.thresholds.hysteresis;
        let mut level = evaluate_level(value, warn, critical, &side);

        if last_level == AlertLevel::Critical && level != AlertLevel::Critical {
            let held = match side {
                Side::Below => value < critical * (1.0 + band),
                Side::Above => value > critical * (1.0 - band),
            };
            if held {
                level = AlertLevel::Critical;
            }
        }
        if last_level == AlertLevel::Warning && level == AlertLevel::Ok {
            let held = match side {
                Side::Below => value < warn * (1.0 + band),
                Side::Above => value > warn * (1.0 - band),
            };
            if held {
                level = AlertLevel::Warning;
            }
        }

        self.last_levels.insert(key.to_string(), level);
        self.last_versions
            .insert(key.to_string(), analyzer.graph_version());
        level
    }
}

fn evaluate_level(value: f64, warn: f64, critical: f64, side: &Side) -> AlertLevel {
    match side {
        Side::Below => {
            if value <= critical {
                AlertLevel::Critical
            } else if value <= warn {
                AlertLevel::Warning
            } else {
                AlertLevel::Ok
            }
        }
        Side::Above => {
            if value >= critical {
                AlertLevel::Critical
            } else if value >= warn {
                AlertLevel::Warning
            } else {
                AlertLevel::Ok
            }
        }
    }
}

fn bridge_dependency(bridge_nodes: &[(String, f64)]) -> f64 {
    if bridge_nodes.is_empty() {
        return 0.0;
    }
    let total: f64 = bridge_nodes.iter().map(|(_, v)| v).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let max = bridge_nodes.iter().map(|(_, v)| *v).fold(f64::MIN, f64::max);
    max / total
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm_core::EventLog;
    use pmm_projections::ConceptGraph;
    use serde_json::json;

    fn define(log: &EventLog, token: &str) {
        log.append(
            "concept_define",
            &json!({"token": token, "concept_kind": "identity", "definition": token}).to_string(),
            json!({}),
        )
        .unwrap();
    }

    fn relate(log: &EventLog, from: &str, to: &str) {
        log.append(
            "concept_relate",
            &json!({"from": from, "to": to, "relation": "supports"}).to_string(),
            json!({}),
        )
        .unwrap();
    }

    fn topology(log: &EventLog) -> GraphTopologyAnalyzer {
        let mut cg = ConceptGraph::new();
        cg.rebuild(&log.read_all());
        GraphTopologyAnalyzer::new(&cg)
    }

    #[test]
    fn two_unlinked_identity_tokens_fragment() {
        let log = EventLog::in_memory();
        define(&log, "identity.A");
        define(&log, "identity.B");
        let analyzer = topology(&log);

        let mut identity = IdentityTopologyAnalyzer::new(
            vec!["identity.A".to_string(), "identity.B".to_string()],
            None,
        );
        let report = identity.analyze(&analyzer);
        assert_eq!(report.metrics.fragmentation_count, 2);
        assert!(report
            .alerts
            .iter()
            .any(|a| a.alert_type == "fragmentation"));
    }

    #[test]
    fn linked_identity_tokens_cohere() {
        let log = EventLog::in_memory();
        relate(&log, "identity.A", "identity.B");
        let analyzer = topology(&log);

        let mut identity = IdentityTopologyAnalyzer::new(
            vec!["identity.A".to_string(), "identity.B".to_string()],
            None,
        );
        let report = identity.analyze(&analyzer);
        assert_eq!(report.metrics.fragmentation_count, 1);
        assert_eq!(report.metrics.cohesion, 1.0);
        assert!(!report.alerts.iter().any(|a| a.alert_type == "fragmentation"));
    }

    #[test]
    fn missing_tokens_are_counted_and_no_alerts_below_two_nodes() {
        let log = EventLog::in_memory();
        define(&log, "identity.A");
        let analyzer = topology(&log);
        let mut identity = IdentityTopologyAnalyzer::new(
            vec!["identity.A".to_string(), "identity.B".to_string(), "identity.C".to_string()],
            None,
        );
        let report = identity.analyze(&analyzer);
        assert_eq!(report.metrics.present_identity_nodes, 1);
        assert_eq!(report.metrics.missing_identity_tokens, 2);
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn hysteresis_latches_level_within_band() {
        let log = EventLog::in_memory();
        define(&log, "identity.A");
        define(&log, "identity.B");
        define(&log, "identity.C");
        let analyzer = topology(&log);
        let tokens = vec![
            "identity.A".to_string(),
            "identity.B".to_string(),
            "identity.C".to_string(),
        ];
        let mut identity = IdentityTopologyAnalyzer::new(tokens.clone(), None);

        // Three isolated tokens: fragmentation 3 = critical, latched.
        let report = identity.analyze(&analyzer);
        let frag = report
            .alerts
            .iter()
            .find(|a| a.alert_type == "fragmentation")
            .expect("fragmentation alert");
        assert_eq!(frag.level, AlertLevel::Critical);

        // Same graph version: the latched level is reused.
        let repeat = identity.analyze(&analyzer);
        let frag_repeat = repeat
            .alerts
            .iter()
            .find(|a| a.alert_type == "fragmentation")
            .expect("fragmentation alert persists");
        assert_eq!(frag_repeat.level, AlertLevel::Critical);
    }

    #[test]
    fn structural_critical_flags_fragmentation() {
        let log = EventLog::in_memory();
        define(&log, "identity.A");
        define(&log, "identity.B");
        define(&log, "identity.C");
        let analyzer = topology(&log);
        let mut identity = IdentityTopologyAnalyzer::new(
            vec![
                "identity.A".to_string(),
                "identity.B".to_string(),
                "identity.C".to_string(),
            ],
            None,
        );
        let report = identity.analyze(&analyzer);
        assert!(report.has_structural_critical());
    }
}
