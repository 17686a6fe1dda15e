//! Identity coherence tracking: stability, fragmentation, coherence gaps,
//! claim/commitment consistency, reflection density, evolution rate.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use pmm_core::{Event, EventKind, EventLog};

use super::{content_similarity, mean, AnalysisResult, AnalysisWindow, Severity, TemporalPattern};

/// Word pairs treated as contradictory between consecutive adoptions.
const CONTRADICTORY_PAIRS: &[(&str, &str)] = &[
    ("introverted", "extroverted"),
    ("confident", "insecure"),
    ("careful", "reckless"),
    ("consistent", "inconsistent"),
    ("open", "closed"),
    ("honest", "deceptive"),
];

const FRAGMENTED_INDICATORS: &[&str] = &[
    "but wait",
    "on second thought",
    "actually",
    "never mind",
    "scratch that",
    "let me reconsider",
    "conflicted",
    "uncertain",
    "mixed feelings",
];

/// A gap larger than this many events between identity events counts as a
/// coherence gap.
const COHERENCE_GAP_EVENTS: u64 = 50;

#[derive(Debug, Clone, Default)]
pub struct IdentityMetrics {
    pub stability_score: f64,
    pub fragmentation_events: usize,
    pub coherence_gaps: usize,
    pub claim_consistency: f64,
    pub reflection_density: f64,
    pub identity_evolution_rate: f64,
}

pub struct IdentityCoherenceAnalyzer {
    log: Arc<EventLog>,
}

impl IdentityCoherenceAnalyzer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    pub fn analyze_window(&self, start_id: u64, end_id: u64) -> AnalysisResult {
        let events = self.log.read_range(start_id, end_id, None);
        let identity_events: Vec<Event> = events
            .into_iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EventKind::IdentityAdoption
                        | EventKind::Reflection
                        | EventKind::CommitmentOpen
                        | EventKind::Claim
                )
            })
            .collect();

        if identity_events.is_empty() {
            return AnalysisResult::empty(start_id, end_id);
        }

        let metrics = self.compute_metrics(&identity_events);
        let patterns = detect_patterns(&metrics, start_id, end_id);
        let anomalies = detect_anomalies(&metrics);
        let insights = generate_insights(&metrics, &patterns);

        AnalysisResult {
            window: AnalysisWindow { start_id, end_id, event_count: identity_events.len() },
            patterns,
            anomalies,
            insights,
            metrics: json!({
                "stability_score": metrics.stability_score,
                "fragmentation_events": metrics.fragmentation_events,
                "coherence_gaps": metrics.coherence_gaps,
                "claim_consistency": metrics.claim_consistency,
                "reflection_density": metrics.reflection_density,
                "identity_evolution_rate": metrics.identity_evolution_rate,
            }),
        }
    }

    fn compute_metrics(&self, identity_events: &[Event]) -> IdentityMetrics {
        let adoption: Vec<&Event> = identity_events
            .iter()
            .filter(|e| e.kind == EventKind::IdentityAdoption)
            .collect();
        let reflection: Vec<&Event> = identity_events
            .iter()
            .filter(|e| e.kind == EventKind::Reflection)
            .collect();
        let commitment: Vec<&Event> = identity_events
            .iter()
            .filter(|e| e.kind == EventKind::CommitmentOpen)
            .collect();
        let claims: Vec<&Event> =
            identity_events.iter().filter(|e| e.kind == EventKind::Claim).collect();

        IdentityMetrics {
            stability_score: stability_score(identity_events),
            fragmentation_events: count_fragmentation_events(identity_events),
            coherence_gaps: count_coherence_gaps(identity_events),
            claim_consistency: claim_consistency(&claims, &commitment),
            reflection_density: reflection.len() as f64 / adoption.len().max(1) as f64,
            identity_evolution_rate: evolution_rate(adoption.len(), reflection.len()),
        }
    }
}

/// Content-set similarity within each identity-bearing kind, averaged.
fn stability_score(identity_events: &[Event]) -> f64 {
    if identity_events.len() < 2 {
        return 1.0;
    }
    let mut scores = Vec::new();
    for kind in [EventKind::IdentityAdoption, EventKind::Reflection] {
        let contents: Vec<String> = identity_events
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.content.clone())
            .collect();
        if !contents.is_empty() {
            scores.push(content_similarity(&contents));
        }
    }
    if scores.is_empty() {
        1.0
    } else {
        mean(&scores)
    }
}

fn count_fragmentation_events(identity_events: &[Event]) -> usize {
    let mut count = 0;
    for (i, event) in identity_events.iter().enumerate() {
        match event.kind {
            EventKind::IdentityAdoption => {
                if i > 0 && identity_events[i - 1].kind == EventKind::IdentityAdoption {
                    let curr = event.content.to_lowercase();
                    let prev = identity_events[i - 1].content.to_lowercase();
                    if are_contradictory(&curr, &prev) {
                        count += 1;
                    }
                }
            }
            EventKind::Reflection => {
                if is_fragmented_reflection(&event.content.to_lowercase()) {
                    count += 1;
                }
            }
            _ => {}
        }
    }
    count
}

fn count_coherence_gaps(identity_events: &[Event]) -> usize {
    if identity_events.len() < 3 {
        return 0;
    }
    let mut ids: Vec<u64> = identity_events.iter().map(|e| e.id).collect();
    ids.sort_unstable();
    ids.windows(2)
        .filter(|pair| pair[1] - pair[0] > COHERENCE_GAP_EVENTS)
        .count()
}

/// Jaccard overlap between the theme sets of claims and commitments.
fn claim_consistency(claims: &[&Event], commitments: &[&Event]) -> f64 {
    if claims.is_empty() && commitments.is_empty() {
        return 1.0;
    }
    let claim_themes = extract_themes(claims);
    let commitment_themes = extract_themes(commitments);
    let all: BTreeSet<&String> = claim_themes.union(&commitment_themes).collect();
    if all.is_empty() {
        return 1.0;
    }
    let common = claim_themes.intersection(&commitment_themes).count();
    common as f64 / all.len() as f64
}

/// Evolution peaks when adoption and reflection balance, scaled by volume.
fn evolution_rate(adoptions: usize, reflections: usize) -> f64 {
    let total = adoptions + reflections;
    if total < 2 {
        return 0.0;
    }
    let adoption_ratio = adoptions as f64 / total as f64;
    let reflection_ratio = reflections as f64 / total as f64;
    let balance = 1.0 - (adoption_ratio - reflection_ratio).abs();
    balance * (total as f64 / 10.0).min(1.0)
}

fn detect_patterns(metrics: &IdentityMetrics, start_id: u64, end_id: u64) -> Vec<TemporalPattern> {
    let mut patterns = Vec::new();

    if metrics.fragmentation_events > 0 {
        patterns.push(TemporalPattern {
            pattern_type: "identity_fragmentation".to_string(),
            confidence: (metrics.fragmentation_events as f64 / 5.0).min(1.0),
            time_range: (start_id, end_id),
            description: format!(
                "Detected {} identity fragmentation events",
                metrics.fragmentation_events
            ),
            metrics: json!({"fragmentation_count": metrics.fragmentation_events}),
            severity: if metrics.fragmentation_events > 2 {
                Severity::High
            } else {
                Severity::Medium
            },
        });
    }

    if metrics.coherence_gaps > 0 {
        patterns.push(TemporalPattern {
            pattern_type: "coherence_gaps".to_string(),
            confidence: (metrics.coherence_gaps as f64 / 3.0).min(1.0),
            time_range: (start_id, end_id),
            description: format!(
                "Found {} temporal gaps in identity continuity",
                metrics.coherence_gaps
            ),
            metrics: json!({"gap_count": metrics.coherence_gaps}),
            severity: Severity::Medium,
        });
    }

    if metrics.stability_score < 0.6 {
        patterns.push(TemporalPattern {
            pattern_type: "low_identity_stability".to_string(),
            confidence: 1.0 - metrics.stability_score,
            time_range: (start_id, end_id),
            description: format!(
                "Identity stability score: {:.2} (below threshold)",
                metrics.stability_score
            ),
            metrics: json!({"stability_score": metrics.stability_score}),
            severity: if metrics.stability_score < 0.4 {
                Severity::High
            } else {
                Severity::Medium
            },
        });
    }

    if metrics.identity_evolution_rate > 0.8 {
        patterns.push(TemporalPattern {
            pattern_type: "rapid_identity_evolution".to_string(),
            confidence: metrics.identity_evolution_rate,
            time_range: (start_id, end_id),
            description: format!(
                "Rapid identity evolution detected (rate: {:.2})",
                metrics.identity_evolution_rate
            ),
            metrics: json!({"evolution_rate": metrics.identity_evolution_rate}),
            severity: Severity::Low,
        });
    }

    patterns
}

fn detect_anomalies(metrics: &IdentityMetrics) -> Vec<String> {
    let mut anomalies = Vec::new();
    if metrics.fragmentation_events > 3 {
        anomalies.push(format!(
            "Critical identity fragmentation: {} events",
            metrics.fragmentation_events
        ));
    }
    if metrics.stability_score < 0.3 {
        anomalies.push(format!(
            "Extremely low identity stability: {:.2}",
            metrics.stability_score
        ));
    }
    if metrics.claim_consistency < 0.4 {
        anomalies.push(format!(
            "Poor claim-action consistency: {:.2}",
            metrics.claim_consistency
        ));
    }
    if metrics.coherence_gaps > 5 {
        anomalies.push(format!(
            "Excessive identity discontinuity: {} gaps",
            metrics.coherence_gaps
        ));
    }
    anomalies
}

fn generate_insights(metrics: &IdentityMetrics, patterns: &[TemporalPattern]) -> Vec<String> {
    let mut insights = Vec::new();
    if metrics.stability_score > 0.8 {
        insights.push("Strong identity stability with consistent self-expression patterns".into());
    }
    if metrics.reflection_density > 2.0 {
        insights
            .push("High reflection density indicates strong self-awareness and metacognition".into());
    } else if metrics.reflection_density < 0.5 {
        insights.push("Low reflection density may indicate reduced metacognitive processing".into());
    }
    if metrics.claim_consistency > 0.8 {
        insights.push("Excellent alignment between claimed identity and enacted behavior".into());
    } else if metrics.claim_consistency < 0.5 {
        insights.push("Misalignment between stated identity and behavioral commitments".into());
    }
    if metrics.identity_evolution_rate > 0.7 && metrics.stability_score > 0.6 {
        insights.push("Healthy identity evolution maintaining coherence during growth".into());
    }
    for pattern in patterns {
        match pattern.pattern_type.as_str() {
            "rapid_identity_evolution" => {
                insights.push("Active identity exploration and adaptation patterns detected".into());
            }
            "identity_fragmentation" => {
                insights
                    .push("Consider resolving identity contradictions for improved coherence".into());
            }
            _ => {}
        }
    }
    insights
}

fn are_contradictory(content1: &str, content2: &str) -> bool {
    CONTRADICTORY_PAIRS.iter().any(|(a, b)| {
        (content1.contains(a) && content2.contains(b))
            || (content1.contains(b) && content2.contains(a))
    })
}

fn is_fragmented_reflection(content: &str) -> bool {
    FRAGMENTED_INDICATORS
        .iter()
        .filter(|indicator| content.contains(*indicator))
        .count()
        >= 2
}

fn extract_themes(events: &[&Event]) -> BTreeSet<String> {
    let theme_keywords: &[(&str, &[&str])] = &[
        ("learning", &["learn", "study", "understand", "knowledge"]),
        ("growth", &["grow", "improve", "develop", "evolve"]),
        ("relationships", &["connect", "relate", "interact", "social"]),
        ("performance", &["achieve", "complete", "succeed", "accomplish"]),
        ("creativity", &["create", "design", "innovate", "imagine"]),
        ("stability", &["consistent", "stable", "reliable", "steady"]),
        ("exploration", &["explore", "discover", "investigate", "curious"]),
    ];
    let mut themes = BTreeSet::new();
    for event in events {
        let content = event.content.to_lowercase();
        for (theme, keywords) in theme_keywords {
            if keywords.iter().any(|k| content.contains(k)) {
                themes.insert(theme.to_string());
            }
        }
    }
    themes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn contradictory_adoptions_count_as_fragmentation() {
        let log = Arc::new(EventLog::in_memory());
        log.append("identity_adoption", "I am confident and direct", json!({})).unwrap();
        log.append("identity_adoption", "I am insecure about choices", json!({})).unwrap();

        let analyzer = IdentityCoherenceAnalyzer::new(log.clone());
        let result = analyzer.analyze_window(1, log.count());
        let frag = result.metrics.get("fragmentation_events").and_then(Value::as_u64);
        assert_eq!(frag, Some(1));
        assert!(result
            .patterns
            .iter()
            .any(|p| p.pattern_type == "identity_fragmentation"));
    }

    #[test]
    fn coherence_gaps_count_large_id_jumps() {
        let log = Arc::new(EventLog::in_memory());
        log.append("reflection", "steady thoughts", json!({})).unwrap();
        for _ in 0..60 {
            log.append("filler", "x", json!({})).unwrap();
        }
        log.append("reflection", "steady thoughts again", json!({})).unwrap();
        log.append("claim", "still here", json!({})).unwrap();

        let analyzer = IdentityCoherenceAnalyzer::new(log.clone());
        let result = analyzer.analyze_window(1, log.count());
        assert_eq!(
            result.metrics.get("coherence_gaps").and_then(Value::as_u64),
            Some(1)
        );
    }

    #[test]
    fn identical_reflections_are_stable() {
        let log = Arc::new(EventLog::in_memory());
        for _ in 0..3 {
            log.append("reflection", "learning about the ledger design", json!({})).unwrap();
        }
        let analyzer = IdentityCoherenceAnalyzer::new(log.clone());
        let result = analyzer.analyze_window(1, log.count());
        let stability = result
            .metrics
            .get("stability_score")
            .and_then(Value::as_f64)
            .unwrap();
        assert!(stability > 0.99);
        assert!(!result
            .patterns
            .iter()
            .any(|p| p.pattern_type == "low_identity_stability"));
    }

    #[test]
    fn divergent_reflections_trigger_low_stability() {
        let log = Arc::new(EventLog::in_memory());
        log.append("reflection", "alpha beta gamma delta", json!({})).unwrap();
        log.append("reflection", "epsilon zeta eta theta", json!({})).unwrap();
        let analyzer = IdentityCoherenceAnalyzer::new(log.clone());
        let result = analyzer.analyze_window(1, log.count());
        assert!(result
            .patterns
            .iter()
            .any(|p| p.pattern_type == "low_identity_stability"));
    }

    #[test]
    fn empty_window_yields_empty_result() {
        let log = Arc::new(EventLog::in_memory());
        log.append("filler", "x", json!({})).unwrap();
        let analyzer = IdentityCoherenceAnalyzer::new(log);
        let result = analyzer.analyze_window(1, 1);
        assert!(result.patterns.is_empty());
        assert_eq!(result.window.event_count, 0);
    }
}
