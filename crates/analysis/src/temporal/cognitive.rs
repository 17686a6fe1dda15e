//! Cognitive evolution mapping: concept emergence, ontology expansion vs.
//! consolidation, reflection-learning correlation, learning loops, attention
//! shifts, knowledge growth velocity.

use std::sync::Arc;

use serde_json::json;

use pmm_core::{Event, EventKind, EventLog};

use super::{AnalysisResult, AnalysisWindow, Severity, TemporalPattern};

/// A concept operation this close after a reflection, followed by another
/// reflection, forms a learning loop.
const LEARNING_LOOP_SPAN: usize = 10;

#[derive(Debug, Clone)]
pub struct LearningLoop {
    pub reflection_id: u64,
    pub concept_operations: Vec<u64>,
    pub closing_reflection_id: u64,
    pub loop_length: u64,
}

#[derive(Debug, Clone)]
pub struct AttentionShift {
    pub from_domain: String,
    pub to_domain: String,
    pub event_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CognitiveMetrics {
    pub concept_emergence_rate: f64,
    pub ontology_expansion_score: f64,
    pub reflection_learning_correlation: f64,
    pub learning_loop_patterns: Vec<LearningLoop>,
    pub attention_shifts: Vec<AttentionShift>,
    pub knowledge_growth_velocity: f64,
}

pub struct CognitiveEvolutionAnalyzer {
    log: Arc<EventLog>,
}

impl CognitiveEvolutionAnalyzer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    pub fn analyze_window(&self, start_id: u64, end_id: u64) -> AnalysisResult {
        let events = self.log.read_range(start_id, end_id, None);
        let cognitive_events: Vec<Event> = events
            .into_iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EventKind::ConceptDefine
                        | EventKind::ConceptAlias
                        | EventKind::ConceptBindEvent
                        | EventKind::ConceptRelate
                        | EventKind::Reflection
                        | EventKind::Claim
                        | EventKind::AssistantMessage
                        | EventKind::UserMessage
                )
            })
            .collect();

        if cognitive_events.is_empty() {
            return AnalysisResult::empty(start_id, end_id);
        }

        let metrics = compute_metrics(&cognitive_events, start_id, end_id);
        let patterns = detect_patterns(&metrics, start_id, end_id);
        let anomalies = detect_anomalies(&cognitive_events, &metrics);
        let insights = generate_insights(&metrics, &patterns);

        AnalysisResult {
            window: AnalysisWindow { start_id, end_id, event_count: cognitive_events.len() },
            patterns,
            anomalies,
            insights,
            metrics: json!({
                "concept_emergence_rate": metrics.concept_emergence_rate,
                "ontology_expansion_score": metrics.ontology_expansion_score,
                "reflection_learning_correlation": metrics.reflection_learning_correlation,
                "learning_loop_count": metrics.learning_loop_patterns.len(),
                "attention_shift_count": metrics.attention_shifts.len(),
                "knowledge_growth_velocity": metrics.knowledge_growth_velocity,
            }),
        }
    }
}

fn is_concept_op(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::ConceptDefine
            | EventKind::ConceptAlias
            | EventKind::ConceptBindEvent
            | EventKind::ConceptRelate
    )
}

fn compute_metrics(events: &[Event], start_id: u64, end_id: u64) -> CognitiveMetrics {
    let concept_events: Vec<&Event> =
        events.iter().filter(|e| is_concept_op(e.kind)).collect();
    let reflections: Vec<&Event> =
        events.iter().filter(|e| e.kind == EventKind::Reflection).collect();
    let messages: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::AssistantMessage | EventKind::UserMessage))
        .collect();

    let total_window = end_id.saturating_sub(start_id) + 1;
    let definitions = concept_events
        .iter()
        .filter(|e| e.kind == EventKind::ConceptDefine)
        .count();
    let emergence_rate = definitions as f64 / total_window.max(1) as f64;

    let relations = concept_events
        .iter()
        .filter(|e| e.kind == EventKind::ConceptRelate)
        .count();
    let expansion_score = if concept_events.is_empty() {
        0.0
    } else {
        (definitions + relations) as f64 / concept_events.len() as f64
    };

    let reflection_density = reflections.len() as f64 / events.len().max(1) as f64;
    let learning_indicators = events
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                EventKind::ConceptDefine | EventKind::ConceptRelate | EventKind::Claim
            )
        })
        .count();
    let learning_rate = learning_indicators as f64 / events.len().max(1) as f64;
    let correlation = if reflections.is_empty() { 0.0 } else { reflection_density * learning_rate };

    let velocity = if concept_events.is_empty() || messages.is_empty() {
        0.0
    } else {
        concept_events.len() as f64 / messages.len() as f64
    };

    CognitiveMetrics {
        concept_emergence_rate: emergence_rate,
        ontology_expansion_score: expansion_score,
        reflection_learning_correlation: correlation,
        learning_loop_patterns: detect_learning_loops(events),
        attention_shifts: detect_attention_shifts(events),
        knowledge_growth_velocity: velocity,
    }
}

/// Reflection → concept op(s) → reflection within a short span.
fn detect_learning_loops(events: &[Event]) -> Vec<LearningLoop> {
    let mut sorted: Vec<&Event> = events.iter().collect();
    sorted.sort_by_key(|e| e.id);

    let mut loops = Vec::new();
    for (i, event) in sorted.iter().enumerate() {
        if event.kind != EventKind::Reflection {
            continue;
        }
        let mut ops: Vec<u64> = Vec::new();
        for next in sorted.iter().skip(i + 1).take(LEARNING_LOOP_SPAN - 1) {
            if matches!(next.kind, EventKind::ConceptDefine | EventKind::ConceptRelate) {
                ops.push(next.id);
            } else if next.kind == EventKind::Reflection && !ops.is_empty() {
                loops.push(LearningLoop {
                    reflection_id: event.id,
                    concept_operations: ops.clone(),
                    closing_reflection_id: next.id,
                    loop_length: next.id - event.id,
                });
                break;
            }
        }
    }
    loops
}

fn detect_attention_shifts(events: &[Event]) -> Vec<AttentionShift> {
    let mut sorted: Vec<&Event> = events.iter().collect();
    sorted.sort_by_key(|e| e.id);

    let domains: Vec<String> = sorted.iter().map(|e| extract_domain(&e.content)).collect();
    let mut shifts = Vec::new();
    for i in 1..domains.len() {
        if domains[i] != domains[i - 1] {
            shifts.push(AttentionShift {
                from_domain: domains[i - 1].clone(),
                to_domain: domains[i].clone(),
                event_id: sorted[i].id,
            });
        }
    }
    shifts
}

fn detect_patterns(metrics: &CognitiveMetrics, start_id: u64, end_id: u64) -> Vec<TemporalPattern> {
    let mut patterns = Vec::new();

    if metrics.concept_emergence_rate > 0.1 {
        patterns.push(TemporalPattern {
            pattern_type: "rapid_concept_emergence".to_string(),
            confidence: (metrics.concept_emergence_rate * 5.0).min(1.0),
            time_range: (start_id, end_id),
            description: format!(
                "High concept emergence rate: {:.3} concepts per event",
                metrics.concept_emergence_rate
            ),
            metrics: json!({"emergence_rate": metrics.concept_emergence_rate}),
            severity: Severity::Low,
        });
    }

    if metrics.ontology_expansion_score > 0.7 {
        patterns.push(TemporalPattern {
            pattern_type: "ontology_expansion".to_string(),
            confidence: metrics.ontology_expansion_score,
            time_range: (start_id, end_id),
            description: format!(
                "Active ontology expansion phase (score: {:.2})",
                metrics.ontology_expansion_score
            ),
            metrics: json!({"expansion_score": metrics.ontology_expansion_score}),
            severity: Severity::Low,
        });
    } else if metrics.ontology_expansion_score < 0.3 {
        patterns.push(TemporalPattern {
            pattern_type: "ontology_consolidation".to_string(),
            confidence: 1.0 - metrics.ontology_expansion_score,
            time_range: (start_id, end_id),
            description: format!(
                "Ontology consolidation phase (score: {:.2})",
                metrics.ontology_expansion_score
            ),
            metrics: json!({"expansion_score": metrics.ontology_expansion_score}),
            severity: Severity::Low,
        });
    }

    if !metrics.learning_loop_patterns.is_empty() {
        patterns.push(TemporalPattern {
            pattern_type: "learning_loops".to_string(),
            confidence: (metrics.learning_loop_patterns.len() as f64 * 0.3).min(1.0),
            time_range: (start_id, end_id),
            description: format!(
                "Detected {} learning loops",
                metrics.learning_loop_patterns.len()
            ),
            metrics: json!({"loop_count": metrics.learning_loop_patterns.len()}),
            severity: Severity::Low,
        });
    }

    if metrics.attention_shifts.len() > 5 {
        patterns.push(TemporalPattern {
            pattern_type: "frequent_attention_shifts".to_string(),
            confidence: (metrics.attention_shifts.len() as f64 * 0.1).min(1.0),
            time_range: (start_id, end_id),
            description: format!(
                "Frequent attention shifts: {} domain changes",
                metrics.attention_shifts.len()
            ),
            metrics: json!({"shift_count": metrics.attention_shifts.len()}),
            severity: Severity::Medium,
        });
    }

    if metrics.reflection_learning_correlation > 0.5 {
        patterns.push(TemporalPattern {
            pattern_type: "reflective_learning".to_string(),
            confidence: metrics.reflection_learning_correlation,
            time_range: (start_id, end_id),
            description: format!(
                "Strong reflection-learning correlation: {:.2}",
                metrics.reflection_learning_correlation
            ),
            metrics: json!({"correlation": metrics.reflection_learning_correlation}),
            severity: Severity::Low,
        });
    }

    patterns
}

fn detect_anomalies(events: &[Event], metrics: &CognitiveMetrics) -> Vec<String> {
    let mut anomalies = Vec::new();
    if metrics.concept_emergence_rate > 0.5 {
        anomalies.push(format!(
            "Extreme concept emergence rate: {:.3}",
            metrics.concept_emergence_rate
        ));
    }
    if metrics.reflection_learning_correlation < 0.1 && events.len() > 10 {
        anomalies.push(format!(
            "Poor reflection-learning integration: {:.2}",
            metrics.reflection_learning_correlation
        ));
    }
    if metrics.attention_shifts.len() > 10 {
        anomalies.push(format!(
            "Excessive attention shifting: {} domain changes",
            metrics.attention_shifts.len()
        ));
    }
    anomalies
}

fn generate_insights(metrics: &CognitiveMetrics, patterns: &[TemporalPattern]) -> Vec<String> {
    let mut insights = Vec::new();

    if metrics.concept_emergence_rate > 0.2 {
        insights.push("Active concept formation and vocabulary expansion".into());
    } else if metrics.concept_emergence_rate < 0.05 {
        insights.push("Stable conceptual framework with limited new concept formation".into());
    }

    if metrics.ontology_expansion_score > 0.6 {
        insights.push("Exploration phase: actively building new conceptual connections".into());
    } else if metrics.ontology_expansion_score < 0.4 {
        insights.push("Consolidation phase: strengthening existing conceptual framework".into());
    }

    if !metrics.learning_loop_patterns.is_empty() {
        insights.push(format!(
            "Structured learning patterns: {} reflective learning loops",
            metrics.learning_loop_patterns.len()
        ));
    }

    if metrics.reflection_learning_correlation > 0.6 {
        insights.push("Strong metacognitive integration between reflection and learning".into());
    } else if metrics.reflection_learning_correlation < 0.2 {
        insights.push("Consider strengthening connection between reflection and action".into());
    }

    if !metrics.attention_shifts.is_empty() {
        let unique: std::collections::BTreeSet<&str> = metrics
            .attention_shifts
            .iter()
            .map(|s| s.to_domain.as_str())
            .collect();
        insights.push(format!("Attention spans {} conceptual domains", unique.len()));
    }

    if metrics.knowledge_growth_velocity > 1.0 {
        insights.push("High knowledge acquisition velocity".into());
    } else if metrics.knowledge_growth_velocity < 0.2 {
        insights.push("Measured knowledge acquisition pace".into());
    }

    for pattern in patterns {
        match pattern.pattern_type.as_str() {
            "learning_loops" => insights.push("Effective reflective learning cycles detected".into()),
            "frequent_attention_shifts" => {
                insights.push("Consider focusing attention for deeper learning".into())
            }
            _ => {}
        }
    }

    insights
}

/// Fixed lexicon mapping content to its dominant conceptual domain.
pub fn extract_domain(content: &str) -> String {
    let domain_keywords: &[(&str, &[&str])] = &[
        ("technical", &["code", "algorithm", "system", "technical", "programming", "software"]),
        ("personal", &["feel", "emotion", "personal", "myself", "identity", "character"]),
        ("learning", &["learn", "study", "understand", "knowledge", "education", "research"]),
        ("work", &["work", "project", "task", "job", "career", "professional"]),
        ("social", &["people", "relationship", "social", "friend", "family", "community"]),
        ("creative", &["create", "design", "art", "creative", "imagine", "innovate"]),
        ("analytical", &["analyze", "data", "logic", "reason", "think", "consider"]),
        ("health", &["health", "body", "exercise", "wellness", "medical", "physical"]),
        ("philosophical", &["meaning", "purpose", "philosophy", "existential", "life", "value"]),
    ];

    let content = content.to_lowercase();
    let mut best: Option<(&str, usize)> = None;
    for (domain, keywords) in domain_keywords {
        let score = keywords.iter().filter(|k| content.contains(*k)).count();
        if score > 0 {
            best = match best {
                Some((_, prev)) if prev >= score => best,
                _ => Some((domain, score)),
            };
        }
    }
    best.map(|(d, _)| d.to_string()).unwrap_or_else(|| "general".to_string())
}
