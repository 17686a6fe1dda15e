//! Commitment lifecycle pattern recognition: creation rhythm, completion
//! cycles, theme recurrence, cascades, clustering, bursts.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use pmm_core::{Event, EventKind, EventLog};

use super::{mean, stdev, AnalysisResult, AnalysisWindow, Severity, TemporalPattern};

/// Opens within this many events of each other may form a cascade.
const CASCADE_GAP_EVENTS: u64 = 10;
/// A burst is this many opens...
const BURST_OPENS: usize = 5;
/// ...within this many events.
const BURST_SPAN_EVENTS: u64 = 10;

#[derive(Debug, Clone)]
pub struct CascadeLink {
    pub parent_id: u64,
    pub child_id: u64,
    pub gap: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CommitmentTemporalMetrics {
    pub creation_rhythm: BTreeMap<String, f64>,
    pub completion_cycles: BTreeMap<String, f64>,
    pub theme_recurrence: BTreeMap<String, usize>,
    pub cascade_patterns: Vec<CascadeLink>,
    pub clustering_score: f64,
    pub burst_events: Vec<(u64, u64)>,
}

pub struct CommitmentPatternAnalyzer {
    log: Arc<EventLog>,
}

impl CommitmentPatternAnalyzer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    pub fn analyze_window(&self, start_id: u64, end_id: u64) -> AnalysisResult {
        let events = self.log.read_range(start_id, end_id, None);
        let commitment_events: Vec<Event> = events
            .into_iter()
            .filter(|e| {
                matches!(e.kind, EventKind::CommitmentOpen | EventKind::CommitmentClose)
            })
            .collect();

        if commitment_events.is_empty() {
            return AnalysisResult::empty(start_id, end_id);
        }

        let metrics = compute_temporal_metrics(&commitment_events);
        let patterns = detect_patterns(&metrics, start_id, end_id);
        let anomalies = detect_anomalies(&metrics);
        let insights = generate_insights(&metrics, &patterns);

        AnalysisResult {
            window: AnalysisWindow { start_id, end_id, event_count: commitment_events.len() },
            patterns,
            anomalies,
            insights,
            metrics: json!({
                "creation_rhythm": metrics.creation_rhythm,
                "completion_cycles": metrics.completion_cycles,
                "theme_recurrence": metrics.theme_recurrence,
                "cascade_count": metrics.cascade_patterns.len(),
                "clustering_score": metrics.clustering_score,
                "burst_count": metrics.burst_events.len(),
            }),
        }
    }
}

fn compute_temporal_metrics(commitment_events: &[Event]) -> CommitmentTemporalMetrics {
    let opens: Vec<&Event> = commitment_events
        .iter()
        .filter(|e| e.kind == EventKind::CommitmentOpen)
        .collect();
    let closes: Vec<&Event> = commitment_events
        .iter()
        .filter(|e| e.kind == EventKind::CommitmentClose)
        .collect();

    CommitmentTemporalMetrics {
        creation_rhythm: creation_rhythms(&opens),
        completion_cycles: completion_cycles(&closes),
        theme_recurrence: theme_recurrence(&opens),
        cascade_patterns: detect_cascades(&opens),
        clustering_score: clustering_score(&opens),
        burst_events: detect_bursts(&opens),
    }
}

/// Position-segment rhythm: share of opens in each quarter of the sequence.
fn creation_rhythms(opens: &[&Event]) -> BTreeMap<String, f64> {
    let mut rhythms = BTreeMap::new();
    if opens.is_empty() {
        return rhythms;
    }
    let total = opens.len();
    let segment_size = total as f64 / 4.0;
    for i in 0..4 {
        let start_idx = (i as f64 * segment_size) as usize;
        let end_idx = ((i + 1) as f64 * segment_size) as usize;
        let count = opens[start_idx.min(total)..end_idx.min(total)].len();
        rhythms.insert(format!("segment_{}", i + 1), count as f64 / total as f64);
    }
    rhythms.insert("creation_rate".to_string(), total as f64);
    rhythms
}

fn completion_cycles(closes: &[&Event]) -> BTreeMap<String, f64> {
    let mut cycles = BTreeMap::new();
    if closes.is_empty() {
        return cycles;
    }
    let scores: Vec<f64> = closes
        .iter()
        .filter(|e| e.meta_str("cid").is_some())
        .map(|e| e.meta_f64("outcome_score").unwrap_or(1.0))
        .collect();
    if scores.is_empty() {
        return cycles;
    }
    cycles.insert("overall_success".to_string(), mean(&scores));
    cycles.insert("success_variance".to_string(), stdev(&scores));
    let trend = if scores.len() >= 3 {
        let third = scores.len() / 3;
        mean(&scores[scores.len() - third..]) - mean(&scores[..third])
    } else {
        0.0
    };
    cycles.insert("success_trend".to_string(), trend);
    cycles
}

fn theme_recurrence(opens: &[&Event]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for event in opens {
        for theme in extract_commitment_themes(&event.content) {
            *counts.entry(theme).or_insert(0) += 1;
        }
    }
    counts
}

/// Same-theme (or causally-worded) opens within a short id span.
fn detect_cascades(opens: &[&Event]) -> Vec<CascadeLink> {
    let mut cascades = Vec::new();
    let mut sorted: Vec<&&Event> = opens.iter().collect();
    sorted.sort_by_key(|e| e.id);

    for (i, open) in sorted.iter().enumerate() {
        let followers = sorted
            .iter()
            .skip(i + 1)
            .take(4)
            .filter(|e| e.id - open.id <= CASCADE_GAP_EVENTS);
        for follower in followers {
            if are_commitment_related(&open.content, &follower.content) {
                cascades.push(CascadeLink {
                    parent_id: open.id,
                    child_id: follower.id,
                    gap: follower.id - open.id,
                });
                break;
            }
        }
    }
    cascades
}

/// `1 − avg_gap / max_gap` over consecutive opens; higher is more clustered.
fn clustering_score(opens: &[&Event]) -> f64 {
    if opens.len() < 2 {
        return 0.0;
    }
    let mut ids: Vec<u64> = opens.iter().map(|e| e.id).collect();
    ids.sort_unstable();
    let gaps: Vec<f64> = ids.windows(2).map(|p| (p[1] - p[0]) as f64).collect();
    let max_gap = gaps.iter().cloned().fold(0.0_f64, f64::max);
    if max_gap > 0.0 {
        1.0 - mean(&gaps) / max_gap
    } else {
        0.0
    }
}

fn detect_bursts(opens: &[&Event]) -> Vec<(u64, u64)> {
    if opens.len() < 3 {
        return Vec::new();
    }
    let mut ids: Vec<u64> = opens.iter().map(|e| e.id).collect();
    ids.sort_unstable();
    let mut bursts = Vec::new();
    if ids.len() >= BURST_OPENS {
        for window in ids.windows(BURST_OPENS) {
            let start = window[0];
            let end = window[BURST_OPENS - 1];
            if end - start <= BURST_SPAN_EVENTS {
                bursts.push((start, end));
            }
        }
    }
    bursts
}

fn detect_patterns(
    metrics: &CommitmentTemporalMetrics,
    start_id: u64,
    end_id: u64,
) -> Vec<TemporalPattern> {
    let mut patterns = Vec::new();

    if metrics.clustering_score > 0.7 {
        patterns.push(TemporalPattern {
            pattern_type: "commitment_clustering".to_string(),
            confidence: metrics.clustering_score,
            time_range: (start_id, end_id),
            description: format!(
                "High commitment clustering detected (score: {:.2})",
                metrics.clustering_score
            ),
            metrics: json!({"clustering_score": metrics.clustering_score}),
            severity: Severity::Medium,
        });
    }

    if !metrics.burst_events.is_empty() {
        patterns.push(TemporalPattern {
            pattern_type: "commitment_burst".to_string(),
            confidence: (metrics.burst_events.len() as f64 * 0.2).min(1.0),
            time_range: (start_id, end_id),
            description: format!(
                "Detected {} commitment creation bursts",
                metrics.burst_events.len()
            ),
            metrics: json!({"burst_count": metrics.burst_events.len()}),
            severity: Severity::Medium,
        });
    }

    let recurring: BTreeMap<&String, usize> = metrics
        .theme_recurrence
        .iter()
        .filter(|(_, count)| **count >= 3)
        .map(|(theme, count)| (theme, *count))
        .collect();
    if let Some((top_theme, top_count)) =
        recurring.iter().max_by_key(|(theme, count)| (*count, std::cmp::Reverse(*theme)))
    {
        patterns.push(TemporalPattern {
            pattern_type: "recurring_theme".to_string(),
            confidence: *top_count as f64 / metrics.theme_recurrence.len().max(1) as f64,
            time_range: (start_id, end_id),
            description: format!(
                "Recurring commitment theme: '{top_theme}' (appears {top_count} times)"
            ),
            metrics: json!({"theme": top_theme, "count": top_count}),
            severity: Severity::Low,
        });
    }

    if let Some(trend) = metrics.completion_cycles.get("success_trend") {
        if trend.abs() > 0.2 {
            let direction = if *trend > 0.0 { "improving" } else { "declining" };
            patterns.push(TemporalPattern {
                pattern_type: "success_cycle".to_string(),
                confidence: (trend.abs() * 2.0).min(1.0),
                time_range: (start_id, end_id),
                description: format!(
                    "{} commitment success trend ({trend:.2})",
                    capitalize(direction)
                ),
                metrics: json!({"trend": trend, "direction": direction}),
                severity: if *trend > 0.0 { Severity::Low } else { Severity::Medium },
            });
        }
    }

    patterns
}

fn detect_anomalies(metrics: &CommitmentTemporalMetrics) -> Vec<String> {
    let mut anomalies = Vec::new();
    if metrics.clustering_score > 0.9 {
        anomalies.push(format!(
            "Extreme commitment clustering detected (score: {:.2})",
            metrics.clustering_score
        ));
    }
    if let Some(success) = metrics.completion_cycles.get("overall_success") {
        if *success < 0.3 {
            anomalies.push(format!("Very low commitment success rate: {success:.2}"));
        }
    }
    if metrics.cascade_patterns.len() > 5 {
        anomalies.push(format!(
            "High commitment cascade complexity: {} cascades",
            metrics.cascade_patterns.len()
        ));
    }
    anomalies
}

fn generate_insights(
    metrics: &CommitmentTemporalMetrics,
    patterns: &[TemporalPattern],
) -> Vec<String> {
    let mut insights = Vec::new();

    if metrics.clustering_score > 0.6 {
        insights.push(
            "Commitments tend to be created in clustered bursts rather than evenly distributed"
                .into(),
        );
    } else if metrics.clustering_score < 0.3 {
        insights.push("Commitments are created with good temporal distribution".into());
    }

    if !metrics.theme_recurrence.is_empty() {
        let mut top: Vec<(&String, &usize)> = metrics.theme_recurrence.iter().collect();
        top.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let names: Vec<&str> = top.iter().take(3).map(|(t, _)| t.as_str()).collect();
        insights.push(format!("Primary commitment themes: {}", names.join(", ")));
    }

    if let Some(trend) = metrics.completion_cycles.get("success_trend") {
        if *trend > 0.1 {
            insights.push("Commitment execution is improving over time".into());
        } else if *trend < -0.1 {
            insights.push("Commitment execution quality is declining".into());
        }
    }

    if !metrics.cascade_patterns.is_empty() {
        insights.push(format!(
            "Detected {} commitment dependency chains",
            metrics.cascade_patterns.len()
        ));
    }
    if !metrics.burst_events.is_empty() {
        insights.push(format!(
            "Periods of high commitment creation activity detected ({} bursts)",
            metrics.burst_events.len()
        ));
    }

    for pattern in patterns {
        if pattern.pattern_type == "recurring_theme" {
            let theme = pattern
                .metrics
                .get("theme")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            insights.push(format!("Consistent focus on '{theme}' theme"));
        } else if pattern.pattern_type == "success_cycle"
            && pattern.metrics.get("direction").and_then(Value::as_str) == Some("improving")
        {
            insights.push("Positive development in commitment execution capability".into());
        }
    }

    insights
}

fn extract_commitment_themes(content: &str) -> Vec<String> {
    let theme_keywords: &[(&str, &[&str])] = &[
        ("learning", &["learn", "study", "understand", "research", "read"]),
        ("creation", &["create", "build", "make", "develop", "design"]),
        ("improvement", &["improve", "optimize", "enhance", "refine", "better"]),
        ("organization", &["organize", "plan", "structure", "arrange", "system"]),
        ("communication", &["communicate", "write", "explain", "share", "discuss"]),
        ("problem_solving", &["solve", "fix", "resolve", "address", "handle"]),
        ("analysis", &["analyze", "examine", "review", "assess", "evaluate"]),
        ("relationships", &["connect", "collaborate", "support", "help", "assist"]),
        ("health", &["exercise", "health", "wellness", "care", "rest"]),
        ("productivity", &["complete", "finish", "achieve", "accomplish", "produce"]),
    ];
    let content = content.to_lowercase();
    theme_keywords
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| content.contains(k)))
        .map(|(theme, _)| theme.to_string())
        .collect()
}

fn are_commitment_related(content1: &str, content2: &str) -> bool {
    let themes1: std::collections::BTreeSet<String> =
        extract_commitment_themes(content1).into_iter().collect();
    let themes2: std::collections::BTreeSet<String> =
        extract_commitment_themes(content2).into_iter().collect();
    if themes1.intersection(&themes2).next().is_some() {
        return true;
    }

    let causal_pairs = [
        ("because", "therefore"),
        ("since", "next"),
        ("after", "then"),
        ("first", "second"),
        ("before", "after"),
    ];
    let c1 = content1.to_lowercase();
    let c2 = content2.to_lowercase();
    causal_pairs
        .iter()
        .any(|(first, second)| c1.contains(first) && c2.contains(second))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
