//! Temporal rhythm analysis: activity intensity, engagement periods, daily
//! and weekly cycles (by event position), retrieval patterns, predictability
//! and entropy.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use pmm_core::{Event, EventKind, EventLog};

use super::{mean, stdev, AnalysisResult, AnalysisWindow, Severity, TemporalPattern};

#[derive(Debug, Clone)]
pub struct EngagementPeriod {
    pub start_event: u64,
    pub end_event: u64,
    pub intensity: f64,
    pub period_type: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct RhythmMetrics {
    pub daily_cycle: BTreeMap<String, f64>,
    pub weekly_cycle: BTreeMap<String, f64>,
    pub engagement_periods: Vec<EngagementPeriod>,
    pub retrieval_patterns: BTreeMap<String, f64>,
    pub predictability_score: f64,
    pub entropy_score: f64,
}

pub struct RhythmAnalyzer {
    log: Arc<EventLog>,
}

impl RhythmAnalyzer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    pub fn analyze_window(&self, start_id: u64, end_id: u64) -> AnalysisResult {
        let events = self.log.read_range(start_id, end_id, None);
        let rhythm_events: Vec<Event> = events
            .into_iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EventKind::UserMessage
                        | EventKind::AssistantMessage
                        | EventKind::Reflection
                        | EventKind::CommitmentOpen
                        | EventKind::CommitmentClose
                        | EventKind::RetrievalSelection
                        | EventKind::ConceptDefine
                        | EventKind::ConceptBindEvent
                )
            })
            .collect();

        if rhythm_events.is_empty() {
            return AnalysisResult::empty(start_id, end_id);
        }

        let metrics = compute_rhythm_metrics(&rhythm_events);
        let patterns = detect_patterns(&metrics, start_id, end_id);
        let anomalies = detect_anomalies(&metrics);
        let insights = generate_insights(&metrics, &patterns);

        AnalysisResult {
            window: AnalysisWindow { start_id, end_id, event_count: rhythm_events.len() },
            patterns,
            anomalies,
            insights,
            metrics: json!({
                "daily_cycle": metrics.daily_cycle,
                "weekly_cycle": metrics.weekly_cycle,
                "engagement_period_count": metrics.engagement_periods.len(),
                "retrieval_patterns": metrics.retrieval_patterns,
                "predictability_score": metrics.predictability_score,
                "entropy_score": metrics.entropy_score,
            }),
        }
    }

    /// Raw metrics for consumers that need the numbers without the pattern
    /// wrapping (the supervisor's adaptive interval).
    pub fn window_metrics(&self, start_id: u64, end_id: u64) -> RhythmMetrics {
        let events = self.log.read_range(start_id, end_id, None);
        compute_rhythm_metrics(&events)
    }
}

/// Per-kind engagement weights, plus a small content-length term.
pub fn activity_intensity(events: &[Event]) -> f64 {
    if events.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    for event in events {
        let score = match event.kind {
            EventKind::Reflection => 2.0,
            EventKind::CommitmentOpen | EventKind::CommitmentClose => 1.5,
            EventKind::RetrievalSelection => 2.0,
            EventKind::ConceptDefine => 2.5,
            EventKind::ConceptBindEvent => 2.0,
            _ => 1.0,
        };
        let content_length = event.content.chars().count() as f64 / 100.0;
        total += score + content_length * 0.1;
    }
    total / events.len() as f64
}

fn compute_rhythm_metrics(events: &[Event]) -> RhythmMetrics {
    if events.is_empty() {
        return RhythmMetrics::default();
    }
    RhythmMetrics {
        daily_cycle: position_cycle(events, 4, "segment"),
        weekly_cycle: weekly_cycle(events),
        engagement_periods: identify_engagement_periods(events),
        retrieval_patterns: retrieval_patterns(events),
        predictability_score: predictability(events),
        entropy_score: interval_entropy(events),
    }
}

/// Intensity per equal position segment (quarters for the daily proxy).
fn position_cycle(events: &[Event], segments: usize, label: &str) -> BTreeMap<String, f64> {
    let mut cycle = BTreeMap::new();
    let segment_size = events.len() as f64 / segments as f64;
    for i in 0..segments {
        let start = (i as f64 * segment_size) as usize;
        let end = ((i + 1) as f64 * segment_size) as usize;
        let slice = &events[start.min(events.len())..end.min(events.len())];
        cycle.insert(format!("{label}_{}", i + 1), activity_intensity(slice));
    }
    cycle
}

fn weekly_cycle(events: &[Event]) -> BTreeMap<String, f64> {
    if events.len() < 7 {
        let mut cycle = BTreeMap::new();
        cycle.insert("insufficient_data".to_string(), 0.0);
        return cycle;
    }
    position_cycle(events, 7, "day")
}

/// Sliding-window engagement classification against the 25/75 percentiles of
/// all window intensities.
fn identify_engagement_periods(events: &[Event]) -> Vec<EngagementPeriod> {
    if events.len() < 10 {
        return Vec::new();
    }
    let window_size = (events.len() / 10).max(5);
    let mut sorted: Vec<&Event> = events.iter().collect();
    sorted.sort_by_key(|e| e.id);

    let window_count = sorted.len() - window_size + 1;
    let intensities: Vec<f64> = (0..window_count)
        .map(|i| {
            let window: Vec<Event> =
                sorted[i..i + window_size].iter().map(|e| (*e).clone()).collect();
            activity_intensity(&window)
        })
        .collect();

    let mut ranked = intensities.clone();
    ranked.sort_by(|a, b| a.total_cmp(b));
    let n = ranked.len();
    let threshold_high = ranked[(0.75 * (n - 1) as f64) as usize];
    let threshold_low = ranked[(0.25 * (n - 1) as f64) as usize];

    (0..window_count)
        .map(|i| {
            let intensity = intensities[i];
            let period_type = if intensity >= threshold_high {
                "high_engagement"
            } else if intensity <= threshold_low {
                "low_engagement"
            } else {
                "medium_engagement"
            };
            EngagementPeriod {
                start_event: sorted[i].id,
                end_event: sorted[i + window_size - 1].id,
                intensity,
                period_type,
            }
        })
        .collect()
}

fn retrieval_patterns(events: &[Event]) -> BTreeMap<String, f64> {
    let mut patterns = BTreeMap::new();
    let retrieval_ids: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == EventKind::RetrievalSelection)
        .map(|e| e.id)
        .collect();

    patterns.insert(
        "retrieval_frequency".to_string(),
        retrieval_ids.len() as f64 / events.len().max(1) as f64,
    );
    if retrieval_ids.len() >= 2 {
        let gaps: Vec<f64> = retrieval_ids.windows(2).map(|p| (p[1] - p[0]) as f64).collect();
        patterns.insert("avg_retrieval_gap".to_string(), mean(&gaps));
        patterns.insert("retrieval_regularity".to_string(), 1.0 / (stdev(&gaps) + 1.0));
    }
    patterns
}

/// `1 − H/Hmax` over the kind distribution; 1.0 means fully regular.
fn predictability(events: &[Event]) -> f64 {
    if events.len() < 4 {
        return 0.0;
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for event in events {
        *counts.entry(event.kind.as_str()).or_insert(0) += 1;
    }
    let total = events.len() as f64;
    let entropy: f64 = counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum();
    let max_entropy = (counts.len() as f64).log2();
    if max_entropy > 0.0 {
        1.0 - entropy / max_entropy
    } else {
        1.0
    }
}

/// Shannon entropy over inter-event id intervals.
fn interval_entropy(events: &[Event]) -> f64 {
    if events.len() < 2 {
        return 0.0;
    }
    let mut ids: Vec<u64> = events.iter().map(|e| e.id).collect();
    ids.sort_unstable();
    let intervals: Vec<u64> = ids.windows(2).map(|p| p[1] - p[0]).collect();
    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for interval in &intervals {
        *counts.entry(*interval).or_insert(0) += 1;
    }
    let total = intervals.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

fn detect_patterns(metrics: &RhythmMetrics, start_id: u64, end_id: u64) -> Vec<TemporalPattern> {
    let mut patterns = Vec::new();

    if metrics.predictability_score > 0.7 {
        patterns.push(TemporalPattern {
            pattern_type: "high_predictability".to_string(),
            confidence: metrics.predictability_score,
            time_range: (start_id, end_id),
            description: format!(
                "Highly predictable activity patterns (score: {:.2})",
                metrics.predictability_score
            ),
            metrics: json!({"predictability": metrics.predictability_score}),
            severity: Severity::Low,
        });
        if metrics.entropy_score < 1.0 {
            patterns.push(TemporalPattern {
                pattern_type: "high_regularity".to_string(),
                confidence: 1.0 - metrics.entropy_score / 3.0,
                time_range: (start_id, end_id),
                description: format!(
                    "High regularity in activity patterns (entropy: {:.2})",
                    metrics.entropy_score
                ),
                metrics: json!({"entropy": metrics.entropy_score}),
                severity: Severity::Low,
            });
        }
    }

    let daily_values: Vec<f64> = metrics.daily_cycle.values().copied().collect();
    if daily_values.len() >= 4 {
        let variance = stdev(&daily_values);
        let mean_intensity = mean(&daily_values);
        if mean_intensity > 0.0 && variance > mean_intensity * 0.3 {
            patterns.push(TemporalPattern {
                pattern_type: "daily_rhythm".to_string(),
                confidence: (variance / mean_intensity).min(1.0),
                time_range: (start_id, end_id),
                description: format!("Strong daily rhythm with {variance:.2} variance"),
                metrics: json!({"daily_variance": variance, "daily_mean": mean_intensity}),
                severity: Severity::Low,
            });
        }
    }

    let high_count = metrics
        .engagement_periods
        .iter()
        .filter(|p| p.period_type == "high_engagement")
        .count();
    if high_count > 0 {
        let total = metrics.engagement_periods.len().max(1);
        patterns.push(TemporalPattern {
            pattern_type: "engagement_periods".to_string(),
            confidence: high_count as f64 / total as f64,
            time_range: (start_id, end_id),
            description: format!("Identified {high_count} high engagement periods"),
            metrics: json!({"high_engagement_count": high_count, "total_periods": total}),
            severity: Severity::Medium,
        });
    }

    patterns
}

fn detect_anomalies(metrics: &RhythmMetrics) -> Vec<String> {
    let mut anomalies = Vec::new();
    if metrics.predictability_score < 0.3 {
        anomalies.push(format!(
            "Very low pattern predictability: {:.2}",
            metrics.predictability_score
        ));
    }
    if metrics.entropy_score > 3.0 {
        anomalies.push(format!(
            "High entropy in activity patterns: {:.2}",
            metrics.entropy_score
        ));
    }
    if let Some(freq) = metrics.retrieval_patterns.get("retrieval_frequency") {
        if *freq > 0.5 {
            anomalies.push(format!("Excessive memory retrieval: {freq:.2} frequency"));
        }
    }
    anomalies
}

fn generate_insights(metrics: &RhythmMetrics, patterns: &[TemporalPattern]) -> Vec<String> {
    let mut insights = Vec::new();

    if metrics.predictability_score > 0.8 {
        insights.push("Highly regular and predictable activity patterns".into());
    } else if metrics.predictability_score < 0.4 {
        insights.push("Irregular and unpredictable activity patterns".into());
    } else {
        insights.push("Moderately regular activity patterns".into());
    }

    let daily_values: Vec<f64> = metrics.daily_cycle.values().copied().collect();
    if daily_values.len() >= 4 {
        let max = daily_values.iter().cloned().fold(f64::MIN, f64::max);
        let min = daily_values.iter().cloned().fold(f64::MAX, f64::min);
        if max > min * 2.0 {
            insights.push("Strong daily activity variations - consider workload balancing".into());
        }
    }

    if !metrics.weekly_cycle.contains_key("insufficient_data") && metrics.weekly_cycle.len() >= 7 {
        insights.push("Weekly activity patterns detected".into());
    }

    if !metrics.engagement_periods.is_empty() {
        let high = metrics
            .engagement_periods
            .iter()
            .filter(|p| p.period_type == "high_engagement")
            .count();
        let total = metrics.engagement_periods.len();
        if high as f64 / total as f64 > 0.3 {
            insights.push("Multiple periods of high cognitive engagement detected".into());
        } else if high == 0 {
            insights.push("Consistent engagement without distinct high-intensity periods".into());
        }
    }

    if let Some(freq) = metrics.retrieval_patterns.get("retrieval_frequency") {
        if *freq > 0.3 {
            insights.push("Active memory retrieval and access patterns".into());
        } else if *freq < 0.1 {
            insights.push("Limited memory retrieval activity".into());
        }
    }

    for pattern in patterns {
        match pattern.pattern_type.as_str() {
            "high_regularity" => {
                insights.push("Consistent behavioral patterns support reliable routines".into())
            }
            "daily_rhythm" => {
                insights.push("Daily rhythm patterns suggest good time-awareness".into())
            }
            _ => {}
        }
    }

    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uniform_kinds_are_highly_predictable() {
        let log = Arc::new(EventLog::in_memory());
        for i in 0..12 {
            log.append("user_message", &format!("m{i}"), json!({"role": "user"})).unwrap();
        }
        let analyzer = RhythmAnalyzer::new(log.clone());
        let metrics = analyzer.window_metrics(1, log.count());
        assert!(metrics.predictability_score > 0.99);
        assert!(metrics.entropy_score < 0.01, "uniform spacing has zero interval entropy");
    }

    #[test]
    fn mixed_kinds_reduce_predictability() {
        let log = Arc::new(EventLog::in_memory());
        let kinds = ["user_message", "assistant_message", "reflection", "commitment_open"];
        for i in 0..16 {
            let kind = kinds[i % kinds.len()];
            let meta = if kind == "commitment_open" { json!({"cid": format!("c{i}")}) } else { json!({}) };
            log.append(kind, &format!("event {i}"), meta).unwrap();
        }
        let analyzer = RhythmAnalyzer::new(log.clone());
        let metrics = analyzer.window_metrics(1, log.count());
        assert!(metrics.predictability_score < 0.1, "even mix over 4 kinds is max-entropy");
    }

    #[test]
    fn engagement_periods_require_ten_events() {
        let log = Arc::new(EventLog::in_memory());
        for i in 0..5 {
            log.append("user_message", &format!("m{i}"), json!({})).unwrap();
        }
        let analyzer = RhythmAnalyzer::new(log.clone());
        let metrics = analyzer.window_metrics(1, log.count());
        assert!(metrics.engagement_periods.is_empty());
    }

    #[test]
    fn reflections_score_higher_intensity_than_chat() {
        let log = Arc::new(EventLog::in_memory());
        log.append("user_message", "hello", json!({})).unwrap();
        log.append("reflection", "deep thought", json!({})).unwrap();
        let events = log.read_all();
        let chat = activity_intensity(&events[..1]);
        let reflect = activity_intensity(&events[1..]);
        assert!(reflect > chat);
    }

    #[test]
    fn retrieval_gap_statistics_are_computed() {
        let log = Arc::new(EventLog::in_memory());
        for i in 0..12 {
            if i % 4 == 0 {
                log.append("retrieval_selection", "{}", json!({"source": "runtime"})).unwrap();
            } else {
                log.append("user_message", &format!("m{i}"), json!({})).unwrap();
            }
        }
        let analyzer = RhythmAnalyzer::new(log.clone());
        let metrics = analyzer.window_metrics(1, log.count());
        assert!(metrics.retrieval_patterns.contains_key("avg_retrieval_gap"));
        assert!(metrics.retrieval_patterns["retrieval_frequency"] > 0.0);
    }
}
