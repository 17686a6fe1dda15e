//! Temporal pattern analysis over `[start_id, end_id]` ledger windows.
//!
//! Four sub-analyzers (identity coherence, commitment patterns, cognitive
//! evolution, rhythm) each return `{patterns, anomalies, insights, metrics}`;
//! the composite merges them. All analyzers are pure over the ledger and key
//! only on id order, never wall-clock order.

pub mod cognitive;
pub mod commitments;
pub mod identity;
pub mod rhythm;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use serde_json::{json, Value};

use pmm_core::EventLog;

pub use cognitive::CognitiveEvolutionAnalyzer;
pub use commitments::CommitmentPatternAnalyzer;
pub use identity::IdentityCoherenceAnalyzer;
pub use rhythm::RhythmAnalyzer;

/// Window results cached per (start_id, end_id).
const WINDOW_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A detected temporal pattern.
#[derive(Debug, Clone)]
pub struct TemporalPattern {
    pub pattern_type: String,
    pub confidence: f64,
    pub time_range: (u64, u64),
    pub description: String,
    pub metrics: Value,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub start_id: u64,
    pub end_id: u64,
    pub event_count: usize,
}

/// Complete analysis result for one window.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub window: AnalysisWindow,
    pub patterns: Vec<TemporalPattern>,
    pub anomalies: Vec<String>,
    pub insights: Vec<String>,
    pub metrics: Value,
}

impl AnalysisResult {
    pub fn empty(start_id: u64, end_id: u64) -> Self {
        Self {
            window: AnalysisWindow { start_id, end_id, event_count: 0 },
            patterns: Vec::new(),
            anomalies: Vec::new(),
            insights: Vec::new(),
            metrics: json!({}),
        }
    }
}

/// Composite analyzer orchestrating the four specialized passes.
pub struct TemporalAnalyzer {
    log: Arc<EventLog>,
    pub identity_analyzer: IdentityCoherenceAnalyzer,
    pub commitment_analyzer: CommitmentPatternAnalyzer,
    pub cognitive_analyzer: CognitiveEvolutionAnalyzer,
    pub rhythm_analyzer: RhythmAnalyzer,
    cache: Mutex<LruCache<(u64, u64), AnalysisResult>>,
}

impl TemporalAnalyzer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            identity_analyzer: IdentityCoherenceAnalyzer::new(log.clone()),
            commitment_analyzer: CommitmentPatternAnalyzer::new(log.clone()),
            cognitive_analyzer: CognitiveEvolutionAnalyzer::new(log.clone()),
            rhythm_analyzer: RhythmAnalyzer::new(log.clone()),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(WINDOW_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            log,
        }
    }

    /// Analyze `[start_id, end_id]` inclusive, merging all sub-analyzers.
    pub fn analyze_window(&self, start_id: u64, end_id: u64) -> AnalysisResult {
        {
            let mut cache = self.lock_cache();
            if let Some(hit) = cache.get(&(start_id, end_id)) {
                return hit.clone();
            }
        }

        let events = self.log.read_range(start_id, end_id, None);
        let window = AnalysisWindow { start_id, end_id, event_count: events.len() };

        let mut patterns = Vec::new();
        let mut anomalies = Vec::new();
        let mut insights = Vec::new();
        let mut metrics = serde_json::Map::new();

        let identity = self.identity_analyzer.analyze_window(start_id, end_id);
        patterns.extend(identity.patterns);
        anomalies.extend(identity.anomalies);
        insights.extend(identity.insights);
        metrics.insert("identity".to_string(), identity.metrics);

        let commitments = self.commitment_analyzer.analyze_window(start_id, end_id);
        patterns.extend(commitments.patterns);
        anomalies.extend(commitments.anomalies);
        insights.extend(commitments.insights);
        metrics.insert("commitments".to_string(), commitments.metrics);

        let cognitive = self.cognitive_analyzer.analyze_window(start_id, end_id);
        patterns.extend(cognitive.patterns);
        anomalies.extend(cognitive.anomalies);
        insights.extend(cognitive.insights);
        metrics.insert("cognitive".to_string(), cognitive.metrics);

        let rhythm = self.rhythm_analyzer.analyze_window(start_id, end_id);
        patterns.extend(rhythm.patterns);
        anomalies.extend(rhythm.anomalies);
        insights.extend(rhythm.insights);
        metrics.insert("rhythms".to_string(), rhythm.metrics);

        let result = AnalysisResult {
            window,
            patterns,
            anomalies,
            insights,
            metrics: Value::Object(metrics),
        };

        self.lock_cache().put((start_id, end_id), result.clone());
        result
    }

    /// Anomalies in the recent window, filtered to confident high-severity
    /// patterns. Needs at least 50 recent events to say anything.
    pub fn detect_anomalies(&self, sensitivity: f64) -> Vec<String> {
        let tail = self.log.read_tail(500);
        if tail.len() < 50 {
            return Vec::new();
        }
        let start_id = tail[0].id;
        let end_id = tail[tail.len() - 1].id;
        let result = self.analyze_window(start_id, end_id);

        let mut anomalies: Vec<String> = result
            .patterns
            .iter()
            .filter(|p| {
                p.confidence >= sensitivity
                    && matches!(p.severity, Severity::High | Severity::Critical)
            })
            .map(|p| format!("{}: {}", p.pattern_type, p.description))
            .collect();
        anomalies.extend(result.anomalies);
        anomalies
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<(u64, u64), AnalysisResult>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sample standard deviation (n-1 denominator), 0.0 below two samples.
pub(crate) fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Pairwise-average Jaccard similarity over whitespace word sets.
pub(crate) fn content_similarity(contents: &[String]) -> f64 {
    if contents.len() < 2 {
        return 1.0;
    }
    let sets: Vec<std::collections::BTreeSet<String>> = contents
        .iter()
        .map(|c| c.to_lowercase().split_whitespace().map(str::to_string).collect())
        .collect();
    let mut similarities = Vec::new();
    for i in 0..sets.len() {
        for j in (i + 1)..sets.len() {
            let a = &sets[i];
            let b = &sets[j];
            let similarity = if a.is_empty() && b.is_empty() {
                1.0
            } else if a.is_empty() || b.is_empty() {
                0.0
            } else {
                let inter = a.intersection(b).count() as f64;
                let union = a.union(b).count() as f64;
                if union > 0.0 { inter / union } else { 0.0 }
            };
            similarities.push(similarity);
        }
    }
    mean(&similarities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn composite_merges_all_namespaces() {
        let log = Arc::new(EventLog::in_memory());
        for i in 0..20 {
            log.append("user_message", &format!("hello {i}"), json!({"role": "user"}))
                .unwrap();
            log.append("assistant_message", &format!("reply {i}"), json!({"role": "assistant"}))
                .unwrap();
        }
        let analyzer = TemporalAnalyzer::new(log.clone());
        let result = analyzer.analyze_window(1, log.count());
        assert_eq!(result.window.event_count, 40);
        let metrics = result.metrics.as_object().unwrap();
        for key in ["identity", "commitments", "cognitive", "rhythms"] {
            assert!(metrics.contains_key(key), "missing {key} namespace");
        }
    }

    #[test]
    fn results_are_cached_per_window() {
        let log = Arc::new(EventLog::in_memory());
        for _ in 0..5 {
            log.append("filler", "x", json!({})).unwrap();
        }
        let analyzer = TemporalAnalyzer::new(log.clone());
        let first = analyzer.analyze_window(1, 5);
        // Appends after caching do not change the cached window.
        log.append("filler", "y", json!({})).unwrap();
        let second = analyzer.analyze_window(1, 5);
        assert_eq!(first.window, second.window);
        analyzer.clear_cache();
        let third = analyzer.analyze_window(1, 5);
        assert_eq!(first.window, third.window);
    }

    #[test]
    fn detect_anomalies_needs_enough_events() {
        let log = Arc::new(EventLog::in_memory());
        for _ in 0..10 {
            log.append("filler", "x", json!({})).unwrap();
        }
        let analyzer = TemporalAnalyzer::new(log);
        assert!(analyzer.detect_anomalies(0.1).is_empty());
    }

    #[test]
    fn helpers_behave() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[2.0, 4.0]), 3.0);
        assert_eq!(stdev(&[1.0]), 0.0);
        assert!(stdev(&[1.0, 3.0]) > 1.0);
        assert_eq!(content_similarity(&["same words".to_string(), "same words".to_string()]), 1.0);
    }
}
