use std::collections::BTreeMap;
use std::sync::Arc;

use pmm_core::{Event, EventKind, EventLog};

/// Core commitment evolution metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitmentMetrics {
    pub open_count: usize,
    pub closed_count: usize,
    pub still_open: usize,
    pub success_rate: f64,
    pub avg_duration_events: f64,
    pub abandonment_rate: f64,
}

/// Fulfilment statistics for a single success criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct CriteriaStats {
    pub times_used: usize,
    pub times_met: usize,
    pub fulfillment_rate: f64,
}

/// Outcome-score buckets over closed commitments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeDistribution {
    /// score >= 0.7
    pub high: usize,
    /// 0.3 <= score < 0.7
    pub partial: usize,
    /// score < 0.3
    pub low: usize,
}

/// Duration buckets over closed commitments, in events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurationDistribution {
    /// < 10 events
    pub fast: usize,
    /// 10..=50 events
    pub medium: usize,
    /// > 50 events
    pub slow: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VelocityWindow {
    pub start_id: u64,
    pub opens: usize,
    pub closes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendWindow {
    pub start_id: u64,
    pub avg_score: f64,
}

struct Lifecycle {
    open: Event,
    close: Option<Event>,
    duration: Option<u64>,
}

/// Commitment evolution analysis. Every computation is a pure function of
/// ledger state, replayable and auditable.
pub struct CommitmentAnalyzer {
    log: Arc<EventLog>,
}

impl CommitmentAnalyzer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    fn commitment_events(&self) -> (Vec<Event>, Vec<Event>) {
        let opens = self.log.read_by_kind(EventKind::CommitmentOpen, None, false);
        let closes = self.log.read_by_kind(EventKind::CommitmentClose, None, false);
        (opens, closes)
    }

    fn build_lifecycle_map(&self) -> BTreeMap<String, Lifecycle> {
        let (opens, closes) = self.commitment_events();
        let mut lifecycle: BTreeMap<String, Lifecycle> = BTreeMap::new();

        for event in opens {
            if let Some(cid) = event.meta_str("cid") {
                lifecycle.insert(
                    cid.to_string(),
                    Lifecycle { open: event.clone(), close: None, duration: None },
                );
            }
        }
        for event in closes {
            let Some(cid) = event.meta_str("cid") else { continue };
            if let Some(entry) = lifecycle.get_mut(cid) {
                entry.duration = Some(event.id.saturating_sub(entry.open.id));
                entry.close = Some(event);
            }
        }
        lifecycle
    }

    pub fn compute_metrics(&self) -> CommitmentMetrics {
        let lifecycle = self.build_lifecycle_map();
        if lifecycle.is_empty() {
            return CommitmentMetrics::default();
        }

        let open_count = lifecycle.len();
        let closed_count = lifecycle.values().filter(|v| v.close.is_some()).count();
        let still_open = open_count - closed_count;

        let mut scores = Vec::new();
        let mut durations = Vec::new();
        for entry in lifecycle.values() {
            if let Some(close) = &entry.close {
                scores.push(close.meta_f64("outcome_score").unwrap_or(1.0));
                if let Some(d) = entry.duration {
                    durations.push(d as f64);
                }
            }
        }

        CommitmentMetrics {
            open_count,
            closed_count,
            still_open,
            success_rate: mean(&scores),
            avg_duration_events: mean(&durations),
            abandonment_rate: still_open as f64 / open_count as f64,
        }
    }

    pub fn outcome_distribution(&self) -> OutcomeDistribution {
        let mut dist = OutcomeDistribution::default();
        for entry in self.build_lifecycle_map().values() {
            let Some(close) = &entry.close else { continue };
            let score = close.meta_f64("outcome_score").unwrap_or(1.0);
            if score >= 0.7 {
                dist.high += 1;
            } else if score >= 0.3 {
                dist.partial += 1;
            } else {
                dist.low += 1;
            }
        }
        dist
    }

    pub fn duration_distribution(&self) -> DurationDistribution {
        let mut dist = DurationDistribution::default();
        for entry in self.build_lifecycle_map().values() {
            let Some(duration) = entry.duration else { continue };
            if duration < 10 {
                dist.fast += 1;
            } else if duration <= 50 {
                dist.medium += 1;
            } else {
                dist.slow += 1;
            }
        }
        dist
    }

    /// Per-criterion fulfilment rates across all structured closes.
    pub fn criteria_analysis(&self) -> BTreeMap<String, CriteriaStats> {
        let mut used: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for entry in self.build_lifecycle_map().values() {
            let Some(close) = &entry.close else { continue };
            let Some(criteria) = close.meta.get("criteria_met").and_then(|v| v.as_object())
            else {
                continue;
            };
            for (criterion, met) in criteria {
                let slot = used.entry(criterion.clone()).or_insert((0, 0));
                slot.0 += 1;
                if met.as_bool().unwrap_or(false) {
                    slot.1 += 1;
                }
            }
        }
        used.into_iter()
            .map(|(name, (times_used, times_met))| {
                (
                    name,
                    CriteriaStats {
                        times_used,
                        times_met,
                        fulfillment_rate: if times_used > 0 {
                            times_met as f64 / times_used as f64
                        } else {
                            0.0
                        },
                    },
                )
            })
            .collect()
    }

    /// Opens/closes counted per fixed-width id window.
    pub fn velocity(&self, window_size: u64) -> Vec<VelocityWindow> {
        let events = self.log.read_all();
        if events.is_empty() {
            return Vec::new();
        }
        let window_size = window_size.max(1);

        let mut windows = Vec::new();
        let mut window_start = 1u64;
        let mut current = VelocityWindow { start_id: 1, opens: 0, closes: 0 };

        for event in &events {
            while event.id >= window_start + window_size {
                current.start_id = window_start;
                windows.push(current.clone());
                window_start += window_size;
                current = VelocityWindow { start_id: window_start, opens: 0, closes: 0 };
            }
            match event.kind {
                EventKind::CommitmentOpen => current.opens += 1,
                EventKind::CommitmentClose => current.closes += 1,
                _ => {}
            }
        }
        if current.opens > 0 || current.closes > 0 {
            current.start_id = window_start;
            windows.push(current);
        }
        windows
    }

    /// Average outcome score per fixed-width id window.
    pub fn success_trend(&self, window_size: u64) -> Vec<TrendWindow> {
        let events = self.log.read_all();
        if events.is_empty() {
            return Vec::new();
        }
        let window_size = window_size.max(1);

        let mut windows = Vec::new();
        let mut window_start = 1u64;
        let mut scores: Vec<f64> = Vec::new();

        for event in &events {
            while event.id >= window_start + window_size {
                if !scores.is_empty() {
                    windows.push(TrendWindow { start_id: window_start, avg_score: mean(&scores) });
                }
                window_start += window_size;
                scores.clear();
            }
            if event.kind == EventKind::CommitmentClose {
                scores.push(event.meta_f64("outcome_score").unwrap_or(1.0));
            }
        }
        if !scores.is_empty() {
            windows.push(TrendWindow { start_id: window_start, avg_score: mean(&scores) });
        }
        windows
    }

    /// Metrics grouped by `origin` (user / assistant / autonomy_kernel / unknown).
    /// Duration is not tracked per-origin.
    pub fn by_origin(&self) -> BTreeMap<String, CommitmentMetrics> {
        let (opens, closes) = self.commitment_events();

        let close_by_cid: BTreeMap<String, &Event> = closes
            .iter()
            .filter_map(|e| e.meta_str("cid").map(|cid| (cid.to_string(), e)))
            .collect();

        let mut grouped: BTreeMap<String, (usize, Vec<f64>)> = BTreeMap::new();
        for open in &opens {
            let origin = open.meta_str("origin").unwrap_or("unknown").to_string();
            let slot = grouped.entry(origin).or_insert((0, Vec::new()));
            slot.0 += 1;
            if let Some(cid) = open.meta_str("cid") {
                if let Some(close) = close_by_cid.get(cid) {
                    slot.1.push(close.meta_f64("outcome_score").unwrap_or(1.0));
                }
            }
        }

        grouped
            .into_iter()
            .map(|(origin, (open_count, scores))| {
                let closed_count = scores.len();
                let still_open = open_count - closed_count;
                (
                    origin,
                    CommitmentMetrics {
                        open_count,
                        closed_count,
                        still_open,
                        success_rate: mean(&scores),
                        avg_duration_events: 0.0,
                        abandonment_rate: if open_count > 0 {
                            still_open as f64 / open_count as f64
                        } else {
                            0.0
                        },
                    },
                )
            })
            .collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log_with<F: Fn(&EventLog)>(fill: F) -> Arc<EventLog> {
        let log = Arc::new(EventLog::in_memory());
        fill(&log);
        log
    }

    #[test]
    fn metrics_over_opens_and_closes() {
        let log = log_with(|log| {
            log.append("commitment_open", "c1", json!({"cid": "c1"})).unwrap();
            log.append("commitment_open", "c2", json!({"cid": "c2"})).unwrap();
            log.append("commitment_open", "c3", json!({"cid": "c3"})).unwrap();
            log.append(
                "commitment_close",
                "c1",
                json!({"cid": "c1", "outcome_score": 0.5}),
            )
            .unwrap();
            log.append(
                "commitment_close",
                "c2",
                json!({"cid": "c2", "outcome_score": 1.0}),
            )
            .unwrap();
        });
        let metrics = CommitmentAnalyzer::new(log).compute_metrics();
        assert_eq!(metrics.open_count, 3);
        assert_eq!(metrics.closed_count, 2);
        assert_eq!(metrics.still_open, 1);
        assert!((metrics.success_rate - 0.75).abs() < 1e-9);
        // c1: 4 - 1 = 3, c2: 5 - 2 = 3
        assert!((metrics.avg_duration_events - 3.0).abs() < 1e-9);
        assert!((metrics.abandonment_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn legacy_closes_default_to_full_score() {
        let log = log_with(|log| {
            log.append("commitment_open", "c1", json!({"cid": "c1"})).unwrap();
            log.append("commitment_close", "c1", json!({"cid": "c1"})).unwrap();
        });
        let metrics = CommitmentAnalyzer::new(log).compute_metrics();
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[test]
    fn distributions_bucket_scores_and_durations() {
        let log = log_with(|log| {
            log.append("commitment_open", "hi", json!({"cid": "hi"})).unwrap();
            log.append("commitment_open", "mid", json!({"cid": "mid"})).unwrap();
            log.append("commitment_open", "lo", json!({"cid": "lo"})).unwrap();
            log.append(
                "commitment_close",
                "hi",
                json!({"cid": "hi", "outcome_score": 0.9}),
            )
            .unwrap();
            log.append(
                "commitment_close",
                "mid",
                json!({"cid": "mid", "outcome_score": 0.5}),
            )
            .unwrap();
            for _ in 0..12 {
                log.append("filler", "x", json!({})).unwrap();
            }
            log.append(
                "commitment_close",
                "lo",
                json!({"cid": "lo", "outcome_score": 0.1}),
            )
            .unwrap();
        });
        let analyzer = CommitmentAnalyzer::new(log);
        let outcomes = analyzer.outcome_distribution();
        assert_eq!((outcomes.high, outcomes.partial, outcomes.low), (1, 1, 1));
        let durations = analyzer.duration_distribution();
        assert_eq!(durations.fast, 2);
        assert_eq!(durations.medium, 1);
        assert_eq!(durations.slow, 0);
    }

    #[test]
    fn criteria_analysis_counts_fulfilment() {
        let log = log_with(|log| {
            log.append("commitment_open", "a", json!({"cid": "a"})).unwrap();
            log.append(
                "commitment_close",
                "a",
                json!({"cid": "a", "criteria_met": {"tested": true, "shipped": false}}),
            )
            .unwrap();
            log.append("commitment_open", "b", json!({"cid": "b"})).unwrap();
            log.append(
                "commitment_close",
                "b",
                json!({"cid": "b", "criteria_met": {"tested": true}}),
            )
            .unwrap();
        });
        let stats = CommitmentAnalyzer::new(log).criteria_analysis();
        assert_eq!(stats["tested"].times_used, 2);
        assert_eq!(stats["tested"].times_met, 2);
        assert_eq!(stats["tested"].fulfillment_rate, 1.0);
        assert_eq!(stats["shipped"].times_met, 0);
    }

    #[test]
    fn velocity_windows_count_opens_and_closes() {
        let log = log_with(|log| {
            log.append("commitment_open", "c1", json!({"cid": "c1"})).unwrap();
            log.append("commitment_open", "c2", json!({"cid": "c2"})).unwrap();
            log.append("commitment_close", "c1", json!({"cid": "c1"})).unwrap();
            for _ in 0..7 {
                log.append("filler", "x", json!({})).unwrap();
            }
            log.append("commitment_open", "c3", json!({"cid": "c3"})).unwrap();
            for _ in 0..9 {
                log.append("filler", "x", json!({})).unwrap();
            }
        });
        let velocity = CommitmentAnalyzer::new(log).velocity(10);
        assert_eq!(velocity.len(), 2);
        assert_eq!((velocity[0].opens, velocity[0].closes), (2, 1));
        assert_eq!((velocity[1].opens, velocity[1].closes), (1, 0));
    }

    #[test]
    fn success_trend_averages_per_window() {
        let log = log_with(|log| {
            log.append("commitment_open", "c1", json!({"cid": "c1"})).unwrap();
            log.append(
                "commitment_close",
                "c1",
                json!({"cid": "c1", "outcome_score": 0.3}),
            )
            .unwrap();
            for _ in 0..8 {
                log.append("filler", "x", json!({})).unwrap();
            }
            log.append("commitment_open", "c2", json!({"cid": "c2"})).unwrap();
            log.append(
                "commitment_close",
                "c2",
                json!({"cid": "c2", "outcome_score": 0.9}),
            )
            .unwrap();
            for _ in 0..8 {
                log.append("filler", "x", json!({})).unwrap();
            }
        });
        let trend = CommitmentAnalyzer::new(log).success_trend(10);
        assert_eq!(trend.len(), 2);
        assert!((trend[0].avg_score - 0.3).abs() < 1e-9);
        assert!((trend[1].avg_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn by_origin_groups_metrics() {
        let log = log_with(|log| {
            log.append(
                "commitment_open",
                "a1",
                json!({"cid": "a1", "origin": "assistant"}),
            )
            .unwrap();
            log.append(
                "commitment_close",
                "a1",
                json!({"cid": "a1", "origin": "assistant", "outcome_score": 0.8}),
            )
            .unwrap();
            log.append("commitment_open", "u1", json!({"cid": "u1", "origin": "user"}))
                .unwrap();
            log.append(
                "commitment_close",
                "u1",
                json!({"cid": "u1", "origin": "user", "outcome_score": 0.6}),
            )
            .unwrap();
        });
        let by_origin = CommitmentAnalyzer::new(log).by_origin();
        assert!((by_origin["assistant"].success_rate - 0.8).abs() < 1e-9);
        assert!((by_origin["user"].success_rate - 0.6).abs() < 1e-9);
    }
}
