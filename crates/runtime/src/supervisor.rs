//! Deterministic slot-based supervisor for autonomy stimuli.
//!
//! The current slot is `floor((now − epoch) / interval_s)` (clamped to 0
//! before the epoch); its id is `sha256(epoch ‖ interval_s ‖ slot)`. Exactly
//! one `autonomy_stimulus` is emitted per slot, de-duplicated through a
//! seen-set re-seeded from the most recent stimulus events on reopen. The
//! loop sleeps to the next slot boundary so it never drifts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use serde_json::{json, Value};
use tracing::{debug, warn};

use pmm_core::{canonical_json, sha256_hex, EventKind, EventLog};

use pmm_analysis::TemporalAnalyzer;

/// Adaptive interval bounds, seconds.
const MIN_INTERVAL_S: u64 = 10;
const MAX_INTERVAL_S: u64 = 300;
/// Events required before adaptive timing engages.
const ADAPTIVE_MIN_EVENTS: u64 = 20;
/// Rhythm window size for adaptive timing.
const ADAPTIVE_WINDOW: u64 = 50;

/// Injectable time source so slot arithmetic is testable.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> f64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Fixed clock for tests.
pub struct FixedClock(pub f64);

impl Clock for FixedClock {
    fn now_unix(&self) -> f64 {
        self.0
    }
}

pub struct AutonomySupervisor {
    log: Arc<EventLog>,
    epoch: String,
    epoch_ts: f64,
    base_interval_s: u64,
    interval_s: AtomicU64,
    running: AtomicBool,
    seen_slot_ids: Mutex<HashSet<String>>,
    clock: Box<dyn Clock>,
    temporal: TemporalAnalyzer,
}

impl AutonomySupervisor {
    pub fn new(log: Arc<EventLog>, epoch: &str, interval_s: u64, seed_limit: usize) -> Result<Self> {
        Self::with_clock(log, epoch, interval_s, seed_limit, Box::new(SystemClock))
    }

    pub fn with_clock(
        log: Arc<EventLog>,
        epoch: &str,
        interval_s: u64,
        seed_limit: usize,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        if interval_s < 1 {
            bail!("supervisor interval must be >= 1 second");
        }
        let epoch_ts = parse_epoch(epoch)
            .with_context(|| format!("invalid epoch '{epoch}': expected RFC3339"))?;

        // Bounded seeding keeps startup off full-ledger scans while staying
        // deterministic over the most recent stimulus slice.
        let mut seen = HashSet::new();
        for event in log.read_by_kind(EventKind::AutonomyStimulus, Some(seed_limit.max(1)), true) {
            if let Some(slot_id) = event.meta_str("slot_id") {
                seen.insert(slot_id.to_string());
            }
        }

        Ok(Self {
            temporal: TemporalAnalyzer::new(log.clone()),
            log,
            epoch: epoch.to_string(),
            epoch_ts,
            base_interval_s: interval_s,
            interval_s: AtomicU64::new(interval_s),
            running: AtomicBool::new(false),
            seen_slot_ids: Mutex::new(seen),
            clock,
        })
    }

    pub fn current_interval_s(&self) -> u64 {
        self.interval_s.load(Ordering::SeqCst)
    }

    fn current_slot(&self) -> u64 {
        let elapsed = self.clock.now_unix() - self.epoch_ts;
        if elapsed < 0.0 {
            return 0;
        }
        (elapsed / self.current_interval_s() as f64) as u64
    }

    pub fn slot_id(&self, slot: u64) -> String {
        sha256_hex(&format!("{}{}{}", self.epoch, self.current_interval_s(), slot))
    }

    /// Emit a stimulus for the current slot unless one already exists.
    /// Storage failures are swallowed so the loop survives lock contention.
    pub fn emit_stimulus_if_needed(&self) {
        let adaptive = self.calculate_adaptive_interval();
        self.interval_s.store(adaptive, Ordering::SeqCst);

        let slot = self.current_slot();
        let slot_id = self.slot_id(slot);
        {
            let seen = self
                .seen_slot_ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if seen.contains(&slot_id) {
                return;
            }
        }

        let mut stimulus = json!({
            "adaptive_interval": adaptive,
            "base_interval": self.base_interval_s,
            "slot": slot,
            "slot_id": slot_id,
        });
        if let Some(summary) = self.temporal_summary() {
            stimulus["temporal_context"] = Value::String(summary);
        }
        let adaptive_timing = if adaptive != self.base_interval_s { "true" } else { "false" };

        let appended = self.log.append(
            EventKind::AutonomyStimulus.as_str(),
            &canonical_json(&stimulus),
            json!({
                "source": "autonomy_supervisor",
                "slot_id": slot_id,
                "adaptive_timing": adaptive_timing,
            }),
        );
        match appended {
            Ok(id) => {
                debug!(slot, %slot_id, event = id, "stimulus emitted");
                self.seen_slot_ids
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(slot_id);
            }
            Err(err) => {
                warn!(error = %err, "stimulus append failed; will retry next slot");
            }
        }
    }

    /// Run until `stop()`: emit, then sleep to the next slot boundary. The
    /// boundary sleep is chunked so cancellation is observed promptly.
    pub async fn run_forever(&self) {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            self.emit_stimulus_if_needed();
            let interval = self.current_interval_s() as f64;
            let elapsed = self.clock.now_unix() - self.epoch_ts;
            let elapsed_in_slot = if elapsed < 0.0 { 0.0 } else { elapsed % interval };
            let mut remaining = (interval - elapsed_in_slot).max(0.01);
            while self.running.load(Ordering::SeqCst) && remaining > 0.0 {
                let chunk = remaining.min(0.2);
                tokio::time::sleep(Duration::from_secs_f64(chunk)).await;
                remaining -= chunk;
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Recompute the interval from recent rhythm: faster when patterns are
    /// highly predictable, slower when interval entropy is high.
    fn calculate_adaptive_interval(&self) -> u64 {
        let count = self.log.count();
        if count < ADAPTIVE_MIN_EVENTS {
            return self.base_interval_s;
        }
        let start = count.saturating_sub(ADAPTIVE_WINDOW).max(1);
        let metrics = self.temporal.rhythm_analyzer.window_metrics(start, count);

        let mut optimal = self.base_interval_s;
        if metrics.predictability_score > 0.7 {
            optimal = (self.base_interval_s as f64 * 0.8) as u64;
        } else if metrics.entropy_score > 2.0 {
            optimal = (self.base_interval_s as f64 * 1.3) as u64;
        }
        optimal.clamp(MIN_INTERVAL_S, MAX_INTERVAL_S)
    }

    /// Brief high-confidence pattern summary attached to stimuli.
    fn temporal_summary(&self) -> Option<String> {
        let count = self.log.count();
        if count < ADAPTIVE_MIN_EVENTS {
            return None;
        }
        let start = count.saturating_sub(30).max(1);
        let result = self.temporal.analyze_window(start, count);

        let mut insights = Vec::new();
        for pattern in &result.patterns {
            if pattern.confidence <= 0.8 {
                continue;
            }
            match pattern.pattern_type.as_str() {
                "engagement_periods" => insights.push("high_engagement"),
                "commitment_burst" => insights.push("commitment_clustering"),
                "low_identity_stability" => insights.push("identity_drift"),
                _ => {}
            }
        }
        if insights.is_empty() {
            None
        } else {
            Some(format!("Recent patterns: {}", insights.join(", ")))
        }
    }
}

fn parse_epoch(epoch: &str) -> Result<f64> {
    let parsed = DateTime::parse_from_rfc3339(epoch)?;
    Ok(parsed.timestamp() as f64 + f64::from(parsed.timestamp_subsec_micros()) / 1e6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    const EPOCH: &str = "2025-11-01T00:00:00Z";

    fn epoch_ts() -> f64 {
        parse_epoch(EPOCH).unwrap()
    }

    fn supervisor_at(log: Arc<EventLog>, offset_s: f64) -> AutonomySupervisor {
        AutonomySupervisor::with_clock(
            log,
            EPOCH,
            10,
            2000,
            Box::new(FixedClock(epoch_ts() + offset_s)),
        )
        .unwrap()
    }

    #[test]
    fn invalid_epoch_is_a_hard_error() {
        let log = Arc::new(EventLog::in_memory());
        assert!(AutonomySupervisor::new(log.clone(), "not-a-date", 10, 2000).is_err());
        assert!(AutonomySupervisor::new(log, EPOCH, 0, 2000).is_err());
    }

    #[test]
    fn one_stimulus_per_slot_with_deterministic_id() {
        let log = Arc::new(EventLog::in_memory());
        let supervisor = supervisor_at(log.clone(), 25.0);

        supervisor.emit_stimulus_if_needed();
        supervisor.emit_stimulus_if_needed();

        let stimuli = log.read_by_kind(EventKind::AutonomyStimulus, None, false);
        assert_eq!(stimuli.len(), 1);

        let expected = sha256_hex(&format!("{EPOCH}{}{}", 10, 2));
        assert_eq!(stimuli[0].meta_str("slot_id"), Some(expected.as_str()));
        let content = stimuli[0].content_json().unwrap();
        assert_eq!(content["slot"], j!(2));
        assert_eq!(content["base_interval"], j!(10));
    }

    #[test]
    fn epoch_in_future_clamps_to_slot_zero() {
        let log = Arc::new(EventLog::in_memory());
        let supervisor = supervisor_at(log.clone(), -100.0);
        supervisor.emit_stimulus_if_needed();
        let stimuli = log.read_by_kind(EventKind::AutonomyStimulus, None, false);
        assert_eq!(stimuli[0].content_json().unwrap()["slot"], j!(0));
    }

    #[test]
    fn reopening_reseeds_seen_set_from_ledger() {
        let log = Arc::new(EventLog::in_memory());
        supervisor_at(log.clone(), 25.0).emit_stimulus_if_needed();
        assert_eq!(log.read_by_kind(EventKind::AutonomyStimulus, None, false).len(), 1);

        // A fresh supervisor over the same ledger must not duplicate slot 2.
        supervisor_at(log.clone(), 25.0).emit_stimulus_if_needed();
        assert_eq!(log.read_by_kind(EventKind::AutonomyStimulus, None, false).len(), 1);
    }

    #[test]
    fn later_slots_emit_again() {
        let log = Arc::new(EventLog::in_memory());
        supervisor_at(log.clone(), 25.0).emit_stimulus_if_needed();
        supervisor_at(log.clone(), 45.0).emit_stimulus_if_needed();
        let stimuli = log.read_by_kind(EventKind::AutonomyStimulus, None, false);
        assert_eq!(stimuli.len(), 2);
        let slots: Vec<Value> = stimuli
            .iter()
            .map(|e| e.content_json().unwrap()["slot"].clone())
            .collect();
        assert_eq!(slots, vec![j!(2), j!(4)]);
    }

    #[test]
    fn adaptive_interval_requires_enough_events_and_stays_bounded() {
        let log = Arc::new(EventLog::in_memory());
        for i in 0..30 {
            log.append("user_message", &format!("m{i}"), j!({"role": "user"})).unwrap();
        }
        let supervisor = supervisor_at(log.clone(), 25.0);
        supervisor.emit_stimulus_if_needed();
        let interval = supervisor.current_interval_s();
        assert!((MIN_INTERVAL_S..=MAX_INTERVAL_S).contains(&interval));
        // Uniform kinds are highly predictable: 0.8 × 10 clamps up to the floor.
        assert_eq!(interval, MIN_INTERVAL_S);
    }

    #[test]
    fn stop_flag_halts_run_forever() {
        let log = Arc::new(EventLog::in_memory());
        let supervisor = Arc::new(supervisor_at(log.clone(), 25.0));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let runner = supervisor.clone();
            let handle = tokio::spawn(async move { runner.run_forever().await });
            tokio::time::sleep(Duration::from_millis(100)).await;
            supervisor.stop();
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("supervisor must observe stop()")
                .unwrap();
        });
        assert_eq!(log.read_by_kind(EventKind::AutonomyStimulus, None, false).len(), 1);
    }
}
