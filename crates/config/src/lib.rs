use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Event-count thresholds used by the autonomy kernel, reflection
/// synthesizer, and periodic emitters.
///
/// All values are measured in ledger event ids, never wall-clock time, so
/// replaying the same ledger reproduces the same decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// An open commitment older than this many events counts as stale.
    pub commitment_staleness: u64,
    /// An open commitment older than this many events is force-closed.
    pub commitment_auto_close: u64,
    /// Stale open commitments needed before the kernel chooses `reflect`.
    pub stale_open_trigger: usize,
    /// Temporal anomalies needed before the kernel chooses `temporal_analysis`.
    pub anomaly_trigger: usize,
    /// Events since the last `summary_update` before `summarize` fires.
    pub summary_interval: u64,
    /// Events since the last `lifetime_memory` before one is appended.
    pub lifetime_interval: u64,
    /// Recent events without concept bindings before `index` fires.
    pub index_backlog: usize,
    /// Events between `ontology_snapshot` emissions.
    pub snapshot_interval: u64,
    /// Events between adaptive telemetry emissions (stability / coherence /
    /// policy / meta-policy / concept maintenance).
    pub telemetry_interval: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            commitment_staleness: 20,
            commitment_auto_close: 50,
            stale_open_trigger: 3,
            anomaly_trigger: 3,
            summary_interval: 30,
            lifetime_interval: 120,
            index_backlog: 10,
            snapshot_interval: 50,
            telemetry_interval: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Absolute RFC3339 anchor for slot arithmetic.
    pub epoch: String,
    /// Base slot width in seconds. Must be >= 1.
    pub interval_s: u64,
    /// How many recent stimulus events re-seed the seen-slot set on reopen.
    pub seed_limit: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            epoch: "2025-11-01T00:00:00Z".to_string(),
            interval_s: 10,
            seed_limit: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub limit_total_events: usize,
    pub enable_vector_search: bool,
    pub enable_hybrid_scoring: bool,
    pub enable_rerank: bool,
    pub rerank_top_k: usize,
    /// Concept tokens always injected into the retrieval seed set.
    pub sticky_concepts: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit_total_events: 20,
            enable_vector_search: false,
            enable_hybrid_scoring: true,
            enable_rerank: false,
            rerank_top_k: 20,
            sticky_concepts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub provider: String,
    pub model: String,
    /// Retries after the first attempt for transient 5xx failures.
    pub retry_count: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            provider: "dummy".to_string(),
            model: String::new(),
            retry_count: 2,
            retry_base_ms: 500,
        }
    }
}

/// Root configuration for a PMM runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub thresholds: Thresholds,
    pub supervisor: SupervisorConfig,
    pub retrieval: RetrievalConfig,
    pub adapter: AdapterConfig,
}

impl RuntimeConfig {
    /// Load from a TOML file. Missing file yields defaults; missing keys fill
    /// from their section defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        let mut cfg: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config at {}", path.display()))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Environment variables win over file values for the handful of knobs
    /// that differ per deployment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(epoch) = env::var("PMM_SUPERVISOR_EPOCH") {
            if !epoch.trim().is_empty() {
                self.supervisor.epoch = epoch;
            }
        }
        if let Ok(interval) = env::var("PMM_SUPERVISOR_INTERVAL_S") {
            if let Ok(v) = interval.trim().parse::<u64>() {
                if v >= 1 {
                    self.supervisor.interval_s = v;
                }
            }
        }
        if let Ok(count) = env::var("PMM_ADAPTER_RETRY_COUNT") {
            if let Ok(v) = count.trim().parse::<u32>() {
                self.adapter.retry_count = v;
            }
        }
        if let Ok(base) = env::var("PMM_ADAPTER_RETRY_BASE_MS") {
            if let Ok(v) = base.trim().parse::<u64>() {
                self.adapter.retry_base_ms = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.thresholds.commitment_staleness, 20);
        assert_eq!(cfg.thresholds.snapshot_interval, 50);
        assert_eq!(cfg.supervisor.interval_s, 10);
        assert!(cfg.retrieval.enable_hybrid_scoring);
        assert!(!cfg.retrieval.enable_vector_search);
    }

    #[test]
    fn load_missing_file_returns_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = RuntimeConfig::load(dir.path().join("absent.toml"))?;
        assert_eq!(cfg.supervisor.epoch, "2025-11-01T00:00:00Z");
        Ok(())
    }

    #[test]
    fn partial_toml_fills_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pmm.toml");
        std::fs::write(&path, "[thresholds]\ncommitment_staleness = 7\n")?;
        let cfg = RuntimeConfig::load(&path)?;
        assert_eq!(cfg.thresholds.commitment_staleness, 7);
        assert_eq!(cfg.thresholds.commitment_auto_close, 50);
        Ok(())
    }

    #[test]
    fn save_then_load_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pmm.toml");
        let mut cfg = RuntimeConfig::default();
        cfg.retrieval.limit_total_events = 9;
        cfg.save(&path)?;
        let loaded = RuntimeConfig::load(&path)?;
        assert_eq!(loaded.retrieval.limit_total_events, 9);
        Ok(())
    }
}
