//! Runtime configuration: the tunables named throughout the design, one
//! place instead of scattered literals, loaded from an optional TOML file
//! and overridable by the two supported CLI flags.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// All tunable thresholds and intervals. Every field has a default matching
/// the values named in the design; a deployment only needs a config file to
/// override the ones it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of each workload's metric ring. CLI: `--metric-buf-size`.
    pub metric_buf_size: usize,

    /// Disable the cross-group swapper entirely. CLI: `--swap-off`.
    pub swap_off: bool,

    /// Controller tick period, milliseconds.
    pub scheduling_interval_ms: u64,

    /// How often (milliseconds) a non-profiling group checks
    /// `profile_needed()`.
    pub profile_interval_ms: u64,

    /// How long a solorun profiling window runs, milliseconds.
    pub solorun_interval_ms: u64,

    /// First-decision relative diff below which an isolator stops rather
    /// than weakening further.
    pub force_threshold: f64,

    /// Monitoring-mode diff-of-diff (and absolute diff) noise floor.
    pub dod_threshold: f64,

    /// Consecutive contentious-resource mismatches before
    /// `WithViolationDetection` forces reselection.
    pub violation_threshold: u32,

    /// Consecutive failed sanity checks on the verified diff before a group
    /// re-profiles.
    pub verify_threshold: u32,

    /// L3/memory intensity floor below which the bottleneck is classified
    /// as CPU rather than LLC/MEMBW.
    pub cpu_threshold: f64,

    /// Aggregate counterfactual-benefit floor for the swapper to mark a
    /// pair as a swap candidate.
    pub swap_benefit_threshold: f64,

    /// Minimum time between swaps, milliseconds.
    pub swap_interval_ms: u64,

    /// Consecutive invocations a pair must remain the top candidate before
    /// the swap actually executes.
    pub swap_violation_count: u32,

    /// Threshold governing CoreCount's fg/bg-side strengthen/weaken
    /// decisions on the instructions-per-second axis. Left unjustified in
    /// the source drafts; exposed here instead of hardcoded.
    pub inst_ps_threshold: f64,

    /// Minimum representable LLC allocation in cache ways, below
    /// `MIN_BITS + 1` steps are refused.
    pub llc_min_bits: u32,

    /// cpufreq step size, kHz, used by the MemoryBandwidth isolator.
    pub cpufreq_step_khz: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            metric_buf_size: 50,
            swap_off: false,
            scheduling_interval_ms: 200,
            profile_interval_ms: 10_000,
            solorun_interval_ms: 3_000,
            force_threshold: 0.05,
            dod_threshold: 0.005,
            violation_threshold: 3,
            verify_threshold: 3,
            cpu_threshold: 0.1,
            swap_benefit_threshold: 0.1,
            swap_interval_ms: 2_000,
            swap_violation_count: 3,
            inst_ps_threshold: -0.5,
            llc_min_bits: 2,
            cpufreq_step_khz: 100_000,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults for any field it
    /// does not set. A missing file is not an error — callers pass `None`
    /// when no `--config` flag was given.
    pub fn load(path: Option<&Path>) -> Result<Config, AppError> {
        let cfg = match path {
            Some(p) => {
                let text = fs::read_to_string(p)
                    .map_err(|e| AppError::Config(format!("reading {}: {}", p.display(), e)))?;
                toml::from_str(&text)
                    .map_err(|e| AppError::Config(format!("parsing {}: {}", p.display(), e)))?
            }
            None => Config::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would make the tick loop or the
    /// isolators misbehave (zero intervals, inverted thresholds).
    pub fn validate(&self) -> Result<(), AppError> {
        if self.metric_buf_size == 0 {
            return Err(AppError::Config("metric_buf_size must be > 0".into()));
        }
        if self.scheduling_interval_ms == 0 {
            return Err(AppError::Config("scheduling_interval_ms must be > 0".into()));
        }
        if self.force_threshold < 0.0 || self.dod_threshold < 0.0 {
            return Err(AppError::Config("thresholds must be non-negative".into()));
        }
        if self.violation_threshold == 0 || self.verify_threshold == 0 {
            return Err(AppError::Config(
                "violation_threshold and verify_threshold must be > 0".into(),
            ));
        }
        if self.swap_violation_count == 0 {
            return Err(AppError::Config("swap_violation_count must be > 0".into()));
        }
        Ok(())
    }

    pub fn scheduling_interval(&self) -> Duration {
        Duration::from_millis(self.scheduling_interval_ms)
    }

    pub fn solorun_interval(&self) -> Duration {
        Duration::from_millis(self.solorun_interval_ms)
    }

    pub fn swap_interval(&self) -> Duration {
        Duration::from_millis(self.swap_interval_ms)
    }

    /// Number of controller ticks between `profile_needed()` checks for a
    /// non-profiling group, at least 1.
    pub fn profile_check_period_ticks(&self) -> u64 {
        (self.profile_interval_ms / self.scheduling_interval_ms).max(1)
    }

    /// Number of controller ticks a solorun window spans, at least 1.
    pub fn solorun_deadline_ticks(&self) -> u64 {
        (self.solorun_interval_ms / self.scheduling_interval_ms).max(1)
    }
}
