//! Engine configuration types
//!
//! Plain serde-backed configuration structs with defaults drawn from the
//! production deployment. Every config section is validated before the
//! engine is constructed.

use serde::{Deserialize, Serialize};

use crate::engine::error::EngineError;

/// Administrative knobs exposed through the policy configuration API
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyKnobs {
    /// Days a key may stay in the hot tier without access before an
    /// optimization sweep demotes it
    pub hot_data_days: u32,
    /// Idle days before an optimization sweep archives a key to the cold tier
    pub archive_frequency_days: u32,
}

/// Bounds for administrative policy adjustments
pub const HOT_DATA_DAYS_RANGE: (u32, u32) = (3, 14);
pub const ARCHIVE_FREQUENCY_RANGE: (u32, u32) = (7, 30);

/// Access tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Maximum number of concurrently tracked keys
    pub max_tracked_keys: usize,
    /// Half-life of the decayed access-rate estimate, in seconds
    pub rate_half_life_secs: f64,
    /// Sliding window for tier-transition (thrash) counting, in seconds
    pub thrash_window_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_tracked_keys: 100_000,
            rate_half_life_secs: 300.0,
            thrash_window_secs: 600,
        }
    }
}

/// Tier placement policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Initial exploration rate
    pub epsilon_initial: f64,
    /// Exploration never decays below this floor
    pub epsilon_min: f64,
    /// Upper bound on exploration, including temporary widening
    pub epsilon_max: f64,
    /// Multiplicative epsilon decay applied on each retrain
    pub epsilon_decay: f64,
    /// Discretization levels per feature dimension
    pub rate_buckets: usize,
    pub size_buckets: usize,
    pub recency_buckets: usize,
    /// Re-bucket when the median access rate shifts by more than this factor
    pub rebucket_shift_factor: f64,
    /// Administrative retention knobs
    pub hot_data_days: u32,
    pub archive_frequency_days: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            epsilon_initial: 1.0,
            epsilon_min: 0.01,
            epsilon_max: 1.0,
            epsilon_decay: 0.995,
            rate_buckets: 4,
            size_buckets: 4,
            recency_buckets: 4,
            rebucket_shift_factor: 2.0,
            hot_data_days: 7,
            archive_frequency_days: 14,
        }
    }
}

impl PolicyConfig {
    /// Total number of composite feature buckets
    pub fn bucket_count(&self) -> usize {
        self.rate_buckets * self.size_buckets * self.recency_buckets
    }
}

/// Background retrain scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between periodic retrains
    pub retrain_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retrain_interval_secs: 300,
        }
    }
}

/// Anomaly detection and repair configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Seconds between detection cycles
    pub detection_interval_secs: u64,
    /// Hit rate below this floor over a full window raises an anomaly
    pub hit_rate_floor: f64,
    /// Tier transitions within the thrash window above this count raise an anomaly
    pub thrash_limit: u32,
    /// Standard-deviation multiplier for cost drift detection
    pub cost_sigma: f64,
    /// Bounded history length for cost drift statistics
    pub cost_history_len: usize,
    /// Seconds a repair has to clear its anomaly before being marked failed
    pub grace_period_secs: u64,
    /// Seconds a key stays pinned to a tier after a thrash repair
    pub pin_cooldown_secs: u64,
    /// Additive epsilon raise applied by the widen-exploration strategy
    pub epsilon_boost: f64,
    /// Capacity of the anomaly history ring
    pub history_capacity: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            detection_interval_secs: 30,
            hit_rate_floor: 0.5,
            thrash_limit: 4,
            cost_sigma: 3.0,
            cost_history_len: 30,
            grace_period_secs: 60,
            pin_cooldown_secs: 900,
            epsilon_boost: 0.25,
            history_capacity: 256,
        }
    }
}

/// Read-side metrics aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Rolling window length, in decisions
    pub window_size: usize,
    /// Hotspot entries included in each snapshot
    pub hotspot_top_n: usize,
    /// Cached snapshot refresh cadence, in milliseconds
    pub refresh_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            hotspot_top_n: 10,
            refresh_interval_ms: 2000,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub tracker: TrackerConfig,
    pub policy: PolicyConfig,
    pub scheduler: SchedulerConfig,
    pub repair: RepairConfig,
    pub telemetry: TelemetryConfig,
}

impl EngineConfig {
    /// Validate configuration before engine construction
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.tracker.max_tracked_keys == 0 {
            return Err(EngineError::invalid_config("max_tracked_keys must be > 0"));
        }
        if self.tracker.rate_half_life_secs <= 0.0 {
            return Err(EngineError::invalid_config(
                "rate_half_life_secs must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.policy.epsilon_initial) {
            return Err(EngineError::invalid_config(
                "epsilon_initial must be in [0, 1]",
            ));
        }
        if self.policy.epsilon_min <= 0.0 || self.policy.epsilon_min > self.policy.epsilon_max {
            return Err(EngineError::invalid_config(
                "epsilon_min must be > 0 and <= epsilon_max",
            ));
        }
        if self.policy.epsilon_max > 1.0 {
            return Err(EngineError::invalid_config("epsilon_max must be <= 1"));
        }
        if !(0.0..1.0).contains(&self.policy.epsilon_decay) {
            return Err(EngineError::invalid_config(
                "epsilon_decay must be in [0, 1)",
            ));
        }
        if self.policy.rate_buckets == 0
            || self.policy.size_buckets == 0
            || self.policy.recency_buckets == 0
        {
            return Err(EngineError::invalid_config(
                "feature bucket counts must be > 0",
            ));
        }
        validate_knobs(&PolicyKnobs {
            hot_data_days: self.policy.hot_data_days,
            archive_frequency_days: self.policy.archive_frequency_days,
        })?;
        if !(0.0..=1.0).contains(&self.repair.hit_rate_floor) {
            return Err(EngineError::invalid_config(
                "hit_rate_floor must be in [0, 1]",
            ));
        }
        if self.repair.history_capacity == 0 {
            return Err(EngineError::invalid_config("history_capacity must be > 0"));
        }
        if self.telemetry.window_size == 0 {
            return Err(EngineError::invalid_config("window_size must be > 0"));
        }
        Ok(())
    }
}

/// Validate administrative retention knobs against their allowed ranges
pub fn validate_knobs(knobs: &PolicyKnobs) -> Result<(), EngineError> {
    let (hot_min, hot_max) = HOT_DATA_DAYS_RANGE;
    if !(hot_min..=hot_max).contains(&knobs.hot_data_days) {
        return Err(EngineError::invalid_config(
            "hot_data_days outside allowed range",
        ));
    }
    let (arc_min, arc_max) = ARCHIVE_FREQUENCY_RANGE;
    if !(arc_min..=arc_max).contains(&knobs.archive_frequency_days) {
        return Err(EngineError::invalid_config(
            "archive_frequency_days outside allowed range",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut config = EngineConfig::default();
        config.tracker.max_tracked_keys = 0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_epsilon_floor_of_zero() {
        let mut config = EngineConfig::default();
        config.policy.epsilon_min = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_retention_knobs() {
        assert!(validate_knobs(&PolicyKnobs {
            hot_data_days: 2,
            archive_frequency_days: 14,
        })
        .is_err());
        assert!(validate_knobs(&PolicyKnobs {
            hot_data_days: 7,
            archive_frequency_days: 31,
        })
        .is_err());
        assert!(validate_knobs(&PolicyKnobs {
            hot_data_days: 7,
            archive_frequency_days: 14,
        })
        .is_ok());
    }
}
