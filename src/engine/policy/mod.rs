//! Epsilon-greedy tier placement policy
//!
//! Decides which tier each key should occupy from discretized access-pattern
//! features, learns value estimates online from observed outcomes and decays
//! exploration across retrains. Retraining operates copy-then-swap on the
//! whole policy state so concurrent deciders never see a partial table.

mod state;

pub use state::{
    BucketBoundaries, CellSnapshot, Features, GreedyChoice, PolicySnapshot, PolicyState,
    FEATURE_NAMES,
};

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engine::config::{PolicyConfig, PolicyKnobs};
use crate::engine::error::EngineError;
use crate::engine::tier::{Tier, TierCostModel};
use crate::engine::tracker::{AccessTracker, KeyRecord, KeySnapshot, TrackerSnapshot};

/// Outcome of a tier decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierDecision {
    pub tier: Tier,
    /// 0.0 for exploration and untracked fallbacks; grows with sample count
    /// and value margin under exploitation
    pub confidence: f64,
    /// Whether this decision was an exploration draw
    pub explored: bool,
}

/// Observed serving outcome for a decided placement
#[derive(Debug, Clone, Copy)]
pub struct AccessOutcome {
    /// Whether the item was served from its assigned tier
    pub hit: bool,
    /// Observed serving latency in milliseconds
    pub latency_ms: f64,
}

/// Result of one retrain pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrainOutcome {
    pub epsilon: f64,
    pub rebucketed: bool,
    pub observations: u64,
}

/// Result of a full placement re-evaluation sweep
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub moved: usize,
}

#[derive(Debug, Clone, Copy)]
struct Pin {
    tier: Tier,
    until_ns: u64,
}

/// Epsilon-greedy tier placement engine
#[derive(Debug)]
pub struct TierPolicyEngine {
    /// Swapped wholesale on retrain; the lock is held only for the pointer
    /// exchange, never across computation
    state: RwLock<Arc<PolicyState>>,
    /// Keys pinned to a tier for a cooldown period by repair actions
    pins: DashMap<String, Pin>,
    config: PolicyConfig,
    cost: Arc<TierCostModel>,
}

impl TierPolicyEngine {
    pub fn new(config: PolicyConfig, cost: Arc<TierCostModel>) -> Self {
        let boundaries = BucketBoundaries::default_for(&config);
        Self {
            state: RwLock::new(Arc::new(PolicyState::new(&config, boundaries))),
            pins: DashMap::new(),
            config,
            cost,
        }
    }

    /// Derive decision features from a live key record
    pub fn features_of(&self, record: &KeyRecord, now_ns: u64, half_life_secs: f64) -> Features {
        Features {
            rate: record.decayed_rate(now_ns, half_life_secs),
            size_bytes: record.size_bytes(),
            recency_secs: now_ns.saturating_sub(record.last_access_ns()) as f64
                / 1_000_000_000.0,
        }
    }

    /// Derive decision features from a frozen key snapshot
    pub fn features_of_snapshot(&self, snapshot: &KeySnapshot, now_ns: u64) -> Features {
        Features {
            rate: snapshot.decayed_rate,
            size_bytes: snapshot.size_bytes,
            recency_secs: now_ns.saturating_sub(snapshot.last_access_ns) as f64
                / 1_000_000_000.0,
        }
    }

    /// Decide which tier a key should occupy
    ///
    /// With probability epsilon the tier is drawn uniformly so every tier
    /// keeps getting sampled even under stable workloads; otherwise the
    /// highest value estimate wins, ties resolving to the cheaper tier.
    /// Untracked keys (no features) fall back to Warm with zero confidence.
    pub fn decide(&self, key: &str, features: Option<Features>, now_ns: u64) -> TierDecision {
        if let Some(pin) = self.active_pin(key, now_ns) {
            return TierDecision {
                tier: pin.tier,
                confidence: 1.0,
                explored: false,
            };
        }

        let features = match features {
            Some(features) => features,
            None => {
                return TierDecision {
                    tier: Tier::Warm,
                    confidence: 0.0,
                    explored: false,
                }
            }
        };

        let state = self.current();
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < state.epsilon() {
            let tier = Tier::ALL[rng.gen_range(0..Tier::ALL.len())];
            return TierDecision {
                tier,
                confidence: 0.0,
                explored: true,
            };
        }

        let bucket = state.boundaries().bucket_of(&features);
        let choice = state.greedy(bucket);
        TierDecision {
            tier: choice.tier,
            confidence: confidence_of(&choice),
            explored: false,
        }
    }

    /// Fold an observed outcome back into the value table
    ///
    /// Reward is 1.0 for a hit within the tier's expected latency, a
    /// degraded partial reward for slow hits and 0.0 for a tier miss.
    pub fn observe(&self, features: Features, tier: Tier, outcome: AccessOutcome) {
        let reward = self.reward(tier, outcome);
        let state = self.current();
        let bucket = state.boundaries().bucket_of(&features);
        state.observe(bucket, tier, reward, &features.attribution_fractions());
    }

    fn reward(&self, tier: Tier, outcome: AccessOutcome) -> f64 {
        if !outcome.hit {
            return 0.0;
        }
        let expected_ms = self.cost.expected_latency_ms(tier);
        if outcome.latency_ms <= expected_ms {
            1.0
        } else {
            (expected_ms / outcome.latency_ms).clamp(0.0, 1.0)
        }
    }

    /// Recompute policy parameters from a recent observation window
    ///
    /// Decays epsilon toward its floor and re-buckets the rate dimension
    /// when the access-rate distribution has shifted materially. The new
    /// state is built aside and swapped in atomically; any failure leaves
    /// the previous state untouched.
    pub fn retrain(
        &self,
        snapshot: &TrackerSnapshot,
        now_ns: u64,
    ) -> Result<RetrainOutcome, EngineError> {
        let previous = self.current();

        let rates: Vec<f64> = snapshot.keys.iter().map(|k| k.decayed_rate).collect();
        let rebucket = Self::distribution_shifted(
            &rates,
            previous.boundaries().median_rate_ref,
            self.config.rebucket_shift_factor,
        );
        let boundaries = if rebucket {
            previous
                .boundaries()
                .rebucketed(rates, self.config.rate_buckets)
        } else {
            previous.boundaries().clone()
        };

        let next = previous.rebuilt(&self.config, boundaries);
        let epsilon = next.decay_epsilon(self.config.epsilon_decay);
        next.mark_retrained(now_ns);

        let observations = next.observations();
        self.swap_state(Arc::new(next));

        Ok(RetrainOutcome {
            epsilon,
            rebucketed: rebucket,
            observations,
        })
    }

    fn distribution_shifted(rates: &[f64], reference_median: f64, factor: f64) -> bool {
        if rates.is_empty() || reference_median <= 0.0 {
            return false;
        }
        let mut sorted: Vec<f64> = rates
            .iter()
            .copied()
            .filter(|r| r.is_finite() && *r > 0.0)
            .collect();
        if sorted.is_empty() {
            return false;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = sorted[sorted.len() / 2];
        median > reference_median * factor || median < reference_median / factor
    }

    /// Re-decide placement for every key in the snapshot and apply the
    /// resulting tiers (the operator-facing "run optimization" action)
    ///
    /// Retention knobs cap the learned placement for idle keys: a key idle
    /// past `hot_data_days` ages out of Hot, and one idle past
    /// `archive_frequency_days` is archived to Cold. Pinned keys keep their
    /// pinned tier regardless.
    pub fn reassign_sweep(
        &self,
        tracker: &AccessTracker,
        snapshot: &TrackerSnapshot,
        knobs: PolicyKnobs,
        now_ns: u64,
    ) -> SweepReport {
        let hot_cutoff_secs = knobs.hot_data_days as f64 * 86_400.0;
        let archive_cutoff_secs = knobs.archive_frequency_days as f64 * 86_400.0;

        let mut report = SweepReport::default();
        for key in &snapshot.keys {
            let features = self.features_of_snapshot(key, now_ns);
            let decision = self.decide(&key.key, Some(features), now_ns);
            let mut tier = decision.tier;
            if self.active_pin(&key.key, now_ns).is_none() {
                if features.recency_secs > archive_cutoff_secs {
                    tier = Tier::Cold;
                } else if features.recency_secs > hot_cutoff_secs && tier == Tier::Hot {
                    tier = Tier::Warm;
                }
            }
            report.examined += 1;
            if tracker.apply_tier(&key.key, tier, now_ns) {
                report.moved += 1;
            }
        }
        report
    }

    /// Pin a key to a tier until the cooldown expires
    pub fn pin(&self, key: &str, tier: Tier, until_ns: u64) {
        self.pins.insert(key.to_string(), Pin { tier, until_ns });
    }

    /// Temporarily widen exploration (bounded by epsilon_max)
    pub fn widen_exploration(&self, boost: f64) -> f64 {
        let state = self.current();
        state.set_epsilon(state.epsilon() + boost);
        state.epsilon()
    }

    /// Current exploration rate
    pub fn epsilon(&self) -> f64 {
        self.current().epsilon()
    }

    /// Signed per-feature contributions of the value estimate behind the
    /// policy's preferred placement for these features, ordered by absolute
    /// magnitude descending. Contributions sum to the estimate exactly.
    pub fn explain(&self, features: Features) -> Vec<(String, f64)> {
        let state = self.current();
        let bucket = state.boundaries().bucket_of(&features);
        let choice = state.greedy(bucket);
        let contributions = state.cell(bucket, choice.tier).contributions();

        let mut explained: Vec<(String, f64)> = FEATURE_NAMES
            .iter()
            .zip(contributions)
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        explained.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        explained
    }

    /// Value estimate backing the preferred placement for these features
    pub fn value_estimate(&self, features: Features) -> f64 {
        let state = self.current();
        let bucket = state.boundaries().bucket_of(&features);
        state.greedy(bucket).value
    }

    /// Serializable policy state for persistence
    pub fn state_snapshot(&self) -> PolicySnapshot {
        self.current().to_snapshot()
    }

    /// Replace live state from a persisted snapshot
    pub fn restore_state(&self, snapshot: &PolicySnapshot) {
        let state = PolicyState::from_snapshot(&self.config, snapshot);
        self.swap_state(Arc::new(state));
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    fn active_pin(&self, key: &str, now_ns: u64) -> Option<Pin> {
        let pin = *self.pins.get(key)?;
        if pin.until_ns <= now_ns {
            self.pins.remove(key);
            return None;
        }
        Some(pin)
    }

    fn current(&self) -> Arc<PolicyState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap_state(&self, next: Arc<PolicyState>) {
        let mut guard = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next;
    }
}

fn confidence_of(choice: &GreedyChoice) -> f64 {
    if choice.value <= 0.0 {
        return 0.0;
    }
    let margin = ((choice.value - choice.runner_up) / choice.value).clamp(0.0, 1.0);
    let maturity = choice.samples as f64 / (choice.samples as f64 + 10.0);
    margin * maturity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::TrackerConfig;

    const SEC: u64 = 1_000_000_000;

    fn engine_with_epsilon(epsilon: f64) -> TierPolicyEngine {
        let config = PolicyConfig {
            epsilon_initial: epsilon,
            epsilon_min: 1e-12,
            ..PolicyConfig::default()
        };
        TierPolicyEngine::new(config, Arc::new(TierCostModel::default()))
    }

    fn hot_features() -> Features {
        Features {
            rate: 50.0,
            size_bytes: 512,
            recency_secs: 1.0,
        }
    }

    #[test]
    fn untracked_key_falls_back_to_warm() {
        let engine = engine_with_epsilon(0.0);
        let decision = engine.decide("unknown", None, SEC);
        assert_eq!(decision.tier, Tier::Warm);
        assert_eq!(decision.confidence, 0.0);
        assert!(!decision.explored);
    }

    #[test]
    fn exploitation_selects_highest_value_tier() {
        let engine = engine_with_epsilon(0.0);
        let features = hot_features();
        for _ in 0..50 {
            engine.observe(
                features,
                Tier::Hot,
                AccessOutcome {
                    hit: true,
                    latency_ms: 0.5,
                },
            );
            engine.observe(
                features,
                Tier::Cold,
                AccessOutcome {
                    hit: false,
                    latency_ms: 900.0,
                },
            );
        }
        for _ in 0..200 {
            let decision = engine.decide("k", Some(features), SEC);
            assert_eq!(decision.tier, Tier::Hot);
            assert!(decision.confidence > 0.5);
        }
    }

    #[test]
    fn slow_hits_earn_partial_reward() {
        let engine = engine_with_epsilon(0.0);
        assert_eq!(
            engine.reward(
                Tier::Warm,
                AccessOutcome {
                    hit: true,
                    latency_ms: 5.0
                }
            ),
            1.0
        );
        let degraded = engine.reward(
            Tier::Warm,
            AccessOutcome {
                hit: true,
                latency_ms: 80.0,
            },
        );
        assert!(degraded > 0.0 && degraded < 1.0);
        assert_eq!(
            engine.reward(
                Tier::Warm,
                AccessOutcome {
                    hit: false,
                    latency_ms: 1.0
                }
            ),
            0.0
        );
    }

    #[test]
    fn pinned_key_overrides_policy() {
        let engine = engine_with_epsilon(1.0);
        engine.pin("pinned", Tier::Cold, 100 * SEC);
        for _ in 0..50 {
            let decision = engine.decide("pinned", Some(hot_features()), SEC);
            assert_eq!(decision.tier, Tier::Cold);
            assert!(!decision.explored);
        }
        // Expired pin falls back to normal decisions
        let decision = engine.decide("pinned", Some(hot_features()), 200 * SEC);
        assert!(decision.explored || decision.tier != Tier::Cold || decision.confidence == 0.0);
    }

    #[test]
    fn retrain_decays_epsilon_and_preserves_learning() {
        let config = PolicyConfig::default();
        let engine = TierPolicyEngine::new(config.clone(), Arc::new(TierCostModel::default()));
        let features = hot_features();
        engine.observe(
            features,
            Tier::Hot,
            AccessOutcome {
                hit: true,
                latency_ms: 0.5,
            },
        );

        let tracker = AccessTracker::new(TrackerConfig::default());
        tracker.record_access("k", 512, SEC).unwrap();
        let snapshot = tracker.snapshot(SEC);

        let before = engine.epsilon();
        let outcome = engine.retrain(&snapshot, 2 * SEC).unwrap();
        assert!((outcome.epsilon - (before * config.epsilon_decay).max(config.epsilon_min)).abs()
            < 1e-12);
        assert!(!outcome.rebucketed);
        assert_eq!(outcome.observations, 1);
        // Learned value survives a non-rebucketing retrain
        assert!(engine.value_estimate(features) > 0.9);
    }

    #[test]
    fn retention_knobs_bound_idle_key_placement() {
        const DAY: u64 = 86_400 * SEC;
        let engine = engine_with_epsilon(0.0);
        let tracker = AccessTracker::new(TrackerConfig::default());
        tracker.record_access("aged", 1024, SEC).unwrap();

        let now = SEC + 8 * DAY;
        let snapshot = tracker.snapshot(now);
        let features = engine.features_of_snapshot(&snapshot.keys[0], now);
        // Teach the policy that this bucket serves well from Hot
        for _ in 0..50 {
            engine.observe(
                features,
                Tier::Hot,
                AccessOutcome {
                    hit: true,
                    latency_ms: 0.5,
                },
            );
            engine.observe(
                features,
                Tier::Cold,
                AccessOutcome {
                    hit: false,
                    latency_ms: 800.0,
                },
            );
        }
        assert_eq!(engine.decide("aged", Some(features), now).tier, Tier::Hot);

        // Idle past hot_data_days: aged out of Hot despite the learned estimate
        let strict = PolicyKnobs {
            hot_data_days: 7,
            archive_frequency_days: 30,
        };
        engine.reassign_sweep(&tracker, &snapshot, strict, now);
        assert_eq!(tracker.get("aged").unwrap().tier(), Tier::Warm);

        // A longer retention window lets the learned placement stand
        let relaxed = PolicyKnobs {
            hot_data_days: 14,
            archive_frequency_days: 30,
        };
        engine.reassign_sweep(&tracker, &snapshot, relaxed, now);
        assert_eq!(tracker.get("aged").unwrap().tier(), Tier::Hot);

        // Idle past the archive window goes to Cold outright
        let archival = PolicyKnobs {
            hot_data_days: 3,
            archive_frequency_days: 7,
        };
        engine.reassign_sweep(&tracker, &snapshot, archival, now);
        assert_eq!(tracker.get("aged").unwrap().tier(), Tier::Cold);
    }

    #[test]
    fn explanation_sums_to_value_estimate() {
        let engine = engine_with_epsilon(0.0);
        let features = hot_features();
        for i in 0..25 {
            engine.observe(
                features,
                Tier::Hot,
                AccessOutcome {
                    hit: i % 3 != 0,
                    latency_ms: 0.4,
                },
            );
        }
        let explained = engine.explain(features);
        assert_eq!(explained.len(), 3);
        let sum: f64 = explained.iter().map(|(_, c)| c).sum();
        assert!((sum - engine.value_estimate(features)).abs() < 1e-9);
        // Sorted by absolute magnitude
        assert!(explained[0].1.abs() >= explained[1].1.abs());
        assert!(explained[1].1.abs() >= explained[2].1.abs());
    }
}
