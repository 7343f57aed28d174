//! Anomaly detection and self-repair
//!
//! Classifies anomalies from threshold rules over aggregated metrics and
//! tracker state, applies one remediation per detection cycle and judges
//! success once the grace period elapses. Every anomaly is retained in a
//! bounded history ring for statistics; failed repairs are recorded, never
//! retried automatically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::engine::config::RepairConfig;
use crate::engine::error::EngineError;
use crate::engine::policy::TierPolicyEngine;
use crate::engine::retrain::RetrainHandle;
use crate::engine::time::secs_to_ns;
use crate::engine::tracker::AccessTracker;

/// Anomaly classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// Cost/access distribution shifted beyond the sigma band
    Drift,
    /// Rolling hit rate fell below the configured floor
    HitRateCollapse,
    /// A key oscillated between tiers beyond the thrash limit
    TierThrash,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyKind::Drift => write!(f, "drift"),
            AnomalyKind::HitRateCollapse => write!(f, "hit_rate_collapse"),
            AnomalyKind::TierThrash => write!(f, "tier_thrash"),
        }
    }
}

/// Remediation strategy applied to an anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairStrategy {
    /// Immediate out-of-band retrain through the single-flight gate
    ForceRetrain,
    /// Pin the key to its current tier for a cooldown period
    PinTier,
    /// Temporarily raise epsilon to re-sample all tiers
    WidenExploration,
}

impl std::fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairStrategy::ForceRetrain => write!(f, "force_retrain"),
            RepairStrategy::PinTier => write!(f, "pin_tier"),
            RepairStrategy::WidenExploration => write!(f, "widen_exploration"),
        }
    }
}

/// Resolution state of a recorded anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairOutcome {
    Pending,
    Success,
    Failed,
}

/// One detected anomaly with its assigned remediation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: u64,
    /// Subject key for per-key anomalies; global anomalies carry none
    pub key: Option<String>,
    pub detected_at_ns: u64,
    pub kind: AnomalyKind,
    pub strategy: RepairStrategy,
    /// Feature contributions of the policy estimate at detection time,
    /// ordered by absolute magnitude descending
    pub feature_contributions: Vec<(String, f64)>,
    pub outcome: RepairOutcome,
}

/// Repair statistics surfaced to external consumers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairStats {
    /// Percentage of resolved repairs that cleared their anomaly
    pub success_rate: f64,
    /// Strategies by application count, most frequent first
    pub common_strategies: Vec<(String, u64)>,
}

/// Metrics inputs to one detection cycle
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput {
    /// Rolling hit rate over the metrics window
    pub hit_rate: f64,
    /// Whether the rolling window has filled at least once
    pub window_full: bool,
    /// Current total storage cost
    pub total_cost: f64,
}

#[derive(Debug, Clone)]
struct ActiveRepair {
    id: u64,
    kind: AnomalyKind,
    key: Option<String>,
    applied_at_ns: u64,
}

/// Threshold-rule anomaly detector with single-attempt remediation
#[derive(Debug)]
pub struct RepairEngine {
    config: RepairConfig,
    next_id: AtomicU64,
    history: Mutex<VecDeque<Anomaly>>,
    cost_history: Mutex<VecDeque<f64>>,
    active: Mutex<Vec<ActiveRepair>>,
}

impl RepairEngine {
    pub fn new(config: RepairConfig) -> Self {
        let capacity = config.history_capacity.min(4096);
        Self {
            config,
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            cost_history: Mutex::new(VecDeque::new()),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Run one detection cycle: resolve due repairs, detect new anomalies
    /// and apply exactly one remediation attempt per anomaly
    ///
    /// Returns the ids of newly raised anomalies. All faults here are
    /// background faults: they are absorbed into statistics, never thrown
    /// toward access-path callers.
    pub fn run_cycle(
        &self,
        input: &DetectionInput,
        tracker: &AccessTracker,
        policy: &TierPolicyEngine,
        retrain: &RetrainHandle,
        now_ns: u64,
    ) -> Vec<u64> {
        let drift_z = self.update_cost_drift(input.total_cost);
        self.resolve_due(input, tracker, drift_z, now_ns);

        let mut raised = Vec::new();
        for anomaly in self.detect(input, tracker, policy, drift_z, now_ns) {
            let id = anomaly.id;
            self.apply(&anomaly, tracker, policy, retrain, now_ns);
            self.remember(anomaly);
            raised.push(id);
        }
        raised
    }

    /// Repair statistics over the anomaly history ring
    pub fn stats(&self) -> RepairStats {
        let history = self.lock_history();
        let mut resolved = 0u64;
        let mut succeeded = 0u64;
        let mut by_strategy: Vec<(String, u64)> = Vec::new();

        for anomaly in history.iter() {
            match anomaly.outcome {
                RepairOutcome::Success => {
                    resolved += 1;
                    succeeded += 1;
                }
                RepairOutcome::Failed => resolved += 1,
                RepairOutcome::Pending => {}
            }
            let name = anomaly.strategy.to_string();
            match by_strategy.iter_mut().find(|(s, _)| *s == name) {
                Some((_, count)) => *count += 1,
                None => by_strategy.push((name, 1)),
            }
        }
        by_strategy.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        RepairStats {
            success_rate: if resolved > 0 {
                succeeded as f64 / resolved as f64 * 100.0
            } else {
                0.0
            },
            common_strategies: by_strategy,
        }
    }

    /// Copy of the anomaly history, oldest first
    pub fn history(&self) -> Vec<Anomaly> {
        self.lock_history().iter().cloned().collect()
    }

    /// Rebuild history from persisted anomalies
    pub fn restore(&self, anomalies: &[Anomaly]) {
        let mut history = self.lock_history();
        history.clear();
        let mut max_id = 0;
        for anomaly in anomalies {
            max_id = max_id.max(anomaly.id);
            history.push_back(anomaly.clone());
        }
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
        self.next_id.store(max_id + 1, Ordering::Relaxed);
    }

    fn detect(
        &self,
        input: &DetectionInput,
        tracker: &AccessTracker,
        policy: &TierPolicyEngine,
        drift_z: f64,
        now_ns: u64,
    ) -> Vec<Anomaly> {
        let mut found = Vec::new();

        if input.window_full
            && input.hit_rate < self.config.hit_rate_floor
            && !self.is_active(AnomalyKind::HitRateCollapse, None)
        {
            found.push(self.new_anomaly(
                AnomalyKind::HitRateCollapse,
                RepairStrategy::WidenExploration,
                None,
                Vec::new(),
                now_ns,
            ));
        }

        if drift_z.abs() > self.config.cost_sigma && !self.is_active(AnomalyKind::Drift, None) {
            found.push(self.new_anomaly(
                AnomalyKind::Drift,
                RepairStrategy::ForceRetrain,
                None,
                Vec::new(),
                now_ns,
            ));
        }

        for key in tracker.thrashing_keys(self.config.thrash_limit, now_ns) {
            if self.is_active(AnomalyKind::TierThrash, Some(&key)) {
                continue;
            }
            let contributions = tracker
                .get(&key)
                .map(|record| {
                    let half_life = tracker.config().rate_half_life_secs;
                    policy.explain(policy.features_of(&record, now_ns, half_life))
                })
                .unwrap_or_default();
            found.push(self.new_anomaly(
                AnomalyKind::TierThrash,
                RepairStrategy::PinTier,
                Some(key),
                contributions,
                now_ns,
            ));
        }

        found
    }

    fn apply(
        &self,
        anomaly: &Anomaly,
        tracker: &AccessTracker,
        policy: &TierPolicyEngine,
        retrain: &RetrainHandle,
        now_ns: u64,
    ) {
        log::info!(
            "applying {} for anomaly #{} ({})",
            anomaly.strategy,
            anomaly.id,
            anomaly.kind
        );
        match anomaly.strategy {
            RepairStrategy::WidenExploration => {
                let epsilon = policy.widen_exploration(self.config.epsilon_boost);
                log::info!("exploration widened to epsilon={:.4}", epsilon);
            }
            RepairStrategy::ForceRetrain => {
                match retrain.run_once("repair") {
                    Ok(_) => {}
                    // Single attempt: a busy or failed retrain is not retried
                    Err(err) => log::warn!("forced retrain not applied: {}", err),
                }
            }
            RepairStrategy::PinTier => {
                if let Some(key) = &anomaly.key {
                    if let Some(record) = tracker.get(key) {
                        let until = now_ns + secs_to_ns(self.config.pin_cooldown_secs);
                        policy.pin(key, record.tier(), until);
                    }
                }
            }
        }

        self.lock_active().push(ActiveRepair {
            id: anomaly.id,
            kind: anomaly.kind,
            key: anomaly.key.clone(),
            applied_at_ns: now_ns,
        });
    }

    fn resolve_due(
        &self,
        input: &DetectionInput,
        tracker: &AccessTracker,
        drift_z: f64,
        now_ns: u64,
    ) {
        let grace_ns = secs_to_ns(self.config.grace_period_secs);
        let due: Vec<ActiveRepair> = {
            let mut active = self.lock_active();
            let (due, rest): (Vec<_>, Vec<_>) = active
                .drain(..)
                .partition(|repair| now_ns.saturating_sub(repair.applied_at_ns) >= grace_ns);
            *active = rest;
            due
        };

        for repair in due {
            let cleared = match repair.kind {
                AnomalyKind::HitRateCollapse => input.hit_rate >= self.config.hit_rate_floor,
                AnomalyKind::Drift => drift_z.abs() <= self.config.cost_sigma,
                AnomalyKind::TierThrash => match &repair.key {
                    Some(key) => match tracker.get(key) {
                        Some(record) => {
                            let window_ns =
                                secs_to_ns(tracker.config().thrash_window_secs);
                            record.transitions_in_window(now_ns, window_ns)
                                <= self.config.thrash_limit
                        }
                        // Key evicted since; nothing left to thrash
                        None => true,
                    },
                    None => true,
                },
            };

            let outcome = if cleared {
                RepairOutcome::Success
            } else {
                let err = EngineError::RemediationFailed(format!(
                    "anomaly #{} ({}) persisted past grace period",
                    repair.id, repair.kind
                ));
                log::warn!("{}", err);
                RepairOutcome::Failed
            };
            self.record_outcome(repair.id, outcome);
        }
    }

    /// Cost drift z-score over the bounded cost history
    ///
    /// Returns 0 until enough history accumulates for a stable baseline.
    fn update_cost_drift(&self, total_cost: f64) -> f64 {
        let mut history = self
            .cost_history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if history.len() < 10 {
            history.push_back(total_cost);
            return 0.0;
        }

        let n = history.len() as f64;
        let mean = history.iter().sum::<f64>() / n;
        let variance = history.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();

        if history.len() >= self.config.cost_history_len {
            history.pop_front();
        }
        history.push_back(total_cost);

        if std > 0.0 {
            (total_cost - mean) / std
        } else {
            0.0
        }
    }

    fn new_anomaly(
        &self,
        kind: AnomalyKind,
        strategy: RepairStrategy,
        key: Option<String>,
        feature_contributions: Vec<(String, f64)>,
        now_ns: u64,
    ) -> Anomaly {
        Anomaly {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            detected_at_ns: now_ns,
            kind,
            strategy,
            feature_contributions,
            outcome: RepairOutcome::Pending,
        }
    }

    fn remember(&self, anomaly: Anomaly) {
        let mut history = self.lock_history();
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(anomaly);
    }

    fn record_outcome(&self, id: u64, outcome: RepairOutcome) {
        let mut history = self.lock_history();
        if let Some(anomaly) = history.iter_mut().find(|a| a.id == id) {
            anomaly.outcome = outcome;
        }
    }

    fn is_active(&self, kind: AnomalyKind, key: Option<&str>) -> bool {
        self.lock_active()
            .iter()
            .any(|repair| repair.kind == kind && repair.key.as_deref() == key)
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<Anomaly>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Vec<ActiveRepair>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::engine::config::{PolicyConfig, TrackerConfig};
    use crate::engine::tier::{Tier, TierCostModel};

    const SEC: u64 = 1_000_000_000;

    struct Fixture {
        tracker: Arc<AccessTracker>,
        policy: Arc<TierPolicyEngine>,
        retrain: RetrainHandle,
        repair: RepairEngine,
    }

    fn fixture(config: RepairConfig) -> Fixture {
        let tracker = Arc::new(AccessTracker::new(TrackerConfig::default()));
        let policy = Arc::new(TierPolicyEngine::new(
            PolicyConfig::default(),
            Arc::new(TierCostModel::default()),
        ));
        let retrain = RetrainHandle::new(tracker.clone(), policy.clone());
        Fixture {
            tracker,
            policy,
            retrain,
            repair: RepairEngine::new(config),
        }
    }

    fn healthy_input() -> DetectionInput {
        DetectionInput {
            hit_rate: 0.95,
            window_full: true,
            total_cost: 10.0,
        }
    }

    #[test]
    fn hit_rate_collapse_detected_within_one_cycle() {
        let f = fixture(RepairConfig::default());
        let collapsed = DetectionInput {
            hit_rate: 0.3,
            window_full: true,
            total_cost: 10.0,
        };
        let raised = f
            .repair
            .run_cycle(&collapsed, &f.tracker, &f.policy, &f.retrain, SEC);
        assert_eq!(raised.len(), 1);

        let history = f.repair.history();
        assert_eq!(history[0].kind, AnomalyKind::HitRateCollapse);
        assert_eq!(history[0].strategy, RepairStrategy::WidenExploration);
        assert_eq!(history[0].outcome, RepairOutcome::Pending);
    }

    #[test]
    fn collapse_not_raised_before_window_fills() {
        let f = fixture(RepairConfig::default());
        let input = DetectionInput {
            hit_rate: 0.0,
            window_full: false,
            total_cost: 10.0,
        };
        let raised = f
            .repair
            .run_cycle(&input, &f.tracker, &f.policy, &f.retrain, SEC);
        assert!(raised.is_empty());
    }

    #[test]
    fn repair_resolution_after_grace_period() {
        let config = RepairConfig {
            grace_period_secs: 60,
            ..RepairConfig::default()
        };
        let f = fixture(config);
        let collapsed = DetectionInput {
            hit_rate: 0.2,
            window_full: true,
            total_cost: 10.0,
        };

        f.repair
            .run_cycle(&collapsed, &f.tracker, &f.policy, &f.retrain, SEC);
        // Condition cleared before grace expiry: success
        f.repair
            .run_cycle(&healthy_input(), &f.tracker, &f.policy, &f.retrain, 100 * SEC);
        assert_eq!(f.repair.history()[0].outcome, RepairOutcome::Success);

        // Second collapse persists past grace: failure, no automatic retry
        f.repair
            .run_cycle(&collapsed, &f.tracker, &f.policy, &f.retrain, 200 * SEC);
        f.repair
            .run_cycle(&collapsed, &f.tracker, &f.policy, &f.retrain, 300 * SEC);
        let history = f.repair.history();
        assert_eq!(history[1].outcome, RepairOutcome::Failed);
    }

    #[test]
    fn thrashing_key_gets_pinned() {
        let f = fixture(RepairConfig::default());
        f.tracker.record_access("flappy", 64, SEC).unwrap();
        // Bounce the key across tiers beyond the thrash limit
        for i in 0..6u64 {
            let tier = if i % 2 == 0 { Tier::Hot } else { Tier::Cold };
            f.tracker.apply_tier("flappy", tier, SEC + i * SEC);
        }

        let raised = f
            .repair
            .run_cycle(&healthy_input(), &f.tracker, &f.policy, &f.retrain, 10 * SEC);
        assert_eq!(raised.len(), 1);

        let anomaly = &f.repair.history()[0];
        assert_eq!(anomaly.kind, AnomalyKind::TierThrash);
        assert_eq!(anomaly.key.as_deref(), Some("flappy"));

        // The pin holds the key at its current tier through the cooldown
        let current = f.tracker.get("flappy").unwrap().tier();
        let decision = f.policy.decide("flappy", None, 11 * SEC);
        assert_eq!(decision.tier, current);
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn duplicate_anomalies_not_raised_while_active() {
        let f = fixture(RepairConfig::default());
        let collapsed = DetectionInput {
            hit_rate: 0.2,
            window_full: true,
            total_cost: 10.0,
        };
        let first = f
            .repair
            .run_cycle(&collapsed, &f.tracker, &f.policy, &f.retrain, SEC);
        let second = f
            .repair
            .run_cycle(&collapsed, &f.tracker, &f.policy, &f.retrain, 2 * SEC);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn stats_aggregate_outcomes_and_strategies() {
        let f = fixture(RepairConfig {
            grace_period_secs: 1,
            ..RepairConfig::default()
        });
        let collapsed = DetectionInput {
            hit_rate: 0.2,
            window_full: true,
            total_cost: 10.0,
        };
        f.repair
            .run_cycle(&collapsed, &f.tracker, &f.policy, &f.retrain, SEC);
        f.repair
            .run_cycle(&healthy_input(), &f.tracker, &f.policy, &f.retrain, 10 * SEC);

        let stats = f.repair.stats();
        assert!((stats.success_rate - 100.0).abs() < 1e-9);
        assert_eq!(stats.common_strategies[0].0, "widen_exploration");
        assert_eq!(stats.common_strategies[0].1, 1);
    }
}
