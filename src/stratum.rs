//! Public API for the Stratum adaptive storage engine
//!
//! `Stratum` wires the tracker, placement policy, cost model, retrain
//! scheduler, repair engine and metrics aggregator together behind a small
//! set of query/command operations. Construction goes through
//! `StratumBuilder`, which validates configuration and optionally restores
//! persisted state before any background work starts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine::config::{
    validate_knobs, EngineConfig, PolicyKnobs, ARCHIVE_FREQUENCY_RANGE, HOT_DATA_DAYS_RANGE,
};
use crate::engine::error::EngineError;
use crate::engine::persist::{self, PersistedState};
use crate::engine::policy::{
    AccessOutcome, RetrainOutcome, SweepReport, TierDecision, TierPolicyEngine,
};
use crate::engine::repair::{DetectionInput, RepairEngine, RepairStats};
use crate::engine::retrain::{RetrainHandle, RetrainScheduler};
use crate::engine::tier::{CostSnapshot, ProviderInfo, Tier, TierCostModel, TierRates};
use crate::engine::time::unix_now_ns;
use crate::engine::tracker::{AccessTracker, HotspotEntry};
use crate::telemetry::{MetricsAggregator, MetricsSnapshot, MetricsSources};

/// Builder for `Stratum` engines
#[derive(Debug)]
pub struct StratumBuilder {
    config: EngineConfig,
    state_path: Option<PathBuf>,
    background: bool,
}

impl Default for StratumBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StratumBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            state_path: None,
            background: true,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_tracked_keys(mut self, max: usize) -> Self {
        self.config.tracker.max_tracked_keys = max;
        self
    }

    pub fn epsilon_initial(mut self, epsilon: f64) -> Self {
        self.config.policy.epsilon_initial = epsilon;
        self
    }

    pub fn retrain_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler.retrain_interval_secs = interval.as_secs();
        self
    }

    /// Restore persisted state from this path; a missing or corrupt file
    /// logs a warning and the engine starts cold
    pub fn restore_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Disable the background retrain and repair loops (decisions, manual
    /// retrains and explicit repair cycles still work)
    pub fn without_background_tasks(mut self) -> Self {
        self.background = false;
        self
    }

    pub fn build(self) -> Result<Stratum, EngineError> {
        self.config.validate()?;

        let cost = Arc::new(TierCostModel::default());
        let tracker = Arc::new(AccessTracker::new(self.config.tracker.clone()));
        let policy = Arc::new(TierPolicyEngine::new(
            self.config.policy.clone(),
            cost.clone(),
        ));
        let repair = Arc::new(RepairEngine::new(self.config.repair.clone()));
        let metrics = Arc::new(MetricsAggregator::new(self.config.telemetry.clone()));
        let retrain_handle = Arc::new(RetrainHandle::new(tracker.clone(), policy.clone()));

        if let Some(path) = &self.state_path {
            match persist::load(path) {
                Ok(state) => {
                    tracker.restore(&state.keys);
                    policy.restore_state(&state.policy);
                    repair.restore(&state.anomalies);
                    log::info!(
                        "restored engine state from {}: {} keys",
                        path.display(),
                        state.keys.len()
                    );
                }
                Err(err) => {
                    log::warn!("starting cold, could not restore state: {}", err);
                }
            }
        }

        let knobs = PolicyKnobs {
            hot_data_days: self.config.policy.hot_data_days,
            archive_frequency_days: self.config.policy.archive_frequency_days,
        };

        let (scheduler, repair_loop) = if self.background {
            let scheduler = RetrainScheduler::spawn(&self.config.scheduler, retrain_handle.clone())?;
            let repair_loop = spawn_repair_loop(
                self.config.repair.detection_interval_secs,
                tracker.clone(),
                policy.clone(),
                cost.clone(),
                repair.clone(),
                metrics.clone(),
                retrain_handle.clone(),
            )?;
            (Some(scheduler), Some(repair_loop))
        } else {
            (None, None)
        };

        Ok(Stratum {
            cost,
            tracker,
            policy,
            repair,
            metrics,
            retrain_handle,
            scheduler,
            repair_loop,
            knobs: RwLock::new(knobs),
            half_life_secs: self.config.tracker.rate_half_life_secs,
            hotspot_top_n: self.config.telemetry.hotspot_top_n,
        })
    }
}

struct RepairLoop {
    shutdown_tx: crossbeam_channel::Sender<()>,
    worker: Option<JoinHandle<()>>,
}

/// Adaptive multi-tier storage engine
pub struct Stratum {
    cost: Arc<TierCostModel>,
    tracker: Arc<AccessTracker>,
    policy: Arc<TierPolicyEngine>,
    repair: Arc<RepairEngine>,
    metrics: Arc<MetricsAggregator>,
    retrain_handle: Arc<RetrainHandle>,
    scheduler: Option<RetrainScheduler>,
    repair_loop: Option<RepairLoop>,
    knobs: RwLock<PolicyKnobs>,
    half_life_secs: f64,
    hotspot_top_n: usize,
}

impl Stratum {
    pub fn builder() -> StratumBuilder {
        StratumBuilder::new()
    }

    /// Record an access event and decide where the key should live
    ///
    /// This is the hot path: tracking and deciding operate purely on
    /// in-memory sharded state and never block on I/O.
    pub fn record_access(&self, key: &str, size_bytes: u64) -> Result<TierDecision, EngineError> {
        let now_ns = unix_now_ns();
        let record = self.tracker.record_access(key, size_bytes, now_ns)?;
        let features = self.policy.features_of(&record, now_ns, self.half_life_secs);
        let decision = self.policy.decide(key, Some(features), now_ns);
        self.tracker.apply_tier(key, decision.tier, now_ns);
        Ok(decision)
    }

    /// Report the serving outcome for a previously decided placement
    ///
    /// The rolling hit rate only credits hits served within the tier's
    /// expected latency budget; a slow hit feeds the policy a degraded
    /// reward and counts as a miss in the metrics window.
    pub fn observe(&self, key: &str, hit: bool, latency_ms: f64) {
        let now_ns = unix_now_ns();
        let tier = match self.tracker.get(key) {
            Some(record) => {
                let features = self.policy.features_of(&record, now_ns, self.half_life_secs);
                self.policy.observe(
                    features,
                    record.tier(),
                    AccessOutcome { hit, latency_ms },
                );
                record.tier()
            }
            None => Tier::Warm,
        };
        let within_budget = hit && latency_ms <= self.cost.expected_latency_ms(tier);
        self.metrics.record_decision(within_budget, latency_ms);
    }

    /// Latest metrics snapshot, refreshed on its cadence
    pub fn metrics_snapshot(&self) -> Arc<MetricsSnapshot> {
        let now_ns = unix_now_ns();
        if self.metrics.needs_refresh(now_ns) {
            self.metrics.refresh(self.metrics_sources(now_ns), now_ns)
        } else {
            self.metrics.cached()
        }
    }

    /// Manually trigger a retrain; rejected while one is in flight
    pub fn trigger_retrain(&self) -> Result<RetrainOutcome, EngineError> {
        self.retrain_handle.run_once("manual")
    }

    /// Re-evaluate placement for every tracked key, bounded by the current
    /// retention knobs
    pub fn run_optimization(&self) -> SweepReport {
        let now_ns = unix_now_ns();
        let snapshot = self.tracker.snapshot(now_ns);
        let report =
            self.policy
                .reassign_sweep(&self.tracker, &snapshot, self.policy_config(), now_ns);
        log::info!(
            "optimization sweep: {} keys examined, {} moved",
            report.examined,
            report.moved
        );
        report
    }

    /// Top keys by decayed access rate
    pub fn hotspots(&self, top_n: usize) -> Vec<HotspotEntry> {
        self.tracker.hotspots(top_n, unix_now_ns())
    }

    /// Current administrative retention knobs
    pub fn policy_config(&self) -> PolicyKnobs {
        *self
            .knobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Update retention knobs, clamped to their allowed ranges
    pub fn set_policy_config(&self, knobs: PolicyKnobs) -> Result<PolicyKnobs, EngineError> {
        let clamped = PolicyKnobs {
            hot_data_days: knobs
                .hot_data_days
                .clamp(HOT_DATA_DAYS_RANGE.0, HOT_DATA_DAYS_RANGE.1),
            archive_frequency_days: knobs
                .archive_frequency_days
                .clamp(ARCHIVE_FREQUENCY_RANGE.0, ARCHIVE_FREQUENCY_RANGE.1),
        };
        validate_knobs(&clamped)?;
        let mut guard = self
            .knobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = clamped;
        Ok(clamped)
    }

    /// Repair success rate and common strategies
    pub fn repair_stats(&self) -> RepairStats {
        self.repair.stats()
    }

    /// Per-feature contributions of the policy estimate for a key
    ///
    /// Untracked keys yield an empty explanation rather than an error.
    pub fn explain(&self, key: &str) -> Vec<(String, f64)> {
        let now_ns = unix_now_ns();
        match self.tracker.get(key) {
            Some(record) => {
                let features = self.policy.features_of(&record, now_ns, self.half_life_secs);
                self.policy.explain(features)
            }
            None => Vec::new(),
        }
    }

    /// Catalog of known storage providers
    pub fn providers(&self) -> &[ProviderInfo] {
        self.cost.providers()
    }

    /// Current per-tier cost projection
    pub fn cost_snapshot(&self) -> CostSnapshot {
        let snapshot = self.tracker.snapshot(unix_now_ns());
        self.cost.compute_cost(&snapshot.keys)
    }

    /// Replace tier rates (administrative update, atomic swap)
    pub fn update_rates(&self, rates: TierRates) {
        self.cost.update_rates(rates);
    }

    /// Run one anomaly detection and repair cycle immediately
    pub fn run_repair_cycle(&self) -> Vec<u64> {
        let now_ns = unix_now_ns();
        let input = DetectionInput {
            hit_rate: self.metrics.hit_rate(),
            window_full: self.metrics.window_full(),
            total_cost: self.cost_snapshot().total,
        };
        self.repair.run_cycle(
            &input,
            &self.tracker,
            &self.policy,
            &self.retrain_handle,
            now_ns,
        )
    }

    /// Persist key records, policy state and anomaly history
    pub fn save_state(&self, path: &Path) -> Result<(), EngineError> {
        let now_ns = unix_now_ns();
        let state = PersistedState::new(
            now_ns,
            self.tracker.snapshot(now_ns).keys,
            self.policy.state_snapshot(),
            self.repair.history(),
        );
        persist::save(path, &state)
    }

    /// Stop background loops and wait for them to exit
    pub fn shutdown(mut self) {
        if let Some(repair_loop) = self.repair_loop.take() {
            stop_repair_loop(repair_loop);
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
    }

    fn metrics_sources(&self, now_ns: u64) -> MetricsSources {
        let snapshot = self.tracker.snapshot(now_ns);
        MetricsSources {
            epsilon: self.policy.epsilon(),
            cost: self.cost.compute_cost(&snapshot.keys),
            hotspots: self.tracker.hotspots(self.hotspot_top_n, now_ns),
            repair: self.repair.stats(),
        }
    }
}

impl Drop for Stratum {
    fn drop(&mut self) {
        if let Some(repair_loop) = self.repair_loop.take() {
            stop_repair_loop(repair_loop);
        }
        // RetrainScheduler shuts itself down on drop
    }
}

fn stop_repair_loop(mut repair_loop: RepairLoop) {
    let _ = repair_loop.shutdown_tx.try_send(());
    if let Some(worker) = repair_loop.worker.take() {
        if worker.join().is_err() {
            log::error!("repair loop thread panicked during shutdown");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_repair_loop(
    interval_secs: u64,
    tracker: Arc<AccessTracker>,
    policy: Arc<TierPolicyEngine>,
    cost: Arc<TierCostModel>,
    repair: Arc<RepairEngine>,
    metrics: Arc<MetricsAggregator>,
    retrain_handle: Arc<RetrainHandle>,
) -> Result<RepairLoop, EngineError> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let interval = Duration::from_secs(interval_secs.max(1));

    let worker = std::thread::Builder::new()
        .name("repair-detector".to_string())
        .spawn(move || loop {
            match shutdown_rx.recv_timeout(interval) {
                Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    log::info!("repair detector shutting down");
                    break;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    let now_ns = unix_now_ns();
                    let snapshot = tracker.snapshot(now_ns);
                    let input = DetectionInput {
                        hit_rate: metrics.hit_rate(),
                        window_full: metrics.window_full(),
                        total_cost: cost.compute_cost(&snapshot.keys).total,
                    };
                    let raised = repair.run_cycle(&input, &tracker, &policy, &retrain_handle, now_ns);
                    if !raised.is_empty() {
                        log::warn!("repair cycle raised {} anomalies", raised.len());
                    }
                }
            }
        })
        .map_err(|e| EngineError::RetrainError(format!("failed to spawn repair loop: {}", e)))?;

    Ok(RepairLoop {
        shutdown_tx,
        worker: Some(worker),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tier::Tier;

    fn engine() -> Stratum {
        Stratum::builder()
            .without_background_tasks()
            .build()
            .expect("engine")
    }

    #[test]
    fn record_access_decides_and_applies_a_tier() {
        let engine = engine();
        let decision = engine.record_access("user:42", 2048).unwrap();
        assert!(Tier::ALL.contains(&decision.tier));
        assert_eq!(
            engine.tracker.get("user:42").unwrap().tier(),
            decision.tier
        );
    }

    #[test]
    fn invalid_key_surfaces_synchronously() {
        let engine = engine();
        assert!(matches!(
            engine.record_access("", 10),
            Err(EngineError::InvalidKey(_))
        ));
    }

    #[test]
    fn knob_updates_are_clamped_to_bounds() {
        let engine = engine();
        let applied = engine
            .set_policy_config(PolicyKnobs {
                hot_data_days: 100,
                archive_frequency_days: 1,
            })
            .unwrap();
        assert_eq!(applied.hot_data_days, 14);
        assert_eq!(applied.archive_frequency_days, 7);
        assert_eq!(engine.policy_config(), applied);
    }

    #[test]
    fn explain_on_untracked_key_is_empty() {
        let engine = engine();
        assert!(engine.explain("nobody").is_empty());
    }

    #[test]
    fn state_round_trips_through_builder_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.state");

        let engine = engine();
        for _ in 0..20 {
            engine.record_access("persisted", 4096).unwrap();
            engine.observe("persisted", true, 0.5);
        }
        engine.save_state(&path).unwrap();

        let restored = Stratum::builder()
            .without_background_tasks()
            .restore_from(&path)
            .build()
            .unwrap();
        let record = restored.tracker.get("persisted").expect("restored key");
        assert_eq!(record.access_count(), 20);
    }

    #[test]
    fn restore_from_missing_file_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Stratum::builder()
            .without_background_tasks()
            .restore_from(dir.path().join("absent.state"))
            .build()
            .unwrap();
        assert!(engine.tracker.is_empty());
    }

    #[test]
    fn optimization_sweep_reports_examined_keys() {
        let engine = engine();
        for i in 0..10 {
            engine.record_access(&format!("key-{}", i), 1024).unwrap();
        }
        let report = engine.run_optimization();
        assert_eq!(report.examined, 10);
    }

    #[test]
    fn full_exploration_samples_every_tier() {
        // Default config starts at epsilon 1.0, so every decision is an
        // exploration draw over the three tiers
        let engine = engine();
        let mut counts = [0usize; 3];
        for _ in 0..3000 {
            let decision = engine.record_access("probe", 1024).unwrap();
            counts[decision.tier.index()] += 1;
        }
        for (tier, count) in Tier::ALL.iter().zip(counts) {
            assert!(
                (850..=1150).contains(&count),
                "tier {} drawn {} times out of 3000",
                tier,
                count
            );
        }
    }

    #[test]
    fn concurrent_manual_retrains_share_one_gate() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Barrier;

        let engine = Arc::new(engine());
        for i in 0..20_000 {
            engine.record_access(&format!("bulk-{}", i), 4096).unwrap();
        }

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let completed = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                let completed = completed.clone();
                let rejected = rejected.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    match engine.trigger_retrain() {
                        Ok(_) => completed.fetch_add(1, Ordering::SeqCst),
                        Err(EngineError::AlreadyInProgress) => {
                            rejected.fetch_add(1, Ordering::SeqCst)
                        }
                        Err(err) => panic!("unexpected retrain error: {}", err),
                    };
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(completed.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            completed.load(Ordering::SeqCst) + rejected.load(Ordering::SeqCst),
            threads
        );
    }

    #[test]
    fn hits_over_latency_budget_count_as_misses() {
        let engine = engine();
        // Every tier's latency budget is far below 10 seconds
        for _ in 0..50 {
            engine.record_access("laggy", 1024).unwrap();
            engine.observe("laggy", true, 10_000.0);
        }
        let snapshot = engine.metrics_snapshot();
        assert_eq!(snapshot.window_decisions, 50);
        assert!(snapshot.hit_rate < 1e-12);

        // A hit inside the budget still counts
        engine.record_access("snappy", 1024).unwrap();
        engine.observe("snappy", true, 0.2);
        assert!(engine.metrics.hit_rate() > 0.0);
    }

    #[test]
    fn metrics_snapshot_reflects_recorded_outcomes() {
        let engine = engine();
        for _ in 0..8 {
            engine.record_access("m", 1024).unwrap();
            engine.observe("m", true, 0.5);
        }
        engine.record_access("m", 1024).unwrap();
        engine.observe("m", false, 600.0);

        let snapshot = engine.metrics_snapshot();
        assert_eq!(snapshot.window_decisions, 9);
        assert!((snapshot.hit_rate - 8.0 / 9.0).abs() < 1e-12);
        assert!(!snapshot.hotspots.is_empty());
        assert_eq!(snapshot.hotspots[0].key, "m");
    }
}
