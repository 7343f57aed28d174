//! Background retrain scheduling
//!
//! A single loop thread snapshots the tracker and retrains the policy on a
//! fixed interval. Manual triggers run the same operation out-of-band and
//! are single-flight: at most one retrain is ever executing, and a trigger
//! arriving while one runs is rejected, never queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine::config::SchedulerConfig;
use crate::engine::error::EngineError;
use crate::engine::policy::{RetrainOutcome, TierPolicyEngine};
use crate::engine::time::unix_now_ns;
use crate::engine::tracker::AccessTracker;

/// Shared core of the scheduler, cloneable into background threads
#[derive(Debug)]
pub struct RetrainHandle {
    in_flight: AtomicBool,
    tracker: Arc<AccessTracker>,
    policy: Arc<TierPolicyEngine>,
}

impl RetrainHandle {
    pub fn new(tracker: Arc<AccessTracker>, policy: Arc<TierPolicyEngine>) -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            tracker,
            policy,
        }
    }

    /// Whether a retrain is currently executing
    pub fn is_retraining(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one retrain if none is in flight
    ///
    /// Internal retrain faults are caught here: they are logged and the
    /// previous policy state stays live, so the scheduler always returns to
    /// idle with known-good state.
    pub fn run_once(&self, reason: &str) -> Result<RetrainOutcome, EngineError> {
        let _guard = FlightGuard::acquire(&self.in_flight).ok_or(EngineError::AlreadyInProgress)?;

        let now_ns = unix_now_ns();
        let snapshot = self.tracker.snapshot(now_ns);
        match self.policy.retrain(&snapshot, now_ns) {
            Ok(outcome) => {
                log::info!(
                    "retrain ({}) complete: epsilon={:.4} rebucketed={} observations={}",
                    reason,
                    outcome.epsilon,
                    outcome.rebucketed,
                    outcome.observations
                );
                Ok(outcome)
            }
            Err(err) => {
                log::warn!("retrain ({}) failed, previous policy retained: {}", reason, err);
                Err(EngineError::RetrainError(err.to_string()))
            }
        }
    }
}

/// Resets the in-flight flag even if the retrain panics
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Periodic retrain loop with manual out-of-band triggering
#[derive(Debug)]
pub struct RetrainScheduler {
    handle: Arc<RetrainHandle>,
    shutdown_tx: crossbeam_channel::Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl RetrainScheduler {
    /// Spawn the periodic loop thread over a shared retrain handle
    pub fn spawn(
        config: &SchedulerConfig,
        handle: Arc<RetrainHandle>,
    ) -> Result<Self, EngineError> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let interval = Duration::from_secs(config.retrain_interval_secs.max(1));
        let loop_handle = handle.clone();
        let worker = std::thread::Builder::new()
            .name("retrain-scheduler".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        log::info!("retrain scheduler shutting down");
                        break;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        // A tick overlapping a manual retrain is skipped, not
                        // queued; faults are logged inside run_once.
                        let _ = loop_handle.run_once("periodic");
                    }
                }
            })
            .map_err(|e| EngineError::RetrainError(format!("failed to spawn loop: {}", e)))?;

        Ok(Self {
            handle,
            shutdown_tx,
            worker: Some(worker),
        })
    }

    /// Operator-facing manual retrain; rejected while one is in flight
    pub fn trigger_manual(&self) -> Result<RetrainOutcome, EngineError> {
        self.handle.run_once("manual")
    }

    /// Shared handle for other background components (repair) to request
    /// retrains through the same single-flight gate
    pub fn handle(&self) -> Arc<RetrainHandle> {
        self.handle.clone()
    }

    pub fn is_retraining(&self) -> bool {
        self.handle.is_retraining()
    }

    /// Stop the loop thread and wait for it to exit
    pub fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("retrain scheduler thread panicked during shutdown");
            }
        }
    }
}

impl Drop for RetrainScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{PolicyConfig, TrackerConfig};
    use crate::engine::tier::TierCostModel;

    fn handle() -> RetrainHandle {
        let tracker = Arc::new(AccessTracker::new(TrackerConfig::default()));
        let policy = Arc::new(TierPolicyEngine::new(
            PolicyConfig::default(),
            Arc::new(TierCostModel::default()),
        ));
        RetrainHandle::new(tracker, policy)
    }

    #[test]
    fn manual_trigger_rejected_while_in_flight() {
        let handle = handle();
        let guard = FlightGuard::acquire(&handle.in_flight).expect("first acquire");
        assert!(handle.is_retraining());
        assert_eq!(handle.run_once("manual"), Err(EngineError::AlreadyInProgress));
        drop(guard);
        assert!(!handle.is_retraining());
        assert!(handle.run_once("manual").is_ok());
    }

    #[test]
    fn flight_guard_releases_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = FlightGuard::acquire(&flag).unwrap();
            assert!(FlightGuard::acquire(&flag).is_none());
        }
        assert!(FlightGuard::acquire(&flag).is_some());
    }

    #[test]
    fn epsilon_follows_decay_formula_across_retrains() {
        let handle = handle();
        let config = PolicyConfig::default();
        let initial = handle.policy.epsilon();
        let retrains = 500u32;
        for _ in 0..retrains {
            handle.run_once("test").unwrap();
        }
        let expected =
            (initial * config.epsilon_decay.powi(retrains as i32)).max(config.epsilon_min);
        assert!((handle.policy.epsilon() - expected).abs() < 1e-9);
    }
}
