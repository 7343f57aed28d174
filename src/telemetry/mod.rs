//! Read-side metrics aggregation
//!
//! Maintains rolling decision-outcome windows and serves cached snapshots
//! recomputed on a fixed cadence rather than per request, keeping the access
//! path free of aggregation work. Snapshots are eventually consistent with
//! the hot path; all fields are advisory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::engine::config::TelemetryConfig;
use crate::engine::repair::RepairStats;
use crate::engine::tier::CostSnapshot;
use crate::engine::tracker::HotspotEntry;

/// One decision outcome sample in the rolling window
#[derive(Debug, Clone, Copy)]
struct DecisionSample {
    hit: bool,
    latency_ms: f64,
}

/// Aggregated engine metrics surfaced to external consumers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// In-expected-latency hits over total decisions in the rolling window
    pub hit_rate: f64,
    /// Average serving latency over the window, in milliseconds
    pub avg_latency: f64,
    /// Current exploration rate
    pub epsilon: f64,
    /// Per-tier cost breakdown (memory / compressed / archived / total)
    #[serde(flatten)]
    pub cost: CostSnapshot,
    /// Top keys by decayed access rate
    pub hotspots: Vec<HotspotEntry>,
    /// Repair success rate and common strategies
    pub repair: RepairStats,
    /// Decisions currently held in the rolling window
    pub window_decisions: usize,
    pub taken_at_ns: u64,
}

/// Sources a refresh pulls from; all read-only views over the live engine
pub struct MetricsSources {
    pub epsilon: f64,
    pub cost: CostSnapshot,
    pub hotspots: Vec<HotspotEntry>,
    pub repair: RepairStats,
}

/// Rolling-window metrics aggregator
#[derive(Debug)]
pub struct MetricsAggregator {
    config: TelemetryConfig,
    window: Mutex<VecDeque<DecisionSample>>,
    /// Total samples ever recorded; tells whether the window has filled
    recorded: AtomicU64,
    cached: RwLock<Arc<MetricsSnapshot>>,
    last_refresh_ns: AtomicU64,
}

impl MetricsAggregator {
    pub fn new(config: TelemetryConfig) -> Self {
        let window_size = config.window_size;
        Self {
            config,
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            recorded: AtomicU64::new(0),
            cached: RwLock::new(Arc::new(MetricsSnapshot::default())),
            last_refresh_ns: AtomicU64::new(0),
        }
    }

    /// Record one decision outcome into the rolling window
    pub fn record_decision(&self, hit: bool, latency_ms: f64) {
        let mut window = self.lock_window();
        if window.len() >= self.config.window_size {
            window.pop_front();
        }
        window.push_back(DecisionSample { hit, latency_ms });
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Rolling hit rate; 0 when no decisions have been recorded
    pub fn hit_rate(&self) -> f64 {
        let window = self.lock_window();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().filter(|s| s.hit).count() as f64 / window.len() as f64
    }

    /// Whether the rolling window has filled at least once
    pub fn window_full(&self) -> bool {
        self.recorded.load(Ordering::Relaxed) >= self.config.window_size as u64
    }

    /// Latest cached snapshot
    pub fn cached(&self) -> Arc<MetricsSnapshot> {
        self.cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether the cached snapshot is due for a refresh
    pub fn needs_refresh(&self, now_ns: u64) -> bool {
        let age_ns = now_ns.saturating_sub(self.last_refresh_ns.load(Ordering::Relaxed));
        age_ns >= self.config.refresh_interval_ms * 1_000_000
    }

    /// Recompute the cached snapshot from the given read-only sources
    pub fn refresh(&self, sources: MetricsSources, now_ns: u64) -> Arc<MetricsSnapshot> {
        let (hit_rate, avg_latency, window_decisions) = {
            let window = self.lock_window();
            if window.is_empty() {
                (0.0, 0.0, 0)
            } else {
                let hits = window.iter().filter(|s| s.hit).count();
                let total_latency: f64 = window.iter().map(|s| s.latency_ms).sum();
                (
                    hits as f64 / window.len() as f64,
                    total_latency / window.len() as f64,
                    window.len(),
                )
            }
        };

        let snapshot = Arc::new(MetricsSnapshot {
            hit_rate,
            avg_latency,
            epsilon: sources.epsilon,
            cost: sources.cost,
            hotspots: sources.hotspots,
            repair: sources.repair,
            window_decisions,
            taken_at_ns: now_ns,
        });

        {
            let mut cached = self
                .cached
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *cached = snapshot.clone();
        }
        self.last_refresh_ns.store(now_ns, Ordering::Relaxed);
        snapshot
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, VecDeque<DecisionSample>> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
