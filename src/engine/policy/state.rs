//! Policy state: feature bucketing and the learned value table
//!
//! The whole state is an immutable-shape value object replaced wholesale on
//! retrain (copy-then-swap); individual cells update through atomics so the
//! hot path never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use crossbeam_utils::atomic::AtomicCell;
use serde::{Deserialize, Serialize};

use crate::engine::config::PolicyConfig;
use crate::engine::tier::Tier;

/// Feature names, in the order used by bucketing and explanations
pub const FEATURE_NAMES: [&str; 3] = ["access_rate", "size", "recency"];

/// Raw features for one key at decision time
#[derive(Debug, Clone, Copy)]
pub struct Features {
    /// Decayed access rate (hotness), events
    pub rate: f64,
    /// Size of the data item in bytes
    pub size_bytes: u64,
    /// Seconds since last access
    pub recency_secs: f64,
}

impl Features {
    /// Positive salience weights used to attribute reward across features.
    ///
    /// Only relative magnitude matters; the fractions derived from these
    /// always sum to one, which keeps per-feature contributions summing
    /// exactly to the value estimate.
    pub fn attribution_fractions(&self) -> [f64; 3] {
        let rate = self.rate.max(0.0) / (1.0 + self.rate.max(0.0)) + 1e-6;
        let size = 1.0 / (1.0 + self.size_bytes as f64 / 1_048_576.0) + 1e-6;
        let recency =
            (-self.recency_secs.max(0.0) * std::f64::consts::LN_2 / 3600.0).exp() + 1e-6;
        let sum = rate + size + recency;
        [rate / sum, size / sum, recency / sum]
    }
}

/// Discretization thresholds per feature dimension
///
/// A feature value falls into the bucket counting thresholds it exceeds, so
/// `n - 1` ascending thresholds give `n` buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketBoundaries {
    pub rate: Vec<f64>,
    pub size: Vec<f64>,
    pub recency: Vec<f64>,
    /// Median access rate observed when these boundaries were computed;
    /// used to detect material distribution shift between retrains
    pub median_rate_ref: f64,
}

impl BucketBoundaries {
    /// Geometric default thresholds for a cold start
    pub fn default_for(config: &PolicyConfig) -> Self {
        Self {
            rate: geometric(0.5, 4.0, config.rate_buckets),
            size: geometric(4096.0, 16.0, config.size_buckets),
            recency: geometric(60.0, 60.0, config.recency_buckets),
            median_rate_ref: 1.0,
        }
    }

    /// Rebuild the rate thresholds from observed rate quantiles
    ///
    /// Size and recency thresholds are workload-independent and stay fixed.
    pub fn rebucketed(&self, mut rates: Vec<f64>, bucket_count: usize) -> Self {
        rates.retain(|r| r.is_finite() && *r > 0.0);
        if rates.len() < bucket_count {
            return self.clone();
        }
        rates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let thresholds = (1..bucket_count)
            .map(|i| rates[i * rates.len() / bucket_count])
            .collect();
        Self {
            rate: thresholds,
            size: self.size.clone(),
            recency: self.recency.clone(),
            median_rate_ref: rates[rates.len() / 2],
        }
    }

    /// Composite bucket index for a feature vector
    #[inline]
    pub fn bucket_of(&self, features: &Features) -> usize {
        let rate_idx = sub_index(features.rate, &self.rate);
        let size_idx = sub_index(features.size_bytes as f64, &self.size);
        let recency_idx = sub_index(features.recency_secs, &self.recency);

        let rate_buckets = self.rate.len() + 1;
        let size_buckets = self.size.len() + 1;
        rate_idx + rate_buckets * (size_idx + size_buckets * recency_idx)
    }

    pub fn bucket_count(&self) -> usize {
        (self.rate.len() + 1) * (self.size.len() + 1) * (self.recency.len() + 1)
    }
}

#[inline(always)]
fn sub_index(value: f64, thresholds: &[f64]) -> usize {
    thresholds.iter().take_while(|t| value > **t).count()
}

fn geometric(base: f64, factor: f64, buckets: usize) -> Vec<f64> {
    (0..buckets.saturating_sub(1))
        .map(|i| base * factor.powi(i as i32))
        .collect()
}

/// One learned cell of the value table: estimate, sample count and the
/// per-feature split of the estimate
#[derive(Debug)]
pub struct ValueCell {
    value: AtomicCell<f64>,
    count: AtomicU64,
    contribs: [AtomicCell<f64>; 3],
}

impl Default for ValueCell {
    fn default() -> Self {
        Self {
            value: AtomicCell::new(0.0),
            count: AtomicU64::new(0),
            contribs: [
                AtomicCell::new(0.0),
                AtomicCell::new(0.0),
                AtomicCell::new(0.0),
            ],
        }
    }
}

impl ValueCell {
    /// Sample-average update: learning rate is the inverse observation count
    ///
    /// The same rate updates the per-feature contributions with the reward
    /// split by `fractions`, so contributions sum to the estimate exactly.
    /// Load/store pairs follow last-writer-wins semantics; a lost update
    /// costs one sample of precision, never consistency of the split.
    fn observe(&self, reward: f64, fractions: &[f64; 3]) {
        let n = (self.count.fetch_add(1, Ordering::Relaxed) + 1) as f64;
        let lr = 1.0 / n;

        let value = self.value.load();
        self.value.store(value + (reward - value) * lr);

        for (cell, fraction) in self.contribs.iter().zip(fractions) {
            let contrib = cell.load();
            cell.store(contrib + (reward * fraction - contrib) * lr);
        }
    }

    pub fn value(&self) -> f64 {
        self.value.load()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn contributions(&self) -> [f64; 3] {
        [
            self.contribs[0].load(),
            self.contribs[1].load(),
            self.contribs[2].load(),
        ]
    }
}

/// Outcome of a greedy lookup over one bucket
#[derive(Debug, Clone, Copy)]
pub struct GreedyChoice {
    pub tier: Tier,
    pub value: f64,
    pub runner_up: f64,
    pub samples: u64,
}

/// Exploration rate plus the per-(bucket, tier) value table
#[derive(Debug)]
pub struct PolicyState {
    epsilon: AtomicCell<f64>,
    epsilon_min: f64,
    epsilon_max: f64,
    boundaries: BucketBoundaries,
    cells: Vec<CachePadded<[ValueCell; 3]>>,
    observations: AtomicU64,
    last_retrain_ns: AtomicU64,
}

impl PolicyState {
    pub fn new(config: &PolicyConfig, boundaries: BucketBoundaries) -> Self {
        let bucket_count = boundaries.bucket_count();
        let cells = (0..bucket_count)
            .map(|_| CachePadded::new(Default::default()))
            .collect();
        Self {
            epsilon: AtomicCell::new(config.epsilon_initial.clamp(
                config.epsilon_min,
                config.epsilon_max,
            )),
            epsilon_min: config.epsilon_min,
            epsilon_max: config.epsilon_max,
            boundaries,
            cells,
            observations: AtomicU64::new(0),
            last_retrain_ns: AtomicU64::new(0),
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon.load()
    }

    /// Set epsilon, clamped to the configured band
    pub fn set_epsilon(&self, epsilon: f64) {
        self.epsilon
            .store(epsilon.clamp(self.epsilon_min, self.epsilon_max));
    }

    /// Multiplicative decay, floored at the minimum exploration rate
    pub fn decay_epsilon(&self, decay: f64) -> f64 {
        let next = (self.epsilon.load() * decay).max(self.epsilon_min);
        self.epsilon.store(next);
        next
    }

    pub fn boundaries(&self) -> &BucketBoundaries {
        &self.boundaries
    }

    pub fn observations(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }

    pub fn last_retrain_ns(&self) -> u64 {
        self.last_retrain_ns.load(Ordering::Relaxed)
    }

    pub fn mark_retrained(&self, now_ns: u64) {
        self.last_retrain_ns.store(now_ns, Ordering::Relaxed);
    }

    pub fn cell(&self, bucket: usize, tier: Tier) -> &ValueCell {
        &self.cells[bucket % self.cells.len()][tier.index()]
    }

    /// Record an observed reward for a (bucket, tier) pair
    pub fn observe(&self, bucket: usize, tier: Tier, reward: f64, fractions: &[f64; 3]) {
        self.observations.fetch_add(1, Ordering::Relaxed);
        self.cell(bucket, tier).observe(reward, fractions);
    }

    /// Greedy tier for a bucket
    ///
    /// Iterates coldest-first and replaces only on strictly greater value,
    /// so equal estimates resolve to the cheaper tier.
    pub fn greedy(&self, bucket: usize) -> GreedyChoice {
        let mut best = Tier::Cold;
        let mut best_value = f64::NEG_INFINITY;
        let mut runner_up = f64::NEG_INFINITY;

        for tier in [Tier::Cold, Tier::Warm, Tier::Hot] {
            let value = self.cell(bucket, tier).value();
            if value > best_value {
                runner_up = best_value;
                best_value = value;
                best = tier;
            } else if value > runner_up {
                runner_up = value;
            }
        }

        GreedyChoice {
            tier: best,
            value: best_value,
            runner_up: if runner_up.is_finite() { runner_up } else { 0.0 },
            samples: self.cell(bucket, best).count(),
        }
    }

    /// Clone into a fresh state carrying the given boundaries
    ///
    /// When boundaries are unchanged the learned table is carried over;
    /// re-bucketing invalidates cell identity, so the table restarts empty.
    pub fn rebuilt(&self, config: &PolicyConfig, boundaries: BucketBoundaries) -> PolicyState {
        let carry_table = boundaries == self.boundaries;
        let fresh = PolicyState::new(config, boundaries);
        fresh.epsilon.store(self.epsilon.load());
        fresh
            .observations
            .store(self.observations(), Ordering::Relaxed);
        fresh
            .last_retrain_ns
            .store(self.last_retrain_ns(), Ordering::Relaxed);

        if carry_table {
            for (bucket, padded) in self.cells.iter().enumerate() {
                for tier in Tier::ALL {
                    let source = &padded[tier.index()];
                    let target = &fresh.cells[bucket][tier.index()];
                    target.value.store(source.value.load());
                    target
                        .count
                        .store(source.count.load(Ordering::Relaxed), Ordering::Relaxed);
                    for i in 0..3 {
                        target.contribs[i].store(source.contribs[i].load());
                    }
                }
            }
        }
        fresh
    }

    /// Serializable copy for persistence
    pub fn to_snapshot(&self) -> PolicySnapshot {
        let cells = self
            .cells
            .iter()
            .map(|padded| {
                let mut snapshot = CellSnapshot::default();
                for tier in Tier::ALL {
                    let cell = &padded[tier.index()];
                    snapshot.values[tier.index()] = cell.value();
                    snapshot.counts[tier.index()] = cell.count();
                    snapshot.contribs[tier.index()] = cell.contributions();
                }
                snapshot
            })
            .collect();

        PolicySnapshot {
            epsilon: self.epsilon(),
            boundaries: self.boundaries.clone(),
            observations: self.observations(),
            last_retrain_ns: self.last_retrain_ns(),
            cells,
        }
    }

    /// Rebuild live state from a persisted snapshot
    pub fn from_snapshot(config: &PolicyConfig, snapshot: &PolicySnapshot) -> PolicyState {
        let state = PolicyState::new(config, snapshot.boundaries.clone());
        state.set_epsilon(snapshot.epsilon);
        state
            .observations
            .store(snapshot.observations, Ordering::Relaxed);
        state
            .last_retrain_ns
            .store(snapshot.last_retrain_ns, Ordering::Relaxed);

        for (bucket, persisted) in snapshot.cells.iter().enumerate() {
            if bucket >= state.cells.len() {
                break;
            }
            for tier in Tier::ALL {
                let cell = &state.cells[bucket][tier.index()];
                cell.value.store(persisted.values[tier.index()]);
                cell.count
                    .store(persisted.counts[tier.index()], Ordering::Relaxed);
                for i in 0..3 {
                    cell.contribs[i].store(persisted.contribs[tier.index()][i]);
                }
            }
        }
        state
    }
}

/// Persisted form of one table cell (all three tiers)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub values: [f64; 3],
    pub counts: [u64; 3],
    pub contribs: [[f64; 3]; 3],
}

/// Persisted form of the whole policy state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub epsilon: f64,
    pub boundaries: BucketBoundaries,
    pub observations: u64,
    pub last_retrain_ns: u64,
    pub cells: Vec<CellSnapshot>,
}
