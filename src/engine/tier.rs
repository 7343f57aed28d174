//! Storage tiers and per-tier unit economics
//!
//! Three statically configured tiers form a strict total order by cost and
//! performance: Hot (memory) > Warm (compressed) > Cold (archived). The cost
//! model is a pure projection over key snapshots; rate-table updates are
//! atomic replacements, never partial.

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::engine::tracker::KeySnapshot;

/// Storage tier a key currently occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "hot")]
    Hot,
    #[serde(rename = "warm")]
    Warm,
    #[serde(rename = "cold")]
    Cold,
}

impl Tier {
    /// All tiers, ordered hottest first
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    /// Stable index used by the policy value table
    #[inline(always)]
    pub fn index(self) -> usize {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }

    /// Decode a tier from its stable index
    pub fn from_index(index: usize) -> Option<Tier> {
        match index {
            0 => Some(Tier::Hot),
            1 => Some(Tier::Warm),
            2 => Some(Tier::Cold),
            _ => None,
        }
    }

    /// Underlying storage class name surfaced to external consumers
    pub fn storage_class(self) -> &'static str {
        match self {
            Tier::Hot => "memory",
            Tier::Warm => "compressed",
            Tier::Cold => "archived",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Warm => write!(f, "warm"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

/// Expected latency class for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyClass {
    #[serde(rename = "sub_millisecond")]
    SubMillisecond,
    #[serde(rename = "low_millisecond")]
    LowMillisecond,
    #[serde(rename = "high_latency")]
    HighLatency,
}

impl std::fmt::Display for LatencyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatencyClass::SubMillisecond => write!(f, "sub-millisecond"),
            LatencyClass::LowMillisecond => write!(f, "low-millisecond"),
            LatencyClass::HighLatency => write!(f, "high-latency"),
        }
    }
}

/// Per-tier dollar rates, charged per GB per day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierRates {
    pub hot: f64,
    pub warm: f64,
    pub cold: f64,
}

impl Default for TierRates {
    fn default() -> Self {
        Self {
            hot: 0.10,
            warm: 0.03,
            cold: 0.01,
        }
    }
}

impl TierRates {
    #[inline(always)]
    pub fn for_tier(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Hot => self.hot,
            Tier::Warm => self.warm,
            Tier::Cold => self.cold,
        }
    }
}

/// Per-tier accumulated size and dollar cost, plus grand total
///
/// Always a projection recomputed from a tracker snapshot; field names match
/// the storage classes surfaced to external consumers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub memory_gb: f64,
    pub compressed_gb: f64,
    pub archived_gb: f64,
    pub memory: f64,
    pub compressed: f64,
    pub archived: f64,
    pub total: f64,
}

/// Catalog entry for an external storage provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    pub cost_per_gb: f64,
    pub latency: LatencyClass,
    pub supported_tiers: Vec<Tier>,
}

const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// Static lookup of per-tier unit economics
///
/// Rate updates replace the whole table in one atomic swap so concurrent
/// cost computations never observe a half-updated rate set.
#[derive(Debug)]
pub struct TierCostModel {
    rates: RwLock<Arc<TierRates>>,
}

impl Default for TierCostModel {
    fn default() -> Self {
        Self::new(TierRates::default())
    }
}

impl TierCostModel {
    pub fn new(rates: TierRates) -> Self {
        Self {
            rates: RwLock::new(Arc::new(rates)),
        }
    }

    /// Current dollar cost per GB-day for a tier
    #[inline]
    pub fn cost_per_gb(&self, tier: Tier) -> f64 {
        self.current_rates().for_tier(tier)
    }

    /// Expected latency class for a tier
    pub fn latency_class(&self, tier: Tier) -> LatencyClass {
        match tier {
            Tier::Hot => LatencyClass::SubMillisecond,
            Tier::Warm => LatencyClass::LowMillisecond,
            Tier::Cold => LatencyClass::HighLatency,
        }
    }

    /// Expected serving latency budget for a tier in milliseconds
    ///
    /// Hits slower than this budget earn only partial reward in the policy.
    #[inline(always)]
    pub fn expected_latency_ms(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Hot => 1.0,
            Tier::Warm => 20.0,
            Tier::Cold => 500.0,
        }
    }

    /// Replace the rate table atomically (administrative update)
    pub fn update_rates(&self, rates: TierRates) {
        let mut guard = self
            .rates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(rates);
    }

    fn current_rates(&self) -> Arc<TierRates> {
        self.rates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sum bytes-in-tier times cost-per-GB for every tier plus grand total
    pub fn compute_cost(&self, keys: &[KeySnapshot]) -> CostSnapshot {
        let rates = self.current_rates();
        let mut bytes = [0u64; 3];
        for key in keys {
            bytes[key.tier.index()] += key.size_bytes;
        }

        let memory_gb = bytes[Tier::Hot.index()] as f64 / BYTES_PER_GB;
        let compressed_gb = bytes[Tier::Warm.index()] as f64 / BYTES_PER_GB;
        let archived_gb = bytes[Tier::Cold.index()] as f64 / BYTES_PER_GB;

        let memory = memory_gb * rates.hot;
        let compressed = compressed_gb * rates.warm;
        let archived = archived_gb * rates.cold;

        CostSnapshot {
            memory_gb,
            compressed_gb,
            archived_gb,
            memory,
            compressed,
            archived,
            total: memory + compressed + archived,
        }
    }

    /// Catalog of known storage providers
    pub fn providers(&self) -> &'static [ProviderInfo] {
        &PROVIDERS
    }

    /// Cheapest provider that supports the given tier
    pub fn select_provider(&self, tier: Tier) -> Option<&'static ProviderInfo> {
        PROVIDERS
            .iter()
            .filter(|p| p.supported_tiers.contains(&tier))
            .min_by(|a, b| {
                a.cost_per_gb
                    .partial_cmp(&b.cost_per_gb)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

static PROVIDERS: Lazy<Vec<ProviderInfo>> = Lazy::new(|| {
    vec![
        ProviderInfo {
            name: "local-memory".to_string(),
            cost_per_gb: 0.10,
            latency: LatencyClass::SubMillisecond,
            supported_tiers: vec![Tier::Hot],
        },
        ProviderInfo {
            name: "block-compressed".to_string(),
            cost_per_gb: 0.03,
            latency: LatencyClass::LowMillisecond,
            supported_tiers: vec![Tier::Warm, Tier::Cold],
        },
        ProviderInfo {
            name: "object-archive".to_string(),
            cost_per_gb: 0.01,
            latency: LatencyClass::HighLatency,
            supported_tiers: vec![Tier::Cold],
        },
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(tier: Tier, size_bytes: u64) -> KeySnapshot {
        KeySnapshot {
            key: format!("{}-{}", tier, size_bytes),
            tier,
            size_bytes,
            access_count: 1,
            last_access_ns: 0,
            created_ns: 0,
            decayed_rate: 0.0,
        }
    }

    #[test]
    fn cost_is_additive_across_tiers() {
        let model = TierCostModel::default();
        let keys = vec![
            snap(Tier::Hot, 2 * 1_073_741_824),
            snap(Tier::Warm, 10 * 1_073_741_824),
            snap(Tier::Cold, 100 * 1_073_741_824),
            snap(Tier::Hot, 1_073_741_824),
        ];

        let cost = model.compute_cost(&keys);
        assert!((cost.total - (cost.memory + cost.compressed + cost.archived)).abs() < 1e-12);
        assert!((cost.memory - 0.30).abs() < 1e-9);
        assert!((cost.compressed - 0.30).abs() < 1e-9);
        assert!((cost.archived - 1.00).abs() < 1e-9);
    }

    #[test]
    fn rate_update_is_whole_table_swap() {
        let model = TierCostModel::default();
        model.update_rates(TierRates {
            hot: 0.20,
            warm: 0.05,
            cold: 0.02,
        });
        assert_eq!(model.cost_per_gb(Tier::Hot), 0.20);
        assert_eq!(model.cost_per_gb(Tier::Warm), 0.05);
        assert_eq!(model.cost_per_gb(Tier::Cold), 0.02);
    }

    #[test]
    fn cheapest_supporting_provider_selected() {
        let model = TierCostModel::default();
        let provider = model.select_provider(Tier::Cold).expect("cold provider");
        assert_eq!(provider.name, "object-archive");
        assert_eq!(model.select_provider(Tier::Hot).unwrap().name, "local-memory");
    }
}
