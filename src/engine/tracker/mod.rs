//! Access tracking with lock-free concurrent key records
//!
//! The tracker records per-key access events, derives hotspot rankings and
//! produces immutable snapshots for retraining and cost computation. Keys
//! are sharded through `DashMap` so unrelated keys never contend.

mod record;

pub use record::{KeyRecord, KeySnapshot};

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::engine::config::TrackerConfig;
use crate::engine::error::EngineError;
use crate::engine::tier::Tier;

/// One entry in a hotspot ranking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotspotEntry {
    pub key: String,
    pub access_count: u64,
    pub last_access_ns: u64,
}

/// Point-in-time copy of all tracked key records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub taken_at_ns: u64,
    pub keys: Vec<KeySnapshot>,
}

/// Concurrent per-key access tracker
#[derive(Debug)]
pub struct AccessTracker {
    records: DashMap<String, Arc<KeyRecord>>,
    config: TrackerConfig,
}

impl AccessTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            records: DashMap::with_capacity(config.max_tracked_keys.min(16_384)),
            config,
        }
    }

    /// Record an access event for a key
    ///
    /// Creates the record on first access (initial tier Warm until the
    /// policy decides otherwise); every subsequent access bumps the counter
    /// and refreshes the decayed rate estimate. Empty keys are rejected.
    pub fn record_access(
        &self,
        key: &str,
        size_bytes: u64,
        now_ns: u64,
    ) -> Result<Arc<KeyRecord>, EngineError> {
        if key.trim().is_empty() {
            return Err(EngineError::InvalidKey(key.to_string()));
        }

        if let Some(existing) = self.records.get(key) {
            existing.record_access(now_ns, size_bytes, self.config.rate_half_life_secs);
            return Ok(existing.clone());
        }

        if self.records.len() >= self.config.max_tracked_keys {
            self.evict_oldest();
        }

        let record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyRecord::new(now_ns, size_bytes, Tier::Warm)));
        Ok(record.clone())
    }

    /// Look up a tracked key
    pub fn get(&self, key: &str) -> Option<Arc<KeyRecord>> {
        self.records.get(key).map(|entry| entry.clone())
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Top-N keys by decayed access rate
    ///
    /// Ties resolve by descending access count, then ascending key, so the
    /// ranking is deterministic over a frozen snapshot.
    pub fn hotspots(&self, top_n: usize, now_ns: u64) -> Vec<HotspotEntry> {
        let half_life = self.config.rate_half_life_secs;
        let mut ranked: Vec<(f64, HotspotEntry)> = self
            .records
            .iter()
            .map(|entry| {
                let record = entry.value();
                (
                    record.decayed_rate(now_ns, half_life),
                    HotspotEntry {
                        key: entry.key().clone(),
                        access_count: record.access_count(),
                        last_access_ns: record.last_access_ns(),
                    },
                )
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.access_count.cmp(&a.1.access_count))
                .then_with(|| a.1.key.cmp(&b.1.key))
        });

        ranked
            .into_iter()
            .take(top_n)
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Immutable copy of all key records at a point in time
    pub fn snapshot(&self, now_ns: u64) -> TrackerSnapshot {
        let half_life = self.config.rate_half_life_secs;
        let keys = self
            .records
            .iter()
            .map(|entry| {
                let record = entry.value();
                KeySnapshot {
                    key: entry.key().clone(),
                    tier: record.tier(),
                    size_bytes: record.size_bytes(),
                    access_count: record.access_count(),
                    last_access_ns: record.last_access_ns(),
                    created_ns: record.created_ns(),
                    decayed_rate: record.decayed_rate(now_ns, half_life),
                }
            })
            .collect();

        TrackerSnapshot {
            taken_at_ns: now_ns,
            keys,
        }
    }

    /// Apply a tier decision to a tracked key
    ///
    /// Returns whether the tier actually changed. Tier changes happen only
    /// through this path so every move is attributable to a decision.
    pub fn apply_tier(&self, key: &str, tier: Tier, now_ns: u64) -> bool {
        let window_ns = self.config.thrash_window_secs * 1_000_000_000;
        match self.records.get(key) {
            Some(record) => record.set_tier(tier, now_ns, window_ns),
            None => false,
        }
    }

    /// Keys whose transition count exceeds the thrash limit
    pub fn thrashing_keys(&self, limit: u32, now_ns: u64) -> Vec<String> {
        let window_ns = self.config.thrash_window_secs * 1_000_000_000;
        self.records
            .iter()
            .filter(|entry| entry.value().transitions_in_window(now_ns, window_ns) > limit)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Rebuild tracked records from persisted snapshots
    pub fn restore(&self, keys: &[KeySnapshot]) {
        for snapshot in keys {
            self.records.insert(
                snapshot.key.clone(),
                Arc::new(KeyRecord::from_snapshot(snapshot)),
            );
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // O(n), only runs when the tracker is at capacity
    fn evict_oldest(&self) {
        let mut oldest_key: Option<String> = None;
        let mut oldest_ns = u64::MAX;
        for entry in self.records.iter() {
            let last = entry.value().last_access_ns();
            if last < oldest_ns {
                oldest_ns = last;
                oldest_key = Some(entry.key().clone());
            }
        }
        if let Some(key) = oldest_key {
            self.records.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn tracker() -> AccessTracker {
        AccessTracker::new(TrackerConfig::default())
    }

    #[test]
    fn empty_key_is_rejected() {
        let tracker = tracker();
        assert!(matches!(
            tracker.record_access("", 64, SEC),
            Err(EngineError::InvalidKey(_))
        ));
        assert!(matches!(
            tracker.record_access("   ", 64, SEC),
            Err(EngineError::InvalidKey(_))
        ));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn hotspots_rank_by_rate_then_count_then_key() {
        let tracker = tracker();
        // "hot" accessed 100 times recently, "cool" once long ago
        for i in 0..100u64 {
            tracker.record_access("hot", 64, 1000 * SEC + i * SEC / 2).unwrap();
        }
        tracker.record_access("cool", 64, SEC).unwrap();

        let now = 1050 * SEC;
        let top = tracker.hotspots(2, now);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].key, "hot");
        assert_eq!(top[1].key, "cool");
    }

    #[test]
    fn equal_rate_ties_resolve_by_count_then_key() {
        let tracker = tracker();
        // Identical timing for all three keys: identical decayed rates
        for key in ["b", "a", "c"] {
            tracker.record_access(key, 64, 100 * SEC).unwrap();
        }
        // "c" gets one extra access at the same instant as the others' last
        tracker.record_access("c", 64, 100 * SEC).unwrap();

        let top = tracker.hotspots(3, 101 * SEC);
        assert_eq!(top[0].key, "c");
        assert_eq!(top[1].key, "a");
        assert_eq!(top[2].key, "b");
    }

    #[test]
    fn capacity_evicts_least_recently_accessed() {
        let tracker = AccessTracker::new(TrackerConfig {
            max_tracked_keys: 3,
            ..TrackerConfig::default()
        });
        tracker.record_access("old", 64, SEC).unwrap();
        tracker.record_access("mid", 64, 2 * SEC).unwrap();
        tracker.record_access("new", 64, 3 * SEC).unwrap();
        tracker.record_access("overflow", 64, 4 * SEC).unwrap();

        assert_eq!(tracker.len(), 3);
        assert!(tracker.get("old").is_none());
        assert!(tracker.get("overflow").is_some());
    }

    #[test]
    fn snapshot_is_detached_from_live_records() {
        let tracker = tracker();
        tracker.record_access("k", 64, SEC).unwrap();
        let snapshot = tracker.snapshot(2 * SEC);
        tracker.record_access("k", 64, 3 * SEC).unwrap();

        assert_eq!(snapshot.keys.len(), 1);
        assert_eq!(snapshot.keys[0].access_count, 1);
        assert_eq!(tracker.get("k").unwrap().access_count(), 2);
    }

    #[test]
    fn tier_changes_only_through_apply() {
        let tracker = tracker();
        tracker.record_access("k", 64, SEC).unwrap();
        assert_eq!(tracker.get("k").unwrap().tier(), Tier::Warm);
        assert!(tracker.apply_tier("k", Tier::Hot, 2 * SEC));
        assert_eq!(tracker.get("k").unwrap().tier(), Tier::Hot);
        assert!(!tracker.apply_tier("missing", Tier::Hot, 2 * SEC));
    }
}
