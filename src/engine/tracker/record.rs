//! Per-key access record with atomic concurrent access
//!
//! Records are updated lock-free on the hot path; readers observe a
//! consistent view per field and full consistency only through snapshots.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::engine::tier::Tier;

/// Access record for an individual key
#[derive(Debug)]
#[repr(align(64))]
pub struct KeyRecord {
    /// Monotonically non-decreasing access counter
    access_count: CachePadded<AtomicU64>,
    /// Timestamp of last access (nanoseconds since epoch)
    last_access_ns: CachePadded<AtomicU64>,
    /// Exponentially decayed access-rate estimate, stored as f64 bits
    rate_bits: CachePadded<AtomicU64>,
    /// Creation timestamp
    created_ns: u64,
    /// Size of the underlying data item
    size_bytes: AtomicU64,
    /// Current tier assignment
    tier: AtomicU8,
    /// Tier transitions inside the current thrash window
    transitions: AtomicU32,
    /// Start of the current thrash window
    thrash_window_start_ns: AtomicU64,
}

impl KeyRecord {
    pub fn new(now_ns: u64, size_bytes: u64, tier: Tier) -> Self {
        Self {
            access_count: CachePadded::new(AtomicU64::new(1)),
            last_access_ns: CachePadded::new(AtomicU64::new(now_ns)),
            rate_bits: CachePadded::new(AtomicU64::new(1.0f64.to_bits())),
            created_ns: now_ns,
            size_bytes: AtomicU64::new(size_bytes),
            tier: AtomicU8::new(tier.index() as u8),
            transitions: AtomicU32::new(0),
            thrash_window_start_ns: AtomicU64::new(now_ns),
        }
    }

    /// Record one access: bump the counter and fold the new event into the
    /// decayed rate estimate
    #[inline(always)]
    pub fn record_access(&self, now_ns: u64, size_bytes: u64, half_life_secs: f64) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        let previous_ns = self.last_access_ns.swap(now_ns, Ordering::Relaxed);
        self.size_bytes.store(size_bytes, Ordering::Relaxed);

        let dt_secs = now_ns.saturating_sub(previous_ns) as f64 / 1_000_000_000.0;
        let decay = (-dt_secs * std::f64::consts::LN_2 / half_life_secs).exp();

        // Decayed event count: each access adds one unit, prior mass decays
        // with the configured half-life. CAS loop keeps concurrent updates
        // from losing events.
        let mut current = self.rate_bits.load(Ordering::Relaxed);
        loop {
            let updated = (f64::from_bits(current) * decay + 1.0).to_bits();
            match self.rate_bits.compare_exchange_weak(
                current,
                updated,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Decayed rate as of `now_ns`, without mutating the record
    #[inline(always)]
    pub fn decayed_rate(&self, now_ns: u64, half_life_secs: f64) -> f64 {
        let stored = f64::from_bits(self.rate_bits.load(Ordering::Relaxed));
        let dt_secs =
            now_ns.saturating_sub(self.last_access_ns.load(Ordering::Relaxed)) as f64
                / 1_000_000_000.0;
        stored * (-dt_secs * std::f64::consts::LN_2 / half_life_secs).exp()
    }

    #[inline(always)]
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn last_access_ns(&self) -> u64 {
        self.last_access_ns.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn created_ns(&self) -> u64 {
        self.created_ns
    }

    #[inline(always)]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn tier(&self) -> Tier {
        Tier::from_index(self.tier.load(Ordering::Relaxed) as usize).unwrap_or(Tier::Warm)
    }

    /// Move the key to a new tier, counting the transition inside the
    /// sliding thrash window. Returns whether the tier actually changed.
    pub fn set_tier(&self, tier: Tier, now_ns: u64, window_ns: u64) -> bool {
        let previous = self.tier.swap(tier.index() as u8, Ordering::Relaxed);
        if previous as usize == tier.index() {
            return false;
        }

        let window_start = self.thrash_window_start_ns.load(Ordering::Relaxed);
        if now_ns.saturating_sub(window_start) > window_ns {
            self.thrash_window_start_ns.store(now_ns, Ordering::Relaxed);
            self.transitions.store(1, Ordering::Relaxed);
        } else {
            self.transitions.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Tier transitions observed inside the current thrash window
    pub fn transitions_in_window(&self, now_ns: u64, window_ns: u64) -> u32 {
        let window_start = self.thrash_window_start_ns.load(Ordering::Relaxed);
        if now_ns.saturating_sub(window_start) > window_ns {
            0
        } else {
            self.transitions.load(Ordering::Relaxed)
        }
    }

    /// Restore a record from a persisted snapshot
    pub fn from_snapshot(snapshot: &KeySnapshot) -> Self {
        Self {
            access_count: CachePadded::new(AtomicU64::new(snapshot.access_count)),
            last_access_ns: CachePadded::new(AtomicU64::new(snapshot.last_access_ns)),
            rate_bits: CachePadded::new(AtomicU64::new(snapshot.decayed_rate.to_bits())),
            created_ns: snapshot.created_ns,
            size_bytes: AtomicU64::new(snapshot.size_bytes),
            tier: AtomicU8::new(snapshot.tier.index() as u8),
            transitions: AtomicU32::new(0),
            thrash_window_start_ns: AtomicU64::new(snapshot.last_access_ns),
        }
    }
}

/// Immutable point-in-time view of one key record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub key: String,
    pub tier: Tier,
    pub size_bytes: u64,
    pub access_count: u64,
    pub last_access_ns: u64,
    pub created_ns: u64,
    /// Decayed rate evaluated at snapshot time
    pub decayed_rate: f64,
}
