//! Wall-clock timestamp helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the UNIX epoch
#[inline(always)]
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Convert seconds to nanoseconds
#[inline(always)]
pub const fn secs_to_ns(secs: u64) -> u64 {
    secs * 1_000_000_000
}
