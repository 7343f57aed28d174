//! Stratum prelude - convenient imports for users

// Re-export the public API
pub use crate::stratum::{Stratum, StratumBuilder};

// Re-export the error type every fallible operation returns
pub use crate::engine::error::EngineError;

// Configuration types users hand to the builder
pub use crate::engine::config::{EngineConfig, PolicyKnobs};

// Types surfaced by decisions, metrics and explanations
pub use crate::engine::policy::{RetrainOutcome, SweepReport, TierDecision};
pub use crate::engine::repair::{Anomaly, AnomalyKind, RepairStats, RepairStrategy};
pub use crate::engine::tier::{CostSnapshot, ProviderInfo, Tier, TierRates};
pub use crate::engine::tracker::HotspotEntry;
pub use crate::telemetry::MetricsSnapshot;
