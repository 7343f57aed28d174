//! Stratum - Adaptive multi-tier storage engine
//!
//! An access-pattern-driven placement engine for hot, warm and cold storage
//! tiers. An epsilon-greedy policy learns per-workload value estimates from
//! observed serving outcomes, a cost model prices each tier, and background
//! loops retrain the policy and repair detected anomalies.
//!
//! # Features
//!
//! - **Multi-tier placement**: Hot, warm and cold tiers with learned decisions
//! - **Epsilon-greedy learning**: Exploration decays as value estimates mature
//! - **Explainable decisions**: Per-feature contributions sum to the estimate
//! - **Cost awareness**: Per-tier rates, provider catalog, cost projections
//! - **Self-repair**: Hit-rate collapse, cost drift and tier-thrash detection
//!   with automatic remediation
//! - **Lock-free hot path**: Sharded atomic key records, copy-then-swap policy

// Public API modules
pub mod prelude;
pub mod stratum;

// Engine implementation modules
pub mod engine;
pub mod telemetry;

// Re-export the public API at the crate root for convenience
pub use engine::error::EngineError;
pub use prelude::*;
pub use stratum::{Stratum, StratumBuilder};
