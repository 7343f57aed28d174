//! Core engine: tracking, placement policy, cost model, retraining,
//! anomaly repair and persistence

pub mod config;
pub mod error;
pub mod persist;
pub mod policy;
pub mod repair;
pub mod retrain;
pub mod tier;
pub mod time;
pub mod tracker;
