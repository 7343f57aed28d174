//! Durable engine state
//!
//! Key records, learned policy state and anomaly history survive process
//! restarts through a single binary snapshot file. Losing the file is
//! recoverable (the policy relearns) but discards learned value estimates,
//! so saves are written atomically via a temp file and rename.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::error::EngineError;
use crate::engine::policy::PolicySnapshot;
use crate::engine::repair::Anomaly;
use crate::engine::tracker::KeySnapshot;

const STATE_VERSION: u32 = 1;

/// Everything the engine persists across restarts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at_ns: u64,
    pub keys: Vec<KeySnapshot>,
    pub policy: PolicySnapshot,
    pub anomalies: Vec<Anomaly>,
}

impl PersistedState {
    pub fn new(
        saved_at_ns: u64,
        keys: Vec<KeySnapshot>,
        policy: PolicySnapshot,
        anomalies: Vec<Anomaly>,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at_ns,
            keys,
            policy,
            anomalies,
        }
    }
}

/// Write engine state to disk atomically
pub fn save(path: &Path, state: &PersistedState) -> Result<(), EngineError> {
    let bytes = bincode::serde::encode_to_vec(state, bincode::config::standard())
        .map_err(|e| EngineError::state_error(format!("encode failed: {}", e)))?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes)
        .map_err(|e| EngineError::state_error(format!("write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| EngineError::state_error(format!("rename {}: {}", path.display(), e)))?;

    log::info!(
        "saved engine state: {} keys, {} anomalies, {} bytes",
        state.keys.len(),
        state.anomalies.len(),
        bytes.len()
    );
    Ok(())
}

/// Read engine state back from disk
pub fn load(path: &Path) -> Result<PersistedState, EngineError> {
    let bytes = std::fs::read(path)
        .map_err(|e| EngineError::state_error(format!("read {}: {}", path.display(), e)))?;

    let (state, _): (PersistedState, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| EngineError::state_error(format!("decode failed: {}", e)))?;

    if state.version != STATE_VERSION {
        return Err(EngineError::state_error(format!(
            "unsupported state version {}",
            state.version
        )));
    }
    Ok(state)
}
