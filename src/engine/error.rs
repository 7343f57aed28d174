//! Engine error taxonomy
//!
//! Hot-path errors are returned synchronously to the caller; background
//! errors (retrain faults, failed remediations) are absorbed internally and
//! only surfaced through statistics.

/// Errors produced by the storage engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed or empty key identifier, rejected before tracking
    InvalidKey(String),
    /// A retrain is already in flight; concurrent retrains are rejected
    AlreadyInProgress,
    /// A repair action did not clear its anomaly within the grace period
    RemediationFailed(String),
    /// Internal fault during retrain; previous policy state is preserved
    RetrainError(String),
    /// Configuration failed validation
    InvalidConfiguration(String),
    /// Persistence failure while saving or restoring engine state
    StateError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidKey(key) => write!(f, "Invalid key: {:?}", key),
            EngineError::AlreadyInProgress => write!(f, "Retrain already in progress"),
            EngineError::RemediationFailed(msg) => write!(f, "Remediation failed: {}", msg),
            EngineError::RetrainError(msg) => write!(f, "Retrain error: {}", msg),
            EngineError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
            EngineError::StateError(msg) => write!(f, "State error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Create an invalid-configuration error from a message
    pub fn invalid_config(msg: &str) -> Self {
        EngineError::InvalidConfiguration(msg.to_string())
    }

    /// Create a state error from a message
    pub fn state_error(msg: impl Into<String>) -> Self {
        EngineError::StateError(msg.into())
    }
}
