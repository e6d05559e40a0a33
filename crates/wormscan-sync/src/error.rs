//! Error types for wormscan-sync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Call timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    #[error("Invalid range [{from}, {to}]: {reason}")]
    InvalidRange { from: u64, to: u64, reason: String },

    #[error("Malformed key {key:?}: {reason}")]
    MalformedKey { key: String, reason: String },

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Block {0} has been pruned by the node")]
    Pruned(u64),

    #[error("Permanent gap on chain {chain_id} emitter {emitter}: sequence {sequence} not found in [{from}, {to}]")]
    PermanentGap {
        chain_id: u16,
        emitter: String,
        sequence: u64,
        from: u64,
        to: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl SyncError {
    /// Errors that put a source into backoff and retry the same planned range.
    ///
    /// Store failures are retried like fetch failures: re-fetching a range is
    /// always cheaper than losing cursor durability.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientFetch(_) | SyncError::Timeout { .. } | SyncError::Store(_)
        )
    }

    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
