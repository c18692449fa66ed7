//! Error types for the sync engine.

use thiserror::Error;

/// Main error type for change-log operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid operation type: {0:?} (expected create, update or delete)")]
    InvalidOperationType(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Malformed cursor: {0:?}")]
    MalformedCursor(String),

    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("Invalid limit: {0:?}")]
    InvalidLimit(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Prune failed: {0}")]
    Prune(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,
}

impl SyncError {
    /// Caller-side input errors. These are never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidOperationType(_)
                | SyncError::UnknownEntityType(_)
                | SyncError::MalformedCursor(_)
                | SyncError::InvalidTimestamp(_)
                | SyncError::InvalidLimit(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
